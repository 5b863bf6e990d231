//! Gain ramp curves
//!
//! Interpolation used by per-voice gain automation. The scheduler only issues
//! exponential ramps (they sound even to the ear and never touch true zero);
//! linear ramps exist for automation written by hand.

use serde::{Deserialize, Serialize};

/// Ramp shape between two automation points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampCurve {
    /// v(t) = v0 + (v1 - v0) × t
    Linear,

    /// v(t) = v0 × (v1 / v0)^t
    ///
    /// Both endpoints must be strictly positive. Otherwise the start value is
    /// held for the whole ramp and the end value applies once it completes.
    Exponential,
}

impl RampCurve {
    /// Interpolated value at `progress` (0.0 = ramp start, 1.0 = ramp end)
    ///
    /// `progress` is clamped to [0.0, 1.0].
    pub fn interpolate(&self, from: f32, to: f32, progress: f64) -> f32 {
        let t = progress.clamp(0.0, 1.0);

        match self {
            RampCurve::Linear => (from as f64 + (to as f64 - from as f64) * t) as f32,
            RampCurve::Exponential => {
                if from <= 0.0 || to <= 0.0 {
                    return if t >= 1.0 { to } else { from };
                }
                let ratio = to as f64 / from as f64;
                (from as f64 * ratio.powf(t)) as f32
            }
        }
    }

    /// Parse curve from a configuration string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Some(RampCurve::Linear),
            "exponential" | "exp" => Some(RampCurve::Exponential),
            _ => None,
        }
    }
}

impl Default for RampCurve {
    fn default() -> Self {
        RampCurve::Exponential
    }
}
