//! Per-voice gain automation
//!
//! A sorted list of automation points evaluated at arbitrary sink times.
//! Steps hold their value until the next point; ramps interpolate from the
//! previous point (time and value) to their own end point.

use galleria_common::RampCurve;

#[derive(Debug, Clone, Copy, PartialEq)]
enum PointKind {
    Step,
    Ramp(RampCurve),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct AutomationPoint {
    time: f64,
    value: f32,
    kind: PointKind,
}

/// Gain envelope of one voice
#[derive(Debug, Clone)]
pub struct GainAutomation {
    /// Value and time every point list starts from
    base_value: f32,
    base_time: f64,
    points: Vec<AutomationPoint>,
}

impl Default for GainAutomation {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl GainAutomation {
    pub fn new(initial: f32) -> Self {
        Self {
            base_value: initial,
            base_time: 0.0,
            points: Vec::new(),
        }
    }

    /// Step to `value` at `time`
    pub fn set_value_at_time(&mut self, value: f32, time: f64) {
        self.insert(AutomationPoint {
            time,
            value,
            kind: PointKind::Step,
        });
    }

    /// Ramp to `value` ending at `end`.
    ///
    /// `now` anchors the ramp when no earlier point exists.
    pub fn ramp_to(&mut self, curve: RampCurve, value: f32, end: f64, now: f64) {
        if self.points.is_empty() && now > self.base_time {
            self.base_value = self.value_at(now);
            self.base_time = now;
        }
        self.insert(AutomationPoint {
            time: end,
            value,
            kind: PointKind::Ramp(curve),
        });
    }

    /// Gain at sink time `t`
    pub fn value_at(&self, t: f64) -> f32 {
        let mut prev_time = self.base_time;
        let mut prev_value = self.base_value;

        for point in &self.points {
            if t < point.time {
                return match point.kind {
                    PointKind::Step => prev_value,
                    PointKind::Ramp(curve) => {
                        let span = point.time - prev_time;
                        if span <= 0.0 {
                            prev_value
                        } else {
                            curve.interpolate(prev_value, point.value, (t - prev_time) / span)
                        }
                    }
                };
            }
            prev_time = point.time;
            prev_value = point.value;
        }

        prev_value
    }

    /// True when no point lies after `t`
    pub fn is_settled_at(&self, t: f64) -> bool {
        self.points.last().map_or(true, |p| p.time <= t)
    }

    /// Fold every point at or before `t` into the base value
    pub fn prune_before(&mut self, t: f64) {
        let passed = self.points.iter().take_while(|p| p.time <= t).count();
        if passed == 0 {
            return;
        }
        let last = self.points[passed - 1];
        self.base_time = last.time;
        self.base_value = last.value;
        self.points.drain(..passed);
    }

    // Keeps insertion order among points sharing a time
    fn insert(&mut self, point: AutomationPoint) {
        let idx = self.points.partition_point(|p| p.time <= point.time);
        self.points.insert(idx, point);
    }
}
