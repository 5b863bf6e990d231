//! Core audio data types
//!
//! Defines the decoded PCM buffer handed from the decoder to the sink.

/// Decoded audio ready for playback.
///
/// **Format:**
/// - Samples are f32 (floating point -1.0 to 1.0)
/// - Stereo interleaved: [L, R, L, R, ...]
/// - Sample rate matches the sink after resampling
///
/// Never mutated once constructed; voices share it through `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    /// PCM audio samples (interleaved stereo)
    samples: Vec<f32>,

    /// Sample rate in Hz
    sample_rate: u32,
}

impl PcmBuffer {
    /// Number of interleaved channels in every buffer
    pub const CHANNELS: usize = 2;

    /// Create a buffer from interleaved stereo samples
    ///
    /// A trailing odd sample (half a frame) is dropped.
    pub fn new(mut samples: Vec<f32>, sample_rate: u32) -> Self {
        let whole = samples.len() - samples.len() % Self::CHANNELS;
        samples.truncate(whole);
        Self {
            samples,
            sample_rate,
        }
    }

    /// Buffer of `frames` stereo frames with every sample set to `value`
    pub fn constant(value: f32, frames: usize, sample_rate: u32) -> Self {
        Self::new(vec![value; frames * Self::CHANNELS], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of stereo frames
    pub fn frames(&self) -> usize {
        self.samples.len() / Self::CHANNELS
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Left/right samples of one frame
    #[inline]
    pub fn frame(&self, index: usize) -> Option<(f32, f32)> {
        let i = index * Self::CHANNELS;
        match (self.samples.get(i), self.samples.get(i + 1)) {
            (Some(&l), Some(&r)) => Some((l, r)),
            _ => None,
        }
    }
}
