//! Audio output sink interface
//!
//! The scheduler never touches samples. It talks to a sink that owns a
//! monotonic clock and a set of voices, each voice playing one decoded buffer
//! from a future start time with its own gain automation.

use crate::audio::PcmBuffer;
use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Handle to one voice created on a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voice-{}", self.0)
    }
}

/// Notifications raised by the sink outside of any call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    /// The voice played through the end of its buffer.
    ///
    /// Raised at most once per voice. Never raised for a voice that was
    /// disconnected first.
    VoiceEnded(VoiceId),
}

/// Timeline-aware audio output.
///
/// All times are in seconds on the sink's own clock. Gain automation follows
/// the usual audio-graph rules: values hold until the next event, a ramp runs
/// from the previous event's time and value up to its own end time.
pub trait AudioSink: Send {
    /// Current sink clock in seconds. Monotonic.
    fn now(&self) -> f64;

    /// Register a voice that will play `buffer`. The voice is silent until
    /// [`AudioSink::start`] is called.
    fn create_voice(&mut self, buffer: Arc<PcmBuffer>) -> Result<VoiceId>;

    /// Begin playback at sink time `at`, `offset` seconds into the buffer.
    ///
    /// A start time already in the past starts immediately.
    fn start(&mut self, voice: VoiceId, at: f64, offset: f64) -> Result<()>;

    /// Step the voice gain to `value` at sink time `at`
    fn set_gain_at_time(&mut self, voice: VoiceId, value: f32, at: f64) -> Result<()>;

    /// Exponential ramp from the previous automation point to `value`,
    /// arriving at sink time `end`
    fn ramp_gain_exponential_to(&mut self, voice: VoiceId, value: f32, end: f64) -> Result<()>;

    /// Remove the voice from the mix. Unknown voices are ignored.
    fn disconnect(&mut self, voice: VoiceId);
}
