//! Audio subsystem
//!
//! Decoding, resampling, the sink interface with its software mixer, and the
//! cpal device output.

pub mod automation;
pub mod decode;
pub mod mixer;
pub mod output;
pub mod resampler;
pub mod sink;
pub mod types;

pub use automation::GainAutomation;
pub use decode::{DecodeInput, SegmentDecoder, SymphoniaDecoder};
pub use mixer::MixerSink;
pub use output::AudioOutput;
pub use resampler::Resampler;
pub use sink::{AudioSink, SinkEvent, VoiceId};
pub use types::PcmBuffer;
