//! Segment decoding using symphonia
//!
//! Decodes one whole segment from memory into an interleaved stereo
//! [`PcmBuffer`] at the sink's sample rate.
//!
//! # Supported Formats
//!
//! Per Cargo.toml symphonia features: MP3, FLAC, AAC, MP4/M4A, Vorbis, and
//! WAV/PCM (symphonia defaults).
//!
//! # Sample Format
//! - Output: Stereo f32 samples (interleaved: [L, R, L, R, ...])
//! - Mono sources: duplicated to stereo
//! - Multi-channel: even channels averaged into left, odd into right

use crate::audio::{PcmBuffer, Resampler};
use crate::error::{Error, Result};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Bytes handed to a decoder.
///
/// Owned outright: every decode works on its own copy of the segment bytes,
/// so nothing a decoder does can reach the catalog's buffer.
#[derive(Debug, Clone)]
pub struct DecodeInput {
    pub bytes: Vec<u8>,
    /// File extension hint for format probing (e.g. "mp3")
    pub extension: Option<String>,
}

impl DecodeInput {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            extension: None,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }
}

/// Platform decode step: compressed bytes in, PCM out.
///
/// Runs on a blocking thread, never on the scheduler task.
pub trait SegmentDecoder: Send + Sync + 'static {
    fn decode(&self, input: DecodeInput) -> Result<PcmBuffer>;
}

/// symphonia + rubato decoder producing buffers at `target_rate`
#[derive(Debug, Clone)]
pub struct SymphoniaDecoder {
    target_rate: u32,
}

impl SymphoniaDecoder {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Fold `channels`-wide interleaved samples to stereo
    fn to_stereo(interleaved: &[f32], channels: usize) -> Vec<f32> {
        match channels {
            0 => Vec::new(),
            1 => interleaved.iter().flat_map(|&s| [s, s]).collect(),
            2 => interleaved.to_vec(),
            n => {
                let mut out = Vec::with_capacity(interleaved.len() / n * 2);
                let left_count = n.div_ceil(2) as f32;
                let right_count = (n / 2) as f32;
                for frame in interleaved.chunks_exact(n) {
                    let (mut l, mut r) = (0.0f32, 0.0f32);
                    for (ch, &s) in frame.iter().enumerate() {
                        if ch % 2 == 0 {
                            l += s;
                        } else {
                            r += s;
                        }
                    }
                    out.push(l / left_count);
                    out.push(r / right_count);
                }
                out
            }
        }
    }
}

impl SegmentDecoder for SymphoniaDecoder {
    fn decode(&self, input: DecodeInput) -> Result<PcmBuffer> {
        let byte_len = input.bytes.len();
        let mss = MediaSourceStream::new(Box::new(Cursor::new(input.bytes)), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = input.extension.as_deref() {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::Decode(format!("Unrecognized format: {}", e)))?;
        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| Error::Decode("No audio track found".to_string()))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let native_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode("Track has no sample rate".to_string()))?;

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Unsupported codec: {}", e)))?;

        let mut stereo: Vec<f32> = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(Error::Decode(format!("Failed to read packet: {}", e))),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(Error::Decode(format!("Decode failed: {}", e))),
            };

            let spec = *decoded.spec();
            let buf = sample_buf.get_or_insert_with(|| {
                SampleBuffer::<f32>::new(decoded.capacity() as u64, spec)
            });
            if (buf.capacity() as u64) < decoded.capacity() as u64 * spec.channels.count() as u64
            {
                *buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            }
            buf.copy_interleaved_ref(decoded);
            stereo.extend(Self::to_stereo(buf.samples(), spec.channels.count()));
        }

        if stereo.is_empty() {
            return Err(Error::Decode("Stream contained no audio".to_string()));
        }

        let samples = Resampler::resample(
            &stereo,
            native_rate,
            self.target_rate,
            PcmBuffer::CHANNELS as u16,
        )?;
        let pcm = PcmBuffer::new(samples, self.target_rate);

        debug!(
            "Decoded {} bytes: {} frames at {}Hz ({:.3}s)",
            byte_len,
            pcm.frames(),
            self.target_rate,
            pcm.duration()
        );

        Ok(pcm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_duplicated() {
        assert_eq!(
            SymphoniaDecoder::to_stereo(&[0.1, 0.2], 1),
            vec![0.1, 0.1, 0.2, 0.2]
        );
    }

    #[test]
    fn test_multichannel_downmix() {
        // 4 channels: L = mean(ch0, ch2), R = mean(ch1, ch3)
        let out = SymphoniaDecoder::to_stereo(&[0.2, 0.4, 0.6, 0.8], 4);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.4).abs() < 1e-6);
        assert!((out[1] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_garbage_bytes_fail() {
        let decoder = SymphoniaDecoder::new(44_100);
        let result = decoder.decode(DecodeInput::new(vec![0x42; 512]));
        assert!(matches!(result, Err(Error::Decode(_))));
    }
}
