//! Software mixer sink
//!
//! Sums every started voice into the output block at sample accuracy. The
//! clock is the number of frames rendered so far, so `now()` advances only as
//! fast as the device (or an offline test) pulls audio.
//!
//! Cloning a `MixerSink` yields another handle to the same mixer: the audio
//! callback renders through one clone while the scheduler drives another.

use crate::audio::automation::GainAutomation;
use crate::audio::sink::{AudioSink, SinkEvent, VoiceId};
use crate::audio::PcmBuffer;
use crate::error::{Error, Result};
use galleria_common::RampCurve;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct VoiceState {
    buffer: Arc<PcmBuffer>,
    /// Absolute frame at which the voice becomes audible
    start_frame: Option<u64>,
    /// First buffer frame played at `start_frame`
    offset_frames: u64,
    gain: GainAutomation,
    ended: bool,
}

struct MixerState {
    sample_rate: u32,
    frames_rendered: u64,
    next_voice: u64,
    voices: BTreeMap<VoiceId, VoiceState>,
    events: Option<mpsc::UnboundedSender<SinkEvent>>,
}

impl MixerState {
    fn now(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    fn seconds_to_frames(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }

    fn voice_mut(&mut self, voice: VoiceId) -> Result<&mut VoiceState> {
        self.voices
            .get_mut(&voice)
            .ok_or(Error::UnknownVoice(voice.0))
    }
}

/// Shared software mixer implementing [`AudioSink`]
#[derive(Clone)]
pub struct MixerSink {
    state: Arc<Mutex<MixerState>>,
}

impl MixerSink {
    /// Mixer without ended notifications
    pub fn new(sample_rate: u32) -> Self {
        Self::build(sample_rate, None)
    }

    /// Mixer plus the receiver its ended notifications arrive on
    pub fn with_events(sample_rate: u32) -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::build(sample_rate, Some(tx)), rx)
    }

    fn build(sample_rate: u32, events: Option<mpsc::UnboundedSender<SinkEvent>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState {
                sample_rate: sample_rate.max(1),
                frames_rendered: 0,
                next_voice: 1,
                voices: BTreeMap::new(),
                events,
            })),
        }
    }

    // Poisoned lock: recover the inner state
    fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    /// Fill an interleaved output block and advance the clock.
    ///
    /// `channels` is the device channel count. Stereo voices fold to mono for
    /// a one-channel device; channels past the second stay silent.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        out.fill(0.0);
        let block_frames = (out.len() / channels) as u64;
        if block_frames == 0 {
            return;
        }

        let mut state = self.lock();
        let block_start = state.frames_rendered;
        let rate = state.sample_rate as f64;
        let mut ended = Vec::new();

        for (id, voice) in state.voices.iter_mut() {
            let Some(start_frame) = voice.start_frame else {
                continue;
            };
            if voice.ended || start_frame >= block_start + block_frames {
                continue;
            }

            voice.gain.prune_before(block_start as f64 / rate);
            let total = voice.buffer.frames() as u64;
            let first = start_frame.saturating_sub(block_start);

            for i in first..block_frames {
                let abs = block_start + i;
                let pos = voice.offset_frames + (abs - start_frame);
                if pos >= total {
                    voice.ended = true;
                    break;
                }
                let Some((l, r)) = voice.buffer.frame(pos as usize) else {
                    voice.ended = true;
                    break;
                };
                let gain = voice.gain.value_at(abs as f64 / rate);
                let base = i as usize * channels;
                if channels == 1 {
                    out[base] += (l + r) * 0.5 * gain;
                } else {
                    out[base] += l * gain;
                    out[base + 1] += r * gain;
                }
            }

            // Also catches a voice whose last frame was the final frame of this block
            if !voice.ended
                && voice.offset_frames + (block_start + block_frames - start_frame) >= total
            {
                voice.ended = true;
            }
            if voice.ended {
                ended.push(*id);
            }
        }

        state.frames_rendered += block_frames;

        if let Some(tx) = &state.events {
            for id in ended {
                if tx.send(SinkEvent::VoiceEnded(id)).is_err() {
                    debug!("Ended notification for {} dropped: no receiver", id);
                }
            }
        }
    }

    /// Render `frames` stereo frames offline and return them
    pub fn render_frames(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * PcmBuffer::CHANNELS];
        self.render(&mut out, PcmBuffer::CHANNELS);
        out
    }

    /// Advance the clock to at least `seconds`, discarding output
    pub fn advance_to(&self, seconds: f64) {
        let target = self.lock().seconds_to_frames(seconds);
        const BLOCK: u64 = 4096;
        loop {
            let rendered = self.lock().frames_rendered;
            if rendered >= target {
                break;
            }
            let frames = (target - rendered).min(BLOCK) as usize;
            self.render_frames(frames);
        }
    }

    /// Gain the voice would have at sink time `t`
    pub fn gain_at(&self, voice: VoiceId, t: f64) -> Option<f32> {
        self.lock().voices.get(&voice).map(|v| v.gain.value_at(t))
    }

    /// Voices that are started and not yet ended
    pub fn active_voice_count(&self) -> usize {
        self.lock()
            .voices
            .values()
            .filter(|v| v.start_frame.is_some() && !v.ended)
            .count()
    }

    /// Voices still connected to the mix
    pub fn voice_count(&self) -> usize {
        self.lock().voices.len()
    }
}

impl AudioSink for MixerSink {
    fn now(&self) -> f64 {
        self.lock().now()
    }

    fn create_voice(&mut self, buffer: Arc<PcmBuffer>) -> Result<VoiceId> {
        let mut state = self.lock();
        if buffer.sample_rate() != state.sample_rate {
            return Err(Error::AudioOutput(format!(
                "Buffer rate {}Hz does not match mixer rate {}Hz",
                buffer.sample_rate(),
                state.sample_rate
            )));
        }
        let id = VoiceId(state.next_voice);
        state.next_voice += 1;
        state.voices.insert(
            id,
            VoiceState {
                buffer,
                start_frame: None,
                offset_frames: 0,
                gain: GainAutomation::default(),
                ended: false,
            },
        );
        Ok(id)
    }

    fn start(&mut self, voice: VoiceId, at: f64, offset: f64) -> Result<()> {
        let mut state = self.lock();
        let earliest = state.frames_rendered;
        let start_frame = state.seconds_to_frames(at).max(earliest);
        let offset_frames = state.seconds_to_frames(offset);
        let v = state.voice_mut(voice)?;
        if v.start_frame.is_some() {
            warn!("{} started twice; keeping first start", voice);
            return Ok(());
        }
        v.start_frame = Some(start_frame);
        v.offset_frames = offset_frames;
        Ok(())
    }

    fn set_gain_at_time(&mut self, voice: VoiceId, value: f32, at: f64) -> Result<()> {
        self.lock().voice_mut(voice)?.gain.set_value_at_time(value, at);
        Ok(())
    }

    fn ramp_gain_exponential_to(&mut self, voice: VoiceId, value: f32, end: f64) -> Result<()> {
        let mut state = self.lock();
        let now = state.now();
        state
            .voice_mut(voice)?
            .gain
            .ramp_to(RampCurve::Exponential, value, end, now);
        Ok(())
    }

    fn disconnect(&mut self, voice: VoiceId) {
        self.lock().voices.remove(&voice);
    }
}
