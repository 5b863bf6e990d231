//! Sink double that records every call against a hand-set clock

use crate::audio::{AudioSink, PcmBuffer, VoiceId};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainCall {
    Set { value: f32, at: f64 },
    ExpRamp { value: f32, end: f64 },
}

#[derive(Debug, Clone)]
pub struct RecordedVoice {
    pub buffer: Arc<PcmBuffer>,
    /// (at, offset) of the start call
    pub start: Option<(f64, f64)>,
    pub gains: Vec<GainCall>,
    pub connected: bool,
}

#[derive(Default)]
struct Recorded {
    now: f64,
    next_id: u64,
    voices: BTreeMap<VoiceId, RecordedVoice>,
}

/// Cloneable handle; all clones share one record
#[derive(Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    pub fn set_now(&self, now: f64) {
        self.inner.lock().unwrap().now = now;
    }

    pub fn voice(&self, id: VoiceId) -> RecordedVoice {
        self.inner.lock().unwrap().voices[&id].clone()
    }

    /// Number of voices ever created
    pub fn created(&self) -> usize {
        self.inner.lock().unwrap().voices.len()
    }

    /// Every voice ever created, in creation order
    pub fn voices(&self) -> Vec<RecordedVoice> {
        self.inner.lock().unwrap().voices.values().cloned().collect()
    }

    pub fn connected(&self) -> Vec<VoiceId> {
        self.inner
            .lock()
            .unwrap()
            .voices
            .iter()
            .filter(|(_, v)| v.connected)
            .map(|(id, _)| *id)
            .collect()
    }

    fn with_voice<T>(&self, id: VoiceId, f: impl FnOnce(&mut RecordedVoice) -> T) -> Result<T> {
        let mut inner = self.inner.lock().unwrap();
        match inner.voices.get_mut(&id) {
            Some(voice) if voice.connected => Ok(f(voice)),
            _ => Err(Error::UnknownVoice(id.0)),
        }
    }
}

impl AudioSink for RecordingSink {
    fn now(&self) -> f64 {
        self.inner.lock().unwrap().now
    }

    fn create_voice(&mut self, buffer: Arc<PcmBuffer>) -> Result<VoiceId> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = VoiceId(inner.next_id);
        inner.voices.insert(
            id,
            RecordedVoice {
                buffer,
                start: None,
                gains: Vec::new(),
                connected: true,
            },
        );
        Ok(id)
    }

    fn start(&mut self, voice: VoiceId, at: f64, offset: f64) -> Result<()> {
        self.with_voice(voice, |v| v.start = Some((at, offset)))
    }

    fn set_gain_at_time(&mut self, voice: VoiceId, value: f32, at: f64) -> Result<()> {
        self.with_voice(voice, |v| v.gains.push(GainCall::Set { value, at }))
    }

    fn ramp_gain_exponential_to(&mut self, voice: VoiceId, value: f32, end: f64) -> Result<()> {
        self.with_voice(voice, |v| v.gains.push(GainCall::ExpRamp { value, end }))
    }

    fn disconnect(&mut self, voice: VoiceId) {
        if let Some(v) = self.inner.lock().unwrap().voices.get_mut(&voice) {
            v.connected = false;
        }
    }
}
