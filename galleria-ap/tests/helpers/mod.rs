//! Shared fixtures for galleria-ap integration tests
//!
//! - `FakeDecoder`: constant-level PCM whose level is read from the segment
//!   bytes, so every segment is recognizable in a rendered mix
//! - `level_catalog`: ready-to-play catalog built from (gallery, iterations)
//! - `wav_bytes`: in-memory WAV generated with hound

#![allow(dead_code)]

use galleria_ap::audio::{DecodeInput, MixerSink, PcmBuffer, SegmentDecoder};
use galleria_ap::catalog::{Segment, SegmentCatalog};
use galleria_ap::error::{Error, Result};
use galleria_ap::playback::{spawn_engine, PlaybackHandle, Scheduler, SchedulerConfig};
use galleria_common::{EventBus, PlayerEvent, SegmentKey};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::f32::consts::PI;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Sample rate used by the offline mixer tests (1 frame = 1 ms)
pub const TEST_RATE: u32 = 1000;

/// Decoder double: every segment decodes to `frames` frames at the level
/// `bytes[0] / 100`
pub struct FakeDecoder {
    pub frames: usize,
    pub sample_rate: u32,
}

impl FakeDecoder {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            sample_rate: TEST_RATE,
        }
    }
}

impl SegmentDecoder for FakeDecoder {
    fn decode(&self, input: DecodeInput) -> Result<PcmBuffer> {
        let level = match input.bytes.first() {
            Some(&b) => b as f32 / 100.0,
            None => return Err(Error::Decode("empty segment".into())),
        };
        Ok(PcmBuffer::constant(level, self.frames, self.sample_rate))
    }
}

/// Level byte for a segment: `gallery_idx * 40 + (iteration + 1) * 10`
pub fn level_byte(gallery_idx: usize, iteration: u32) -> u8 {
    (gallery_idx as u32 * 40 + (iteration + 1) * 10).min(255) as u8
}

/// Level a segment decodes to under [`FakeDecoder`]
pub fn level_of(gallery_idx: usize, iteration: u32) -> f32 {
    level_byte(gallery_idx, iteration) as f32 / 100.0
}

/// Catalog where every segment is downloaded.
///
/// `nominal_ms` is the manifest duration; it only matters for gallery clock
/// projection.
pub fn level_catalog(galleries: &[(&str, u32)], nominal_ms: f64) -> Arc<SegmentCatalog> {
    let mut segments = Vec::new();
    for (g_idx, (gallery, iterations)) in galleries.iter().enumerate() {
        for iteration in 0..*iterations {
            let key = SegmentKey::new(*gallery, iteration);
            let seg = Segment::new(
                key,
                iteration * galleries.len() as u32 + g_idx as u32,
                format!("{}/{:02}.wav", gallery, iteration),
                nominal_ms,
            );
            seg.set_bytes(Arc::from(vec![level_byte(g_idx, iteration)]));
            segments.push(seg);
        }
    }
    Arc::new(SegmentCatalog::from_segments(segments).unwrap())
}

/// 16-bit PCM WAV with a sine at `freq` on every channel
pub fn wav_bytes(sample_rate: u32, channels: u16, frames: usize, freq: f32) -> Vec<u8> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let sample = ((2.0 * PI * freq * t).sin() * 0.5 * i16::MAX as f32) as i16;
            for _ in 0..channels {
                writer.write_sample(sample).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Left-channel sample of frame `frame` in an interleaved stereo block
pub fn left(block: &[f32], frame: usize) -> f32 {
    block[frame * 2]
}

pub fn approx(a: f32, b: f32, tol: f32) -> bool {
    (a - b).abs() <= tol
}

/// Engine over an offline mixer with 0.5 s fake segments
pub struct TestEngine {
    pub handle: PlaybackHandle,
    pub mixer: MixerSink,
    pub task: JoinHandle<()>,
}

pub fn spawn_test_engine(catalog: Arc<SegmentCatalog>) -> TestEngine {
    let (mixer, ended) = MixerSink::with_events(TEST_RATE);
    let scheduler = Scheduler::new(
        mixer.clone(),
        catalog,
        SchedulerConfig::default(),
        EventBus::new(1024),
        None,
    );
    let (handle, task) = spawn_engine(scheduler, Arc::new(FakeDecoder::new(500)), Some(ended));
    TestEngine {
        handle,
        mixer,
        task,
    }
}

/// Poll the engine until an event matching `pred` arrives (2 s limit)
pub async fn wait_for_event<F>(
    handle: &PlaybackHandle,
    rx: &mut broadcast::Receiver<PlayerEvent>,
    mut pred: F,
) -> PlayerEvent
where
    F: FnMut(&PlayerEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match tokio::time::timeout(Duration::from_millis(20), rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event bus closed"),
            Err(_) => handle.poll_now().await.unwrap(),
        }
        assert!(Instant::now() < deadline, "timed out waiting for event");
    }
}
