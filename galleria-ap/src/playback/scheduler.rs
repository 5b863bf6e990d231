//! Playback scheduler
//!
//! Owns the timeline: the primary voice (the one whose iteration is
//! reported), at most one pending successor spliced onto the primary's end,
//! and the voices still fading out after a switch.
//!
//! The scheduler is a plain synchronous state machine. It never decodes; it
//! queues [`DecodeJob`]s and is told about results through
//! [`Scheduler::on_decoded`]. The engine task drives it, so there is exactly
//! one writer and no lock around the voice set.
//!
//! # Timeline
//!
//! Every voice carries a `logical_start`: the sink time at which offset 0 of
//! its iteration would have played. The successor of a voice is scheduled at
//! `logical_start + buffer_duration`, which is the exact frame the primary
//! runs out on, whatever offset the primary started at.
//!
//! # Stale results
//!
//! - Switch completions carry a sequence number. Only the latest request
//!   is applied.
//! - Successor completions and pending voices carry the generation they were
//!   requested under. Every change of primary bumps the generation.

use crate::audio::{AudioSink, DecodeInput, PcmBuffer, VoiceId};
use crate::catalog::SegmentCatalog;
use crate::error::{Error, Result};
use galleria_common::{EventBus, GalleryId, PlaybackStatus, PlayerEvent, SegmentKey};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Gain a fading voice steps to right before its exponential ramp
const FADE_START_GAIN: f32 = 0.9999;

/// Tolerance when comparing sink times
const CLOCK_EPSILON: f64 = 1e-6;

/// Timing parameters of the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Delay between a switch being applied and the new voice sounding (s)
    pub preroll: f64,
    /// Fade-in of a spliced successor (s)
    pub splice_fade_in: f64,
    /// Fade-out of outgoing voices on an iteration switch (s)
    pub switch_fade_out: f64,
    /// Symmetric crossfade on a gallery switch (s)
    pub gallery_crossfade: f64,
    /// Gain treated as silence; exponential ramps cannot reach zero
    pub silence_floor: f32,
    /// Keep decoded PCM in the catalog and reuse it
    pub cache_decoded: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            preroll: 0.1,
            splice_fade_in: 0.1,
            switch_fade_out: 0.3,
            gallery_crossfade: 1.0,
            silence_floor: 1e-5,
            cache_decoded: false,
        }
    }
}

/// A segment scheduled on the sink
#[derive(Debug, Clone, PartialEq)]
pub struct Voice {
    pub segment: SegmentKey,
    /// Sink time at which offset 0 of the segment would have played
    pub logical_start: f64,
    /// Sink time at which the voice becomes audible
    pub starts_at: f64,
    pub buffer_duration: f64,
    pub handle: VoiceId,
}

impl Voice {
    /// Sink time at which the buffer runs out
    pub fn ends_at(&self) -> f64 {
        self.logical_start + self.buffer_duration
    }

    /// Elapsed offset into the segment at sink time `t`
    pub fn offset_at(&self, t: f64) -> f64 {
        (t - self.logical_start).clamp(0.0, self.buffer_duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchKind {
    /// Jump within the current gallery: outgoing fades, incoming is instant
    Iteration,
    /// Change gallery: symmetric crossfade
    Gallery,
}

/// How a switch picks its starting offset once the PCM is available
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anchor {
    /// Start at offset 0
    Origin,
    /// Elapsed time since the current primary's logical start
    FollowPrimary,
    /// Elapsed time since this sink time
    Fixed(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodePurpose {
    Switch {
        seq: u64,
        kind: SwitchKind,
        anchor: Anchor,
    },
    Successor {
        generation: u64,
        /// Sink time at which offset 0 of the successor plays
        logical_start: f64,
    },
}

/// Identifies what a decode result is for
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeTicket {
    pub segment: SegmentKey,
    pub purpose: DecodePurpose,
}

/// Work for the decoder: a ticket plus a private copy of the bytes
#[derive(Debug)]
pub struct DecodeJob {
    pub ticket: DecodeTicket,
    pub input: DecodeInput,
}

#[derive(Debug)]
struct Pending {
    voice: Voice,
    generation: u64,
}

#[derive(Debug)]
struct Retiring {
    handle: VoiceId,
    retire_at: f64,
}

/// Where a gallery's timeline was when it was left
#[derive(Debug, Clone, Copy, PartialEq)]
struct GalleryClock {
    iteration: u32,
    logical_start: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct InFlight {
    segment: SegmentKey,
    kind: SwitchKind,
}

/// Gapless, crossfading scheduler over an [`AudioSink`]
pub struct Scheduler<S: AudioSink> {
    sink: S,
    catalog: Arc<SegmentCatalog>,
    config: SchedulerConfig,
    events: EventBus,

    gallery: Option<GalleryId>,
    primary: Option<Voice>,
    pending: Option<Pending>,
    retiring: Vec<Retiring>,

    generation: u64,
    switch_seq: u64,
    in_flight: Option<InFlight>,
    /// Generation for which a successor decode was already requested
    successor_attempt: Option<u64>,

    gallery_clocks: HashMap<GalleryId, GalleryClock>,
    jobs: VecDeque<DecodeJob>,
    last_status: Option<PlaybackStatus>,
}

impl<S: AudioSink> Scheduler<S> {
    /// Create an idle scheduler.
    ///
    /// `gallery` selects the gallery iteration requests apply to; `None`
    /// picks the first gallery in the catalog.
    pub fn new(
        sink: S,
        catalog: Arc<SegmentCatalog>,
        config: SchedulerConfig,
        events: EventBus,
        gallery: Option<GalleryId>,
    ) -> Self {
        let gallery = gallery.or_else(|| catalog.galleries().into_iter().next());
        Self {
            sink,
            catalog,
            config,
            events,
            gallery,
            primary: None,
            pending: None,
            retiring: Vec::new(),
            generation: 0,
            switch_seq: 0,
            in_flight: None,
            successor_attempt: None,
            gallery_clocks: HashMap::new(),
            jobs: VecDeque::new(),
            last_status: None,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn catalog(&self) -> &Arc<SegmentCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn gallery(&self) -> Option<&GalleryId> {
        self.gallery.as_ref()
    }

    pub fn primary(&self) -> Option<&Voice> {
        self.primary.as_ref()
    }

    pub fn pending(&self) -> Option<&Voice> {
        self.pending.as_ref().map(|p| &p.voice)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Status from the most recent tick
    pub fn last_status(&self) -> Option<&PlaybackStatus> {
        self.last_status.as_ref()
    }

    /// Status at the current sink time
    pub fn status(&self) -> Option<PlaybackStatus> {
        self.status_at(self.sink.now())
    }

    fn status_at(&self, now: f64) -> Option<PlaybackStatus> {
        self.primary.as_ref().map(|p| PlaybackStatus {
            gallery: p.segment.gallery.clone(),
            iteration: p.segment.iteration,
            offset: p.offset_at(now),
        })
    }

    /// Next queued decode, oldest first
    pub fn next_decode_job(&mut self) -> Option<DecodeJob> {
        self.jobs.pop_front()
    }

    pub fn queued_jobs(&self) -> usize {
        self.jobs.len()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Jump to `target` within the current gallery
    pub fn request_iteration_change(&mut self, target: u32) -> Result<()> {
        let gallery = self
            .gallery
            .clone()
            .ok_or_else(|| Error::UnknownGallery("no gallery selected".to_string()))?;
        let key = SegmentKey::new(gallery, target);
        let anchor = if self.primary.is_some() {
            Anchor::FollowPrimary
        } else {
            Anchor::Origin
        };
        self.request_switch(key, SwitchKind::Iteration, anchor)
    }

    /// Crossfade to `target` gallery, keeping its timeline position
    pub fn request_gallery_change(&mut self, target: GalleryId) -> Result<()> {
        let total = self
            .catalog
            .total_iterations(&target)
            .ok_or_else(|| Error::UnknownGallery(target.to_string()))?;

        if let Some(flight) = &self.in_flight {
            if flight.kind == SwitchKind::Gallery && flight.segment.gallery == target {
                debug!("Switch to gallery {} already in flight", target);
                return Ok(());
            }
        }
        let playing_target = self
            .primary
            .as_ref()
            .is_some_and(|p| p.segment.gallery == target);
        if playing_target {
            debug!("Already playing gallery {}", target);
            self.cancel_in_flight();
            return Ok(());
        }

        let at = self.sink.now() + self.config.preroll;
        let (iteration, anchor) = match self.gallery_clocks.get(&target).copied() {
            Some(clock) => {
                let (iteration, logical_start) = self.project_clock(&target, clock, at);
                (iteration, Anchor::Fixed(logical_start))
            }
            None => match &self.primary {
                Some(p) => (p.segment.iteration % total, Anchor::FollowPrimary),
                None => (0, Anchor::Origin),
            },
        };

        self.request_switch(SegmentKey::new(target, iteration), SwitchKind::Gallery, anchor)
    }

    fn request_switch(&mut self, key: SegmentKey, kind: SwitchKind, anchor: Anchor) -> Result<()> {
        let catalog = Arc::clone(&self.catalog);
        let segment = catalog
            .get(&key)
            .ok_or_else(|| Error::UnknownSegment(key.clone()))?;

        if self.primary.as_ref().is_some_and(|p| p.segment == key) {
            debug!("Already playing {}", key);
            self.cancel_in_flight();
            return Ok(());
        }
        if self.in_flight.as_ref().is_some_and(|f| f.segment == key) {
            debug!("Switch to {} already in flight", key);
            return Ok(());
        }
        if !segment.is_ready() {
            return Err(Error::SegmentNotReady(key));
        }

        self.switch_seq += 1;
        self.in_flight = Some(InFlight {
            segment: key.clone(),
            kind,
        });
        info!("Switch #{} to {} ({:?})", self.switch_seq, key, kind);

        self.submit(DecodeTicket {
            segment: key,
            purpose: DecodePurpose::Switch {
                seq: self.switch_seq,
                kind,
                anchor,
            },
        })
    }

    // Any completion of the current in-flight switch becomes stale
    fn cancel_in_flight(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            debug!("Cancelling in-flight switch to {}", flight.segment);
            self.switch_seq += 1;
        }
    }

    /// Queue a decode, or resolve it at once from the decoded cache
    fn submit(&mut self, ticket: DecodeTicket) -> Result<()> {
        let catalog = Arc::clone(&self.catalog);
        if self.config.cache_decoded {
            if let Some(pcm) = catalog.get(&ticket.segment).and_then(|s| s.decoded()) {
                debug!("Using cached PCM for {}", ticket.segment);
                self.on_decoded(ticket, Ok(pcm));
                return Ok(());
            }
        }
        let input = catalog.bytes_for_decode(&ticket.segment)?;
        self.jobs.push_back(DecodeJob { ticket, input });
        Ok(())
    }

    /// Walk a left gallery's clock forward to sink time `at` using the
    /// nominal segment durations
    fn project_clock(&self, gallery: &GalleryId, clock: GalleryClock, at: f64) -> (u32, f64) {
        let Some(total) = self.catalog.total_iterations(gallery) else {
            return (clock.iteration, clock.logical_start);
        };
        let nominal = |iteration: u32| {
            self.catalog
                .get(&SegmentKey::new(gallery.clone(), iteration))
                .map_or(0.0, |s| s.duration_ms / 1000.0)
        };

        let mut iteration = clock.iteration % total;
        let mut logical_start = clock.logical_start;

        let ring: Option<f64> = (0..total).map(nominal).try_fold(0.0, |acc, d| {
            (d > 0.0).then_some(acc + d)
        });
        if let Some(ring) = ring {
            let laps = ((at - logical_start) / ring).floor();
            if laps > 1.0 {
                logical_start += (laps - 1.0) * ring;
            }
        }

        loop {
            let duration = nominal(iteration);
            if duration <= 0.0 || at - logical_start < duration {
                break;
            }
            logical_start += duration;
            iteration = (iteration + 1) % total;
        }

        (iteration, logical_start)
    }

    /// The segment after `segment` whose window holds sink time `at`, given
    /// that `segment` runs out at `ends_at`
    fn successor_window(&self, segment: &SegmentKey, ends_at: f64, at: f64) -> Option<(SegmentKey, f64)> {
        let next = self.catalog.successor_of(segment)?;
        if at <= ends_at {
            return Some((next, ends_at));
        }
        let clock = GalleryClock {
            iteration: next.iteration,
            logical_start: ends_at,
        };
        let (iteration, logical_start) = self.project_clock(&next.gallery, clock, at);
        Some((SegmentKey::new(next.gallery, iteration), logical_start))
    }

    // ------------------------------------------------------------------
    // Completions and notifications
    // ------------------------------------------------------------------

    /// Result of a decode job
    pub fn on_decoded(&mut self, ticket: DecodeTicket, result: Result<Arc<PcmBuffer>>) {
        if let Ok(pcm) = &result {
            if self.config.cache_decoded {
                self.catalog.store_decoded(&ticket.segment, Arc::clone(pcm));
            }
        }

        match ticket.purpose {
            DecodePurpose::Switch { seq, kind, anchor } => {
                if seq != self.switch_seq {
                    debug!("Discarding stale switch #{} to {}", seq, ticket.segment);
                    return;
                }
                self.in_flight = None;
                let outcome =
                    result.and_then(|pcm| self.apply_switch(ticket.segment.clone(), kind, anchor, pcm));
                if let Err(e) = outcome {
                    self.report_failure(&ticket.segment, &e);
                }
            }
            DecodePurpose::Successor {
                generation,
                logical_start,
            } => {
                if generation != self.generation {
                    debug!(
                        "Discarding stale successor {} (generation {} != {})",
                        ticket.segment, generation, self.generation
                    );
                    return;
                }
                let outcome = result
                    .and_then(|pcm| self.apply_successor(ticket.segment.clone(), logical_start, pcm));
                if let Err(e) = outcome {
                    self.report_failure(&ticket.segment, &e);
                }
            }
        }
    }

    fn report_failure(&self, segment: &SegmentKey, error: &Error) {
        warn!("Abandoning {}: {}", segment, error);
        self.events.emit_lossy(PlayerEvent::SwitchFailed {
            segment: segment.clone(),
            reason: error.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    /// The sink reports a voice played through its buffer
    pub fn on_voice_ended(&mut self, voice: VoiceId) {
        if self.primary.as_ref().is_some_and(|p| p.handle == voice) {
            if self.pending.is_some() {
                self.promote();
            } else {
                debug!("Primary {} ended with no successor scheduled", voice);
            }
            self.release(voice);
            return;
        }

        if self.pending.as_ref().is_some_and(|p| p.voice.handle == voice) {
            self.promote();
            return;
        }

        if self.retiring.iter().any(|r| r.handle == voice) {
            self.release(voice);
            return;
        }

        debug!("Ignoring ended notification for {}", voice);
    }

    /// Segment bytes changed; retry a successor that was waiting on them
    pub fn on_catalog_updated(&mut self) {
        self.schedule_successor();
    }

    /// One status poll: promote a due successor, retire faded voices,
    /// retry a missing successor, and report status.
    pub fn tick(&mut self) -> Option<PlaybackStatus> {
        let now = self.sink.now();

        let due = self
            .pending
            .as_ref()
            .is_some_and(|p| now + CLOCK_EPSILON >= p.voice.starts_at);
        if due {
            self.promote();
        }

        self.sweep(now);
        self.schedule_successor();

        let status = self.status_at(now);
        if let Some(status) = &status {
            self.events.emit_lossy(PlayerEvent::PlaybackStatus {
                status: status.clone(),
                timestamp: chrono::Utc::now(),
            });
        }
        self.last_status = status.clone();
        status
    }

    // ------------------------------------------------------------------
    // Timeline changes
    // ------------------------------------------------------------------

    fn apply_switch(
        &mut self,
        segment: SegmentKey,
        kind: SwitchKind,
        anchor: Anchor,
        pcm: Arc<PcmBuffer>,
    ) -> Result<()> {
        let duration = pcm.duration();
        if duration <= 0.0 {
            return Err(Error::Decode(format!("{} decoded to no audio", segment)));
        }

        let start = self.sink.now() + self.config.preroll;
        let offset = match anchor {
            Anchor::Origin => 0.0,
            Anchor::FollowPrimary => self
                .primary
                .as_ref()
                .map_or(0.0, |p| (start - p.logical_start).rem_euclid(duration)),
            Anchor::Fixed(logical_start) => {
                if start - logical_start >= duration {
                    // The anchored iteration is over; follow the clock onward
                    if let Some((key, next_start)) =
                        self.successor_window(&segment, logical_start + duration, start)
                    {
                        if key != segment {
                            return self.rekey_switch(segment, key, kind, next_start);
                        }
                    }
                }
                (start - logical_start).rem_euclid(duration)
            }
        };

        let handle = self.sink.create_voice(pcm)?;
        let prepared = match kind {
            SwitchKind::Iteration => self.sink.start(handle, start, offset),
            SwitchKind::Gallery => self.fade_in(handle, start, offset, self.config.gallery_crossfade),
        };
        if let Err(e) = prepared {
            self.sink.disconnect(handle);
            return Err(e);
        }

        let fade = match kind {
            SwitchKind::Iteration => self.config.switch_fade_out,
            SwitchKind::Gallery => self.config.gallery_crossfade,
        };
        if let Some(old) = self.primary.take() {
            if old.segment.gallery != segment.gallery {
                self.gallery_clocks.insert(
                    old.segment.gallery.clone(),
                    GalleryClock {
                        iteration: old.segment.iteration,
                        logical_start: old.logical_start,
                    },
                );
            }
            self.fade_out(old, start, fade);
        }
        if let Some(pending) = self.pending.take() {
            self.fade_out(pending.voice, start, fade);
        }

        self.gallery_clocks.remove(&segment.gallery);
        self.gallery = Some(segment.gallery.clone());
        self.generation += 1;
        self.successor_attempt = None;

        info!(
            "Switched to {} at {:.3} (offset {:.3}s)",
            segment, start, offset
        );
        self.events.emit_lossy(PlayerEvent::SwitchApplied {
            segment: segment.clone(),
            offset,
            starts_at: start,
            crossfade: kind == SwitchKind::Gallery,
            timestamp: chrono::Utc::now(),
        });

        self.primary = Some(Voice {
            segment,
            logical_start: start - offset,
            starts_at: start,
            buffer_duration: duration,
            handle,
        });
        self.schedule_successor();
        Ok(())
    }

    /// Replace the in-flight switch to `expired` with one to `key`
    fn rekey_switch(
        &mut self,
        expired: SegmentKey,
        key: SegmentKey,
        kind: SwitchKind,
        logical_start: f64,
    ) -> Result<()> {
        info!("{} ended before it could start; switching to {} instead", expired, key);
        self.in_flight = Some(InFlight {
            segment: key.clone(),
            kind,
        });
        let queued = self.submit(DecodeTicket {
            segment: key,
            purpose: DecodePurpose::Switch {
                seq: self.switch_seq,
                kind,
                anchor: Anchor::Fixed(logical_start),
            },
        });
        if queued.is_err() {
            self.in_flight = None;
        }
        queued
    }

    fn apply_successor(&mut self, segment: SegmentKey, at: f64, pcm: Arc<PcmBuffer>) -> Result<()> {
        if self.primary.is_none() || self.pending.is_some() {
            return Ok(());
        }
        let duration = pcm.duration();
        if duration <= 0.0 {
            return Err(Error::Decode(format!("{} decoded to no audio", segment)));
        }

        let now = self.sink.now();
        if now - at >= duration {
            let Some((next, next_start)) = self.successor_window(&segment, at + duration, now) else {
                return Ok(());
            };
            warn!("Successor {} ended before it could start; skipping to {}", segment, next);
            if !self.catalog.get(&next).is_some_and(|s| s.is_ready()) {
                // Retried from the primary's clock once bytes arrive
                self.successor_attempt = None;
                return Ok(());
            }
            return self.submit(DecodeTicket {
                segment: next,
                purpose: DecodePurpose::Successor {
                    generation: self.generation,
                    logical_start: next_start,
                },
            });
        }

        let (start, offset) = if at >= now { (at, 0.0) } else { (now, now - at) };
        if offset > 0.0 {
            warn!("Successor {} is {:.3}s late", segment, offset);
        }

        let handle = self.sink.create_voice(pcm)?;
        if let Err(e) = self.fade_in(handle, start, offset, self.config.splice_fade_in) {
            self.sink.disconnect(handle);
            return Err(e);
        }

        debug!("Successor {} scheduled at {:.3}", segment, start);
        self.pending = Some(Pending {
            voice: Voice {
                segment,
                logical_start: at,
                starts_at: start,
                buffer_duration: duration,
                handle,
            },
            generation: self.generation,
        });
        Ok(())
    }

    fn fade_in(&mut self, handle: VoiceId, start: f64, offset: f64, fade: f64) -> Result<()> {
        self.sink.set_gain_at_time(handle, self.config.silence_floor, start)?;
        self.sink.ramp_gain_exponential_to(handle, 1.0, start + fade)?;
        self.sink.start(handle, start, offset)
    }

    /// Fade `voice` out from `start`, or drop it if it would never be heard
    fn fade_out(&mut self, voice: Voice, start: f64, fade: f64) {
        if voice.starts_at + CLOCK_EPSILON >= start {
            debug!("Dropping {} before it sounds", voice.segment);
            self.sink.disconnect(voice.handle);
            return;
        }

        let fade_end = start + fade;
        let ramp = self
            .sink
            .set_gain_at_time(voice.handle, FADE_START_GAIN, start)
            .and_then(|_| {
                self.sink
                    .ramp_gain_exponential_to(voice.handle, self.config.silence_floor, fade_end)
            });
        if let Err(e) = ramp {
            warn!("Could not fade {}: {}", voice.segment, e);
            self.sink.disconnect(voice.handle);
            return;
        }

        self.retiring.push(Retiring {
            handle: voice.handle,
            retire_at: fade_end.min(voice.ends_at()),
        });
    }

    /// Pending successor becomes primary
    fn promote(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if pending.generation != self.generation {
            self.sink.disconnect(pending.voice.handle);
            return;
        }

        let to = pending.voice.segment.iteration;
        let retire_at = pending.voice.starts_at;
        let old = self.primary.replace(pending.voice);
        let from = old.as_ref().map(|v| v.segment.iteration);
        if let Some(old) = old {
            self.retiring.push(Retiring {
                handle: old.handle,
                retire_at,
            });
        }

        self.generation += 1;
        self.successor_attempt = None;

        if let (Some(from), Some(gallery)) = (from, self.gallery.clone()) {
            info!("Rolled over {} #{:02} -> #{:02}", gallery, from, to);
            self.events.emit_lossy(PlayerEvent::IterationRolledOver {
                gallery,
                from_iteration: from,
                to_iteration: to,
                timestamp: chrono::Utc::now(),
            });
        }
        self.schedule_successor();
    }

    /// Request the successor decode for the current primary if none is
    /// pending or in progress
    fn schedule_successor(&mut self) {
        let Some(primary) = &self.primary else {
            return;
        };
        if self.pending.is_some() || self.successor_attempt == Some(self.generation) {
            return;
        }

        let now = self.sink.now();
        let Some((next, logical_start)) = self.successor_window(&primary.segment, primary.ends_at(), now) else {
            warn!("{} has no successor in the catalog", primary.segment);
            self.successor_attempt = Some(self.generation);
            return;
        };
        if !self.catalog.get(&next).is_some_and(|s| s.is_ready()) {
            debug!("Successor {} not downloaded yet", next);
            return;
        }

        self.successor_attempt = Some(self.generation);
        let ticket = DecodeTicket {
            segment: next,
            purpose: DecodePurpose::Successor {
                generation: self.generation,
                logical_start,
            },
        };
        if let Err(e) = self.submit(ticket) {
            warn!("Could not queue successor decode: {}", e);
        }
    }

    fn sweep(&mut self, now: f64) {
        let sink = &mut self.sink;
        self.retiring.retain(|r| {
            if now + CLOCK_EPSILON >= r.retire_at {
                sink.disconnect(r.handle);
                false
            } else {
                true
            }
        });
    }

    fn release(&mut self, voice: VoiceId) {
        self.retiring.retain(|r| r.handle != voice);
        self.sink.disconnect(voice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Segment;
    use crate::playback::test_support::{GainCall, RecordingSink};
    use tokio::sync::broadcast;

    const SEGMENT_MS: f64 = 64_320.0;

    fn catalog(galleries: &[(&str, u32)]) -> Arc<SegmentCatalog> {
        let segments = galleries.iter().flat_map(|&(gallery, count)| {
            (0..count).map(move |i| {
                let seg = Segment::new(
                    SegmentKey::new(gallery, i),
                    i,
                    format!("{}/{:02}.mp3", gallery, i),
                    SEGMENT_MS,
                );
                seg.set_bytes(Arc::from(vec![i as u8; 8]));
                seg
            })
        });
        Arc::new(SegmentCatalog::from_segments(segments).unwrap())
    }

    fn pcm() -> Arc<PcmBuffer> {
        // 64.32s at 1kHz
        Arc::new(PcmBuffer::constant(0.1, 64_320, 1000))
    }

    fn scheduler(cat: Arc<SegmentCatalog>) -> (Scheduler<RecordingSink>, RecordingSink, EventBus) {
        let sink = RecordingSink::default();
        let events = EventBus::new(256);
        let s = Scheduler::new(
            sink.clone(),
            cat,
            SchedulerConfig::default(),
            events.clone(),
            Some(GalleryId::new("study")),
        );
        (s, sink, events)
    }

    /// Complete every queued decode successfully
    fn run_jobs(s: &mut Scheduler<RecordingSink>) -> Vec<SegmentKey> {
        let mut decoded = Vec::new();
        while let Some(job) = s.next_decode_job() {
            decoded.push(job.ticket.segment.clone());
            s.on_decoded(job.ticket, Ok(pcm()));
        }
        decoded
    }

    fn drain(rx: &mut broadcast::Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    /// No voice may start past the end of its own buffer
    fn assert_started_within_buffers(sink: &RecordingSink) {
        for voice in sink.voices() {
            if let Some((_, offset)) = voice.start {
                assert!(
                    offset < voice.buffer.duration(),
                    "voice started {}s into a {}s buffer",
                    offset,
                    voice.buffer.duration()
                );
            }
        }
    }

    /// Start iteration 0 of "study" audible at sink time 100.0
    fn playing_from_100() -> (Scheduler<RecordingSink>, RecordingSink, EventBus) {
        let (mut s, sink, events) = scheduler(catalog(&[("study", 16)]));
        sink.set_now(99.9);
        s.request_iteration_change(0).unwrap();
        run_jobs(&mut s);
        (s, sink, events)
    }

    #[test]
    fn test_idle_request_starts_at_origin_after_preroll() {
        let (s, sink, _) = playing_from_100();
        let primary = s.primary().unwrap();
        assert_eq!(primary.segment, SegmentKey::new("study", 0));
        assert!(approx(primary.starts_at, 100.0));
        assert!(approx(primary.logical_start, 100.0));

        let (at, offset) = sink.voice(primary.handle).start.unwrap();
        assert!(approx(at, 100.0));
        assert_eq!(offset, 0.0);
        // Iteration switches never ramp the incoming voice
        assert!(sink.voice(primary.handle).gains.is_empty());
    }

    #[test]
    fn test_successor_spliced_at_exact_end() {
        let (s, sink, _) = playing_from_100();
        let pending = s.pending().unwrap();
        assert_eq!(pending.segment, SegmentKey::new("study", 1));
        assert!(approx(pending.logical_start, 164.32));

        let recorded = sink.voice(pending.handle);
        let (at, offset) = recorded.start.unwrap();
        assert!(approx(at, 164.32));
        assert_eq!(offset, 0.0);
        assert_eq!(recorded.gains.len(), 2);
        assert!(matches!(recorded.gains[0], GainCall::Set { value, at } if value == 1e-5 && approx(at, 164.32)));
        assert!(matches!(recorded.gains[1], GainCall::ExpRamp { value, end } if value == 1.0 && approx(end, 164.42)));
    }

    #[test]
    fn test_rollover_reported_at_boundary() {
        let (mut s, sink, events) = playing_from_100();
        let mut rx = events.subscribe();

        sink.set_now(164.0);
        let status = s.tick().unwrap();
        assert_eq!(status.iteration, 0);
        assert!((status.offset - 64.0).abs() < 1e-9);

        sink.set_now(164.32);
        let status = s.tick().unwrap();
        assert_eq!(status.iteration, 1);
        assert!(status.offset.abs() < 1e-6);
        assert!(approx(s.primary().unwrap().logical_start, 164.32));

        let rolled = drain(&mut rx).into_iter().any(|e| {
            matches!(e, PlayerEvent::IterationRolledOver { from_iteration: 0, to_iteration: 1, .. })
        });
        assert!(rolled);

        // The next successor is requested straight away
        assert_eq!(run_jobs(&mut s), vec![SegmentKey::new("study", 2)]);
        assert!(approx(s.pending().unwrap().logical_start, 164.32 + 64.32));
    }

    #[test]
    fn test_rollover_detected_by_poll_after_boundary() {
        let (mut s, sink, _) = scheduler(catalog(&[("study", 16)]));
        s.request_iteration_change(0).unwrap();
        run_jobs(&mut s);
        let t0 = s.primary().unwrap().starts_at;

        sink.set_now(t0 + 64.2);
        assert_eq!(s.tick().unwrap().iteration, 0);

        sink.set_now(t0 + 64.4);
        let status = s.tick().unwrap();
        assert_eq!(status.iteration, 1);
        assert!((status.offset - 0.08).abs() < 1e-6);
    }

    #[test]
    fn test_ended_notification_promotes() {
        let (mut s, sink, _) = playing_from_100();
        let old = s.primary().unwrap().handle;
        let next = s.pending().unwrap().handle;

        sink.set_now(164.32);
        s.on_voice_ended(old);
        assert_eq!(s.primary().unwrap().handle, next);
        assert!(!sink.voice(old).connected);
    }

    #[test]
    fn test_iteration_switch_keeps_offset() {
        let (mut s, sink, _) = playing_from_100();
        let old = s.primary().unwrap().clone();
        let old_pending = s.pending().unwrap().clone();

        sink.set_now(130.0);
        s.request_iteration_change(5).unwrap();
        assert_eq!(run_jobs(&mut s)[0], SegmentKey::new("study", 5));

        let primary = s.primary().unwrap();
        assert_eq!(primary.segment.iteration, 5);
        let (at, offset) = sink.voice(primary.handle).start.unwrap();
        assert!(approx(at, 130.1));
        assert!((offset - 30.1).abs() < 1e-9);
        assert!(approx(primary.logical_start, 100.0));

        // Outgoing primary fades over 300ms from the new start
        let gains = sink.voice(old.handle).gains;
        assert!(matches!(gains[0], GainCall::Set { value, at } if value == 0.9999 && approx(at, 130.1)));
        assert!(matches!(gains[1], GainCall::ExpRamp { value, end } if value == 1e-5 && approx(end, 130.4)));

        // Successor that never sounded is dropped at once
        assert!(!sink.voice(old_pending.handle).connected);

        // Faded voice is disconnected once the ramp completes
        sink.set_now(130.5);
        s.tick();
        assert!(!sink.voice(old.handle).connected);
    }

    #[test]
    fn test_switch_offset_wraps_to_target_duration() {
        let (mut s, sink, _) = playing_from_100();
        // New voice starts just past the end of the primary's buffer
        sink.set_now(100.0 + 64.32 - 0.05);
        s.request_iteration_change(3).unwrap();
        run_jobs(&mut s);

        let offset = sink.voice(s.primary().unwrap().handle).start.unwrap().1;
        assert!((offset - 0.05).abs() < 1e-6, "offset = {}", offset);
    }

    #[test]
    fn test_request_for_current_iteration_is_noop() {
        let (mut s, _, _) = playing_from_100();
        let generation = s.generation();
        s.request_iteration_change(0).unwrap();
        assert_eq!(s.queued_jobs(), 0);
        assert_eq!(s.generation(), generation);
    }

    #[test]
    fn test_duplicate_in_flight_request_dropped() {
        let (mut s, _, _) = playing_from_100();
        s.request_iteration_change(7).unwrap();
        s.request_iteration_change(7).unwrap();
        assert_eq!(
            run_jobs(&mut s),
            vec![SegmentKey::new("study", 7), SegmentKey::new("study", 8)]
        );
        assert_eq!(s.primary().unwrap().segment.iteration, 7);
    }

    #[test]
    fn test_latest_switch_wins() {
        let (mut s, sink, _) = playing_from_100();
        sink.set_now(110.0);
        s.request_iteration_change(3).unwrap();
        s.request_iteration_change(4).unwrap();

        let first = s.next_decode_job().unwrap();
        let second = s.next_decode_job().unwrap();
        s.on_decoded(first.ticket, Ok(pcm()));
        assert_eq!(s.primary().unwrap().segment.iteration, 0);

        s.on_decoded(second.ticket, Ok(pcm()));
        assert_eq!(s.primary().unwrap().segment.iteration, 4);
    }

    #[test]
    fn test_returning_to_current_cancels_in_flight() {
        let (mut s, _, _) = playing_from_100();
        s.request_iteration_change(3).unwrap();
        s.request_iteration_change(0).unwrap();
        let job = s.next_decode_job().unwrap();
        s.on_decoded(job.ticket, Ok(pcm()));
        assert_eq!(s.primary().unwrap().segment.iteration, 0);
    }

    #[test]
    fn test_decode_failure_keeps_previous_audio() {
        let (mut s, sink, events) = playing_from_100();
        let mut rx = events.subscribe();
        let before = s.primary().unwrap().clone();
        let voices_before = sink.created();

        s.request_iteration_change(2).unwrap();
        let job = s.next_decode_job().unwrap();
        s.on_decoded(job.ticket, Err(Error::Decode("bad frame".into())));

        assert_eq!(s.primary().unwrap(), &before);
        assert_eq!(sink.created(), voices_before);
        let failed = drain(&mut rx).into_iter().any(|e| {
            matches!(e, PlayerEvent::SwitchFailed { ref segment, .. } if segment.iteration == 2)
        });
        assert!(failed);
    }

    #[test]
    fn test_stale_successor_discarded() {
        let (mut s, sink, _) = scheduler(catalog(&[("study", 16)]));
        sink.set_now(99.9);
        s.request_iteration_change(0).unwrap();
        let switch = s.next_decode_job().unwrap();
        s.on_decoded(switch.ticket, Ok(pcm()));

        // Successor of iteration 0 is queued but not yet decoded
        let stale = s.next_decode_job().unwrap();
        assert_eq!(stale.ticket.segment.iteration, 1);

        sink.set_now(120.0);
        s.request_iteration_change(9).unwrap();
        run_jobs(&mut s);
        let pending = s.pending().unwrap().clone();
        assert_eq!(pending.segment.iteration, 10);

        let created = sink.created();
        s.on_decoded(stale.ticket, Ok(pcm()));
        assert_eq!(sink.created(), created);
        assert_eq!(s.pending().unwrap(), &pending);
    }

    #[test]
    fn test_unknown_and_not_ready_rejected() {
        let cat = catalog(&[("study", 4)]);
        let extra = Segment::new(SegmentKey::new("study", 4), 4, "study/04.mp3", SEGMENT_MS);
        let mut segments: Vec<Segment> = (0..4)
            .map(|i| {
                let seg = Segment::new(SegmentKey::new("study", i), i, "x.mp3", SEGMENT_MS);
                seg.set_bytes(Arc::from(vec![0u8]));
                seg
            })
            .collect();
        segments.push(extra);
        let cat_with_missing = Arc::new(SegmentCatalog::from_segments(segments).unwrap());

        let (mut s, _, _) = scheduler(cat);
        assert!(matches!(
            s.request_iteration_change(12),
            Err(Error::UnknownSegment(_))
        ));

        let (mut s, _, _) = scheduler(cat_with_missing);
        assert!(matches!(
            s.request_iteration_change(4),
            Err(Error::SegmentNotReady(_))
        ));
        assert_eq!(s.queued_jobs(), 0);
        assert!(matches!(
            s.request_gallery_change(GalleryId::new("attic")),
            Err(Error::UnknownGallery(_))
        ));
    }

    #[test]
    fn test_exclusive_primary_across_switches() {
        let (mut s, sink, _) = playing_from_100();
        for (i, target) in [3u32, 8, 1, 12].into_iter().enumerate() {
            sink.set_now(101.0 + i as f64 * 2.0);
            s.request_iteration_change(target).unwrap();
            run_jobs(&mut s);
            assert_eq!(s.primary().unwrap().segment.iteration, target);
            assert!(s.pending().is_some());
        }

        sink.set_now(120.0);
        s.tick();
        let connected = sink.connected();
        assert_eq!(connected.len(), 2);
        assert!(connected.contains(&s.primary().unwrap().handle));
        assert!(connected.contains(&s.pending().unwrap().handle));
    }

    #[test]
    fn test_missing_successor_retried_when_bytes_arrive() {
        let segments: Vec<Segment> = (0..3)
            .map(|i| Segment::new(SegmentKey::new("study", i), i, "x.mp3", SEGMENT_MS))
            .collect();
        let cat = Arc::new(SegmentCatalog::from_segments(segments).unwrap());
        cat.get(&SegmentKey::new("study", 0))
            .unwrap()
            .set_bytes(Arc::from(vec![1u8]));

        let (mut s, _, _) = scheduler(Arc::clone(&cat));
        s.request_iteration_change(0).unwrap();
        run_jobs(&mut s);
        assert!(s.pending().is_none());
        assert_eq!(s.queued_jobs(), 0);

        cat.get(&SegmentKey::new("study", 1))
            .unwrap()
            .set_bytes(Arc::from(vec![2u8]));
        s.on_catalog_updated();
        assert_eq!(run_jobs(&mut s), vec![SegmentKey::new("study", 1)]);
        assert!(s.pending().is_some());
    }

    #[test]
    fn test_late_successor_keeps_timeline() {
        let (mut s, sink, _) = scheduler(catalog(&[("study", 16)]));
        sink.set_now(99.9);
        s.request_iteration_change(0).unwrap();
        let switch = s.next_decode_job().unwrap();
        s.on_decoded(switch.ticket, Ok(pcm()));
        let successor = s.next_decode_job().unwrap();

        // Decode finishes after the boundary
        sink.set_now(165.0);
        s.on_decoded(successor.ticket, Ok(pcm()));
        let pending = s.pending().unwrap();
        assert!(approx(pending.logical_start, 164.32));
        let (at, offset) = sink.voice(pending.handle).start.unwrap();
        assert!(approx(at, 165.0));
        assert!((offset - 0.68).abs() < 1e-9);
    }

    #[test]
    fn test_stalled_successor_resumes_in_current_window() {
        let segments: Vec<Segment> = (0..4)
            .map(|i| Segment::new(SegmentKey::new("study", i), i, "x.mp3", SEGMENT_MS))
            .collect();
        let cat = Arc::new(SegmentCatalog::from_segments(segments).unwrap());
        cat.get(&SegmentKey::new("study", 0))
            .unwrap()
            .set_bytes(Arc::from(vec![0u8]));

        let (mut s, sink, events) = scheduler(Arc::clone(&cat));
        let mut rx = events.subscribe();
        sink.set_now(99.9);
        s.request_iteration_change(0).unwrap();
        run_jobs(&mut s);
        assert!(s.pending().is_none());

        // Bytes arrive more than two segments past the end of iteration 0
        for i in 1..4 {
            cat.get(&SegmentKey::new("study", i))
                .unwrap()
                .set_bytes(Arc::from(vec![i as u8]));
        }
        sink.set_now(300.0);
        s.on_catalog_updated();
        assert_eq!(run_jobs(&mut s), vec![SegmentKey::new("study", 3)]);

        let pending = s.pending().unwrap().clone();
        assert_eq!(pending.segment, SegmentKey::new("study", 3));
        assert!(approx(pending.logical_start, 292.96));
        let (at, offset) = sink.voice(pending.handle).start.unwrap();
        assert!(approx(at, 300.0));
        assert!((offset - 7.04).abs() < 1e-9);
        assert_started_within_buffers(&sink);

        sink.set_now(300.5);
        s.tick();
        let rollovers: Vec<(u32, u32)> = drain(&mut rx)
            .into_iter()
            .filter_map(|ev| match ev {
                PlayerEvent::IterationRolledOver {
                    from_iteration,
                    to_iteration,
                    ..
                } => Some((from_iteration, to_iteration)),
                _ => None,
            })
            .collect();
        assert_eq!(rollovers, vec![(0, 3)]);
    }

    #[test]
    fn test_successor_decoded_after_its_window_is_skipped() {
        let (mut s, sink, _) = scheduler(catalog(&[("study", 16)]));
        sink.set_now(99.9);
        s.request_iteration_change(0).unwrap();
        let switch = s.next_decode_job().unwrap();
        s.on_decoded(switch.ticket, Ok(pcm()));
        let successor = s.next_decode_job().unwrap();
        assert_eq!(successor.ticket.segment, SegmentKey::new("study", 1));

        // Iteration 1 spans [164.32, 228.64); its decode lands after that
        sink.set_now(240.0);
        s.on_decoded(successor.ticket, Ok(pcm()));
        assert!(s.pending().is_none());
        assert_eq!(sink.created(), 1);

        assert_eq!(run_jobs(&mut s), vec![SegmentKey::new("study", 2)]);
        let pending = s.pending().unwrap();
        assert_eq!(pending.segment, SegmentKey::new("study", 2));
        assert!(approx(pending.logical_start, 228.64));
        let offset = sink.voice(pending.handle).start.unwrap().1;
        assert!((offset - 11.36).abs() < 1e-9);
        assert_started_within_buffers(&sink);
    }

    #[test]
    fn test_gallery_crossfade_is_symmetric() {
        let (mut s, sink, _) = scheduler(catalog(&[("study", 16), ("court", 16)]));
        sink.set_now(99.9);
        s.request_iteration_change(2).unwrap();
        run_jobs(&mut s);
        let old = s.primary().unwrap().clone();

        sink.set_now(110.0);
        s.request_gallery_change(GalleryId::new("court")).unwrap();
        run_jobs(&mut s);

        let primary = s.primary().unwrap().clone();
        assert_eq!(primary.segment, SegmentKey::new("court", 2));
        assert_eq!(s.gallery(), Some(&GalleryId::new("court")));

        let (at, offset) = sink.voice(primary.handle).start.unwrap();
        assert!(approx(at, 110.1));
        assert!((offset - 10.1).abs() < 1e-9);

        let incoming = sink.voice(primary.handle).gains;
        assert!(matches!(incoming[0], GainCall::Set { value, at } if value == 1e-5 && approx(at, 110.1)));
        assert!(matches!(incoming[1], GainCall::ExpRamp { value, end } if value == 1.0 && approx(end, 111.1)));

        let outgoing = sink.voice(old.handle).gains;
        assert!(matches!(outgoing[0], GainCall::Set { value, .. } if value == 0.9999));
        assert!(matches!(outgoing[1], GainCall::ExpRamp { value, end } if value == 1e-5 && approx(end, 111.1)));

        // Same gallery again is a no-op
        s.request_gallery_change(GalleryId::new("court")).unwrap();
        assert_eq!(s.queued_jobs(), 0);
    }

    #[test]
    fn test_returning_gallery_resumes_its_own_clock() {
        let (mut s, sink, _) = scheduler(catalog(&[("study", 16), ("court", 16)]));
        sink.set_now(99.9);
        s.request_iteration_change(0).unwrap();
        run_jobs(&mut s);

        sink.set_now(110.0);
        s.request_gallery_change(GalleryId::new("court")).unwrap();
        run_jobs(&mut s);

        // study was left at iteration 0 with logical start 100.0; by 200.1 its
        // own clock is 35.78s into iteration 1
        sink.set_now(200.0);
        s.request_gallery_change(GalleryId::new("study")).unwrap();
        run_jobs(&mut s);

        let primary = s.primary().unwrap();
        assert_eq!(primary.segment, SegmentKey::new("study", 1));
        assert!(approx(primary.logical_start, 164.32));
        let offset = sink.voice(primary.handle).start.unwrap().1;
        assert!((offset - 35.78).abs() < 1e-9);
    }

    #[test]
    fn test_slow_return_moves_to_next_iteration_of_gallery_clock() {
        let (mut s, sink, _) = scheduler(catalog(&[("study", 16), ("court", 16)]));
        sink.set_now(99.9);
        s.request_iteration_change(0).unwrap();
        run_jobs(&mut s);

        sink.set_now(110.0);
        s.request_gallery_change(GalleryId::new("court")).unwrap();
        run_jobs(&mut s);

        sink.set_now(200.0);
        s.request_gallery_change(GalleryId::new("study")).unwrap();
        let job = s.next_decode_job().unwrap();
        assert_eq!(job.ticket.segment, SegmentKey::new("study", 1));

        // study#1 ends at 228.64 on study's clock; the decode lands after it
        sink.set_now(230.0);
        s.on_decoded(job.ticket, Ok(pcm()));
        assert_eq!(s.gallery(), Some(&GalleryId::new("court")));

        let decoded = run_jobs(&mut s);
        assert_eq!(decoded[0], SegmentKey::new("study", 2));
        let primary = s.primary().unwrap();
        assert_eq!(primary.segment, SegmentKey::new("study", 2));
        assert!(approx(primary.logical_start, 228.64));
        let offset = sink.voice(primary.handle).start.unwrap().1;
        assert!((offset - 1.46).abs() < 1e-9);
        assert_started_within_buffers(&sink);
    }

    #[test]
    fn test_cached_pcm_skips_decode() {
        let sink = RecordingSink::default();
        let config = SchedulerConfig {
            cache_decoded: true,
            ..SchedulerConfig::default()
        };
        let cat = catalog(&[("study", 16)]);
        let mut s = Scheduler::new(sink.clone(), Arc::clone(&cat), config, EventBus::new(16), None);

        sink.set_now(10.0);
        s.request_iteration_change(6).unwrap();
        run_jobs(&mut s);
        assert!(cat.get(&SegmentKey::new("study", 6)).unwrap().decoded().is_some());

        s.request_iteration_change(2).unwrap();
        run_jobs(&mut s);
        s.request_iteration_change(6).unwrap();
        assert_eq!(s.queued_jobs(), 0);
        assert_eq!(s.primary().unwrap().segment.iteration, 6);
    }

    #[test]
    fn test_status_events_emitted_on_tick() {
        let (mut s, sink, events) = playing_from_100();
        let mut rx = events.subscribe();
        sink.set_now(101.5);
        s.tick();

        let statuses: Vec<PlaybackStatus> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                PlayerEvent::PlaybackStatus { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].gallery, GalleryId::new("study"));
        assert!((statuses[0].offset - 1.5).abs() < 1e-9);
        assert_eq!(s.last_status(), Some(&statuses[0]));
    }

    #[test]
    fn test_idle_tick_reports_nothing() {
        let (mut s, _, _) = scheduler(catalog(&[("study", 2)]));
        assert!(s.tick().is_none());
        assert!(s.status().is_none());
    }
}
