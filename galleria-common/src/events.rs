//! Event types for the Galleria event system
//!
//! Provides the shared [`PlayerEvent`] definitions and the [`EventBus`] used to
//! deliver them to any number of observers (SSE clients, logging, tests).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{GalleryId, PlaybackStatus, SegmentKey};

/// Player event types
///
/// Events are broadcast via [`EventBus`] and serialized as-is for SSE
/// transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// Periodic position report from the status poller
    ///
    /// Emitted on every poll tick while a primary voice exists.
    PlaybackStatus {
        status: PlaybackStatus,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback crossed into the next iteration without an explicit switch
    IterationRolledOver {
        gallery: GalleryId,
        from_iteration: u32,
        to_iteration: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A switch request was decoded and scheduled
    SwitchApplied {
        segment: SegmentKey,
        /// Offset (seconds) into the target segment at which the new voice starts
        offset: f64,
        /// Sink clock time at which the new voice becomes audible
        starts_at: f64,
        /// True for gallery crossfades (incoming voice ramps up)
        crossfade: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A switch or splice was abandoned; prior audio continues
    SwitchFailed {
        segment: SegmentKey,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Download collaborator progress changed
    DownloadProgress {
        finished: usize,
        total: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PlayerEvent {
    /// Event name used for the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            PlayerEvent::PlaybackStatus { .. } => "playback_status",
            PlayerEvent::IterationRolledOver { .. } => "iteration_rolled_over",
            PlayerEvent::SwitchApplied { .. } => "switch_applied",
            PlayerEvent::SwitchFailed { .. } => "switch_failed",
            PlayerEvent::DownloadProgress { .. } => "download_progress",
        }
    }
}

/// Central event distribution bus
///
/// Uses `tokio::sync::broadcast` internally:
/// - Non-blocking publish (slow subscribers don't block the scheduler)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use galleria_common::events::{EventBus, PlayerEvent};
///
/// let bus = EventBus::new(100);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(PlayerEvent::DownloadProgress {
///     finished: 1,
///     total: 16,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(PlayerEvent::DownloadProgress { finished: 1, .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// `capacity` is the number of events buffered per subscriber before the
    /// oldest are dropped for that subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PlayerEvent,
    ) -> Result<usize, broadcast::error::SendError<PlayerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
