//! Playback scheduling
//!
//! The scheduler state machine, the engine task that owns it, and the
//! status poller that drives it.

pub mod engine;
pub mod poller;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{spawn_engine, PlaybackHandle};
pub use poller::{spawn_status_poller, DEFAULT_POLL_INTERVAL};
pub use scheduler::{
    Anchor, DecodeJob, DecodePurpose, DecodeTicket, Scheduler, SchedulerConfig, SwitchKind, Voice,
};
