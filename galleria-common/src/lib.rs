//! # Galleria Common Library
//!
//! Shared code for the Galleria player crates:
//! - Gallery / segment identity and playback status types
//! - Player event types and the broadcast EventBus
//! - Gain ramp curve math
//! - Configuration file and root folder resolution

pub mod config;
pub mod error;
pub mod events;
pub mod fade_curves;
pub mod types;

pub use error::{Error, Result};
pub use events::{EventBus, PlayerEvent};
pub use fade_curves::RampCurve;
pub use types::{GalleryId, PlaybackCommand, PlaybackStatus, SegmentKey};
