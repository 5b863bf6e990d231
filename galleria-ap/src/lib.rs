//! # Galleria Audio Player Library (galleria-ap)
//!
//! Gapless, crossfading playback of parallel looping gallery tracks.
//!
//! **Purpose:** Keep one gallery's iteration ring playing without audible
//! seams, splice each iteration onto the next at the exact sample boundary,
//! and crossfade on visitor-initiated iteration or gallery switches.
//!
//! **Architecture:** Segment bytes are fetched with bounded parallelism into the
//! catalog, decoded with symphonia + rubato, and scheduled as voices on a
//! software mixer that a cpal stream drains. One tokio task owns the scheduler;
//! everything else talks to it through messages.

pub mod api;
pub mod audio;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod playback;

pub use error::{Error, Result};
