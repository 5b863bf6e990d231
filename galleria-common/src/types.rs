//! Shared identity, status and command types
//!
//! These types cross every boundary in the player: the catalog keys segments by
//! [`SegmentKey`], the scheduler reports [`PlaybackStatus`], and the HTTP API
//! accepts [`PlaybackCommand`] bodies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one gallery (one independently looping ambient track).
///
/// Serialized as a bare string, e.g. `"study"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GalleryId(String);

impl GalleryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GalleryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GalleryId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Unique identity of a segment: one iteration of one gallery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey {
    pub gallery: GalleryId,
    pub iteration: u32,
}

impl SegmentKey {
    pub fn new(gallery: impl Into<GalleryId>, iteration: u32) -> Self {
        Self {
            gallery: gallery.into(),
            iteration,
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:02}", self.gallery, self.iteration)
    }
}

/// Externally observable playback state.
///
/// Derived on every poll tick from the primary voice. `offset` is the elapsed
/// time in seconds since the primary voice's logical start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub gallery: GalleryId,
    pub iteration: u32,
    pub offset: f64,
}

/// Command accepted from the UI / HTTP caller.
///
/// Wire format:
///
/// ```json
/// {"type": "change-iteration", "iteration": 3}
/// {"type": "change-gallery", "gallery": "study"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PlaybackCommand {
    ChangeIteration { iteration: u32 },
    ChangeGallery { gallery: GalleryId },
}
