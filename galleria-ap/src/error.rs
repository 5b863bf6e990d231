//! Error types for galleria-ap
//!
//! Module-specific error type using thiserror for clear error propagation.

use galleria_common::SegmentKey;
use thiserror::Error;

/// Main error type for the gallery player
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors bubbled up from galleria-common
    #[error(transparent)]
    Common(#[from] galleria_common::Error),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Segment exists but its bytes have not finished downloading
    #[error("Segment not ready: {0}")]
    SegmentNotReady(SegmentKey),

    /// No segment with this identity exists in the catalog
    #[error("Unknown segment: {0}")]
    UnknownSegment(SegmentKey),

    /// Gallery is not present in the catalog
    #[error("Unknown gallery: {0}")]
    UnknownGallery(String),

    /// Platform decode rejected the byte buffer
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Voice handle does not belong to the sink (already disconnected)
    #[error("Unknown voice: {0}")]
    UnknownVoice(u64),

    /// Segment download errors
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Playback engine task is gone
    #[error("Playback engine stopped")]
    EngineStopped,

    /// Invalid request
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience Result type using galleria-ap Error
pub type Result<T> = std::result::Result<T, Error>;
