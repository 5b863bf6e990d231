//! Segment catalog
//!
//! Describes every playable segment: which gallery and iteration it is, where
//! its bytes come from, and (once fetched) the bytes themselves. Bytes and
//! decoded PCM are write-once; after that the catalog only hands out shared
//! references or fresh copies.
//!
//! Galleries come from a TOML manifest:
//!
//! ```toml
//! [[galleries]]
//! id = "study"
//! iterations = 16
//! duration_ms = 64320
//! url_template = "study/study.{nn}.mp3"
//!
//! # Optional per-segment overrides or additions
//! [[segments]]
//! gallery = "study"
//! iteration = 3
//! source_url = "study/study.03-alt.mp3"
//! ```

use crate::audio::{DecodeInput, PcmBuffer};
use crate::error::{Error, Result};
use crate::fetch::ItemProgress;
use galleria_common::{GalleryId, SegmentKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Manifest file contents
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub galleries: Vec<GalleryManifest>,
    #[serde(default)]
    pub segments: Vec<SegmentManifest>,
}

/// One gallery whose segments follow a URL pattern
#[derive(Debug, Clone, Deserialize)]
pub struct GalleryManifest {
    pub id: GalleryId,
    pub iterations: u32,
    /// Nominal segment length; 0 when unknown
    #[serde(default)]
    pub duration_ms: f64,
    /// `{gallery}`, `{iteration}` and `{nn}` (two digits) are substituted
    pub url_template: String,
}

/// One explicitly listed segment
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentManifest {
    pub gallery: GalleryId,
    pub iteration: u32,
    pub source_url: String,
    #[serde(default)]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub sequence: Option<u32>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(galleria_common::config::load_toml(path)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Invalid manifest: {}", e)))
    }
}

fn expand_template(template: &str, gallery: &GalleryId, iteration: u32) -> String {
    template
        .replace("{gallery}", gallery.as_str())
        .replace("{iteration}", &iteration.to_string())
        .replace("{nn}", &format!("{:02}", iteration))
}

/// One iteration of one gallery
#[derive(Debug)]
pub struct Segment {
    pub key: SegmentKey,
    /// Download order across the whole catalog
    pub sequence: u32,
    pub source_url: String,
    pub duration_ms: f64,
    started: AtomicBool,
    raw: OnceLock<Arc<[u8]>>,
    decoded: OnceLock<Arc<PcmBuffer>>,
    error: OnceLock<String>,
}

impl Segment {
    pub fn new(key: SegmentKey, sequence: u32, source_url: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            key,
            sequence,
            source_url: source_url.into(),
            duration_ms,
            started: AtomicBool::new(false),
            raw: OnceLock::new(),
            decoded: OnceLock::new(),
            error: OnceLock::new(),
        }
    }

    /// Store downloaded bytes. Returns false if bytes were already present.
    pub fn set_bytes(&self, bytes: Arc<[u8]>) -> bool {
        self.started.store(true, Ordering::Release);
        self.raw.set(bytes).is_ok()
    }

    /// Shared, immutable view of the downloaded bytes
    pub fn raw_bytes(&self) -> Option<&Arc<[u8]>> {
        self.raw.get()
    }

    pub fn decoded(&self) -> Option<Arc<PcmBuffer>> {
        self.decoded.get().cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.raw.get().is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.is_ready() || self.error.get().is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }

    /// Extension of the source URL, used as a format hint
    pub fn extension(&self) -> Option<String> {
        let path = self.source_url.split(['?', '#']).next().unwrap_or_default();
        let name = path.rsplit('/').next().unwrap_or_default();
        name.rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }
}

/// API view of one segment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentInfo {
    pub gallery: GalleryId,
    pub iteration: u32,
    pub sequence: u32,
    pub source_url: String,
    pub duration_ms: f64,
    pub started: bool,
    pub finished: bool,
    pub ready: bool,
    pub decoded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Catalog of all segments, keyed by (gallery, iteration)
#[derive(Debug, Default)]
pub struct SegmentCatalog {
    segments: BTreeMap<SegmentKey, Segment>,
    /// 1 + highest iteration, per gallery
    totals: HashMap<GalleryId, u32>,
}

impl SegmentCatalog {
    /// Build from segment descriptions. Duplicate keys are rejected.
    pub fn from_segments(segments: impl IntoIterator<Item = Segment>) -> Result<Self> {
        let mut catalog = Self::default();
        for segment in segments {
            let key = segment.key.clone();
            if catalog.segments.insert(key.clone(), segment).is_some() {
                return Err(Error::Config(format!("Duplicate segment {}", key)));
            }
            let total = catalog.totals.entry(key.gallery.clone()).or_insert(0);
            *total = (*total).max(key.iteration + 1);
        }
        Ok(catalog)
    }

    /// Expand a manifest into a catalog.
    ///
    /// Default download order is iteration-major: iteration 0 of every
    /// gallery first, then iteration 1, and so on.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        let gallery_count = manifest.galleries.len() as u32;
        let mut entries: BTreeMap<SegmentKey, Segment> = BTreeMap::new();

        for (g_idx, gallery) in manifest.galleries.iter().enumerate() {
            if gallery.iterations == 0 {
                warn!("Gallery {} declares no iterations", gallery.id);
            }
            for iteration in 0..gallery.iterations {
                let key = SegmentKey::new(gallery.id.clone(), iteration);
                let sequence = iteration * gallery_count + g_idx as u32;
                let url = expand_template(&gallery.url_template, &gallery.id, iteration);
                entries.insert(key.clone(), Segment::new(key, sequence, url, gallery.duration_ms));
            }
        }

        let mut next_sequence = entries.values().map(|s| s.sequence + 1).max().unwrap_or(0);
        for explicit in &manifest.segments {
            let key = SegmentKey::new(explicit.gallery.clone(), explicit.iteration);
            let inherited = entries.get(&key).map(|s| (s.sequence, s.duration_ms));
            let sequence = explicit.sequence.or(inherited.map(|(seq, _)| seq)).unwrap_or_else(|| {
                next_sequence += 1;
                next_sequence - 1
            });
            let duration_ms = explicit
                .duration_ms
                .or(inherited.map(|(_, d)| d))
                .unwrap_or(0.0);
            debug!("Manifest entry {} -> {}", key, explicit.source_url);
            entries.insert(
                key.clone(),
                Segment::new(key, sequence, explicit.source_url.clone(), duration_ms),
            );
        }

        let catalog = Self::from_segments(entries.into_values())?;
        info!(
            "Catalog: {} segments across {} galleries",
            catalog.len(),
            catalog.totals.len()
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, key: &SegmentKey) -> Option<&Segment> {
        self.segments.get(key)
    }

    /// Size of the gallery's iteration ring
    pub fn total_iterations(&self, gallery: &GalleryId) -> Option<u32> {
        self.totals.get(gallery).copied()
    }

    pub fn has_gallery(&self, gallery: &GalleryId) -> bool {
        self.totals.contains_key(gallery)
    }

    /// Galleries in sorted order
    pub fn galleries(&self) -> Vec<GalleryId> {
        let mut galleries: Vec<GalleryId> = self.totals.keys().cloned().collect();
        galleries.sort();
        galleries
    }

    /// Next iteration of the same gallery, wrapping at the end of the ring
    pub fn successor_of(&self, key: &SegmentKey) -> Option<SegmentKey> {
        let total = self.total_iterations(&key.gallery)?;
        let next = SegmentKey::new(key.gallery.clone(), (key.iteration + 1) % total);
        self.segments.contains_key(&next).then_some(next)
    }

    /// Fresh private copy of the segment's bytes for one decode call
    pub fn bytes_for_decode(&self, key: &SegmentKey) -> Result<DecodeInput> {
        let segment = self
            .get(key)
            .ok_or_else(|| Error::UnknownSegment(key.clone()))?;
        let raw = segment
            .raw_bytes()
            .ok_or_else(|| Error::SegmentNotReady(key.clone()))?;

        let input = DecodeInput::new(raw.to_vec());
        Ok(match segment.extension() {
            Some(ext) => input.with_extension(ext),
            None => input,
        })
    }

    /// Remember a decoded buffer. Returns false if one was already stored.
    pub fn store_decoded(&self, key: &SegmentKey, pcm: Arc<PcmBuffer>) -> bool {
        self.get(key).is_some_and(|s| s.decoded.set(pcm).is_ok())
    }

    /// Apply a download progress snapshot.
    ///
    /// Returns the number of segments that became ready with this snapshot.
    pub fn apply_progress(&self, progress: &[ItemProgress]) -> usize {
        let mut newly_ready = 0;
        for item in progress {
            let Some(segment) = self.get(&item.key) else {
                warn!("Progress for unknown segment {}", item.key);
                continue;
            };
            if item.started {
                segment.started.store(true, Ordering::Release);
            }
            if !item.finished {
                continue;
            }
            match (&item.bytes, &item.error) {
                (Some(bytes), _) => {
                    if segment.set_bytes(Arc::clone(bytes)) {
                        debug!("Segment {} ready ({} bytes)", item.key, bytes.len());
                        newly_ready += 1;
                    }
                }
                (None, Some(err)) => {
                    if segment.error.set(err.clone()).is_ok() {
                        warn!("Segment {} failed to download: {}", item.key, err);
                    }
                }
                (None, None) => {}
            }
        }
        newly_ready
    }

    pub fn finished_count(&self) -> usize {
        self.segments.values().filter(|s| s.is_finished()).count()
    }

    /// Segments in download order
    pub fn download_order(&self) -> Vec<(SegmentKey, String)> {
        let mut ordered: Vec<&Segment> = self.segments.values().collect();
        ordered.sort_by_key(|s| (s.sequence, s.key.clone()));
        ordered
            .into_iter()
            .map(|s| (s.key.clone(), s.source_url.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SegmentInfo> {
        self.segments
            .values()
            .map(|s| SegmentInfo {
                gallery: s.key.gallery.clone(),
                iteration: s.key.iteration,
                sequence: s.sequence,
                source_url: s.source_url.clone(),
                duration_ms: s.duration_ms,
                started: s.is_started(),
                finished: s.is_finished(),
                ready: s.is_ready(),
                decoded: s.decoded.get().is_some(),
                error: s.error().map(str::to_string),
            })
            .collect()
    }
}
