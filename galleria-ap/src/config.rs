//! Configuration for galleria-ap
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (`--port`, `--manifest`, ...)
//! 2. Environment variables (`GALLERIA_*`, read by clap)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)
//!
//! The TOML file is bootstrap only: the process must restart to pick up
//! changes.

use crate::error::{Error, Result};
use crate::fetch::{SegmentSource, DEFAULT_PARALLEL_DOWNLOADS};
use crate::playback::{SchedulerConfig, DEFAULT_POLL_INTERVAL};
use clap::Parser;
use galleria_common::config::{resolve_root_folder, LoggingConfig, ROOT_FOLDER_ENV};
use galleria_common::GalleryId;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Command-line arguments for galleria-ap
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "galleria-ap")]
#[command(about = "Gapless gallery audio player")]
#[command(version)]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "GALLERIA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "GALLERIA_PORT")]
    pub port: Option<u16>,

    /// Folder segment locators are relative to
    #[arg(short, long)]
    pub root_folder: Option<PathBuf>,

    /// Segment manifest (TOML)
    #[arg(short, long, env = "GALLERIA_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Fetch segments over HTTP from this base URL instead of the root folder
    #[arg(short, long, env = "GALLERIA_BASE_URL")]
    pub base_url: Option<String>,

    /// Audio output device name
    #[arg(short, long, env = "GALLERIA_DEVICE")]
    pub device: Option<String>,

    /// Start playing iteration 0 of the first gallery as soon as it downloads
    #[arg(short, long, env = "GALLERIA_AUTOPLAY")]
    pub autoplay: bool,
}

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Segment manifest path
    #[serde(default)]
    pub manifest: Option<PathBuf>,

    /// Root folder for segment files
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// HTTP base URL for segment files (wins over the root folder)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Concurrent segment downloads
    #[serde(default = "default_parallel_downloads")]
    pub parallel_downloads: usize,

    /// Gallery selected at startup (default: first in the manifest)
    #[serde(default)]
    pub initial_gallery: Option<GalleryId>,

    #[serde(default)]
    pub autoplay: bool,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub scheduler: SchedulerToml,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            manifest: None,
            root_folder: None,
            base_url: None,
            parallel_downloads: default_parallel_downloads(),
            initial_gallery: None,
            autoplay: false,
            audio: AudioConfig::default(),
            scheduler: SchedulerToml::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Audio device settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioConfig {
    /// Output device name (None = system default)
    #[serde(default)]
    pub device: Option<String>,

    /// Device buffer size in frames (None = device default)
    #[serde(default)]
    pub buffer_size: Option<u32>,
}

/// Scheduler timing as written in TOML
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerToml {
    pub preroll_ms: u64,
    pub splice_fade_ms: u64,
    pub switch_fade_ms: u64,
    pub gallery_crossfade_ms: u64,
    pub silence_floor: f32,
    pub poll_interval_ms: u64,
    pub cache_decoded: bool,
}

impl Default for SchedulerToml {
    fn default() -> Self {
        Self {
            preroll_ms: 100,
            splice_fade_ms: 100,
            switch_fade_ms: 300,
            gallery_crossfade_ms: 1000,
            silence_floor: 1e-5,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            cache_decoded: false,
        }
    }
}

impl SchedulerToml {
    pub fn to_scheduler_config(&self) -> Result<SchedulerConfig> {
        if !(self.silence_floor > 0.0 && self.silence_floor < 1.0) {
            return Err(Error::Config(format!(
                "scheduler.silence_floor must be in (0, 1), got {}",
                self.silence_floor
            )));
        }
        Ok(SchedulerConfig {
            preroll: self.preroll_ms as f64 / 1000.0,
            splice_fade_in: self.splice_fade_ms as f64 / 1000.0,
            switch_fade_out: self.switch_fade_ms as f64 / 1000.0,
            gallery_crossfade: self.gallery_crossfade_ms as f64 / 1000.0,
            silence_floor: self.silence_floor,
            cache_decoded: self.cache_decoded,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_port() -> u16 {
    5790
}

fn default_parallel_downloads() -> usize {
    DEFAULT_PARALLEL_DOWNLOADS
}

/// Fully merged configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub manifest: PathBuf,
    pub source: SegmentSource,
    pub parallel_downloads: usize,
    pub initial_gallery: Option<GalleryId>,
    pub autoplay: bool,
    pub device: Option<String>,
    pub buffer_size: Option<u32>,
    pub scheduler: SchedulerConfig,
    pub poll_interval: Duration,
    pub log_level: String,
}

impl Config {
    /// Merge CLI arguments over the TOML file and defaults
    pub fn load(args: &Args) -> Result<Self> {
        let toml_path = args
            .config
            .clone()
            .or_else(galleria_common::config::default_config_path);
        let toml: TomlConfig =
            galleria_common::config::load_toml_or_default(toml_path.as_deref());
        Self::merge(args, toml)
    }

    pub fn merge(args: &Args, toml: TomlConfig) -> Result<Self> {
        let root_folder = resolve_root_folder(
            args.root_folder.as_deref(),
            ROOT_FOLDER_ENV,
            toml.root_folder.as_deref(),
        );

        let source = match args.base_url.clone().or(toml.base_url.clone()) {
            Some(base) => SegmentSource::http(base),
            None => SegmentSource::directory(root_folder.clone()),
        };

        // A manifest named in TOML is relative to the root folder
        let manifest = args.manifest.clone().unwrap_or_else(|| {
            let named = toml
                .manifest
                .clone()
                .unwrap_or_else(|| PathBuf::from("manifest.toml"));
            resolve_relative(&named, &root_folder)
        });

        let config = Self {
            port: args.port.unwrap_or(toml.port),
            manifest,
            source,
            parallel_downloads: toml.parallel_downloads.max(1),
            initial_gallery: toml.initial_gallery.clone(),
            autoplay: args.autoplay || toml.autoplay,
            device: args.device.clone().or(toml.audio.device.clone()),
            buffer_size: toml.audio.buffer_size,
            scheduler: toml.scheduler.to_scheduler_config()?,
            poll_interval: toml.scheduler.poll_interval(),
            log_level: toml.logging.level.clone(),
        };

        info!("Manifest: {}", config.manifest.display());
        Ok(config)
    }
}

fn resolve_relative(path: &Path, root: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
