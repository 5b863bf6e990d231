//! Galleria Audio Player (galleria-ap) - Main entry point
//!
//! Loads the segment manifest, starts the downloader, opens the audio
//! device and serves the control API until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use galleria_common::{EventBus, PlaybackCommand, PlayerEvent, SegmentKey};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use galleria_ap::api::{self, AppState};
use galleria_ap::audio::{AudioOutput, MixerSink, SymphoniaDecoder};
use galleria_ap::catalog::{Manifest, SegmentCatalog};
use galleria_ap::config::{Args, Config};
use galleria_ap::fetch::SegmentFetcher;
use galleria_ap::playback::{spawn_engine, spawn_status_poller, PlaybackHandle, Scheduler};

/// Broadcast buffer per event subscriber
const EVENT_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("galleria_ap={},tower_http=info", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Galleria Audio Player on port {}", config.port);

    let manifest = Manifest::load(&config.manifest)
        .with_context(|| format!("Failed to load manifest {}", config.manifest.display()))?;
    let catalog = Arc::new(
        SegmentCatalog::from_manifest(&manifest).context("Failed to build segment catalog")?,
    );
    if catalog.is_empty() {
        bail!("Manifest {} lists no segments", config.manifest.display());
    }
    if let Some(gallery) = &config.initial_gallery {
        if !catalog.has_gallery(gallery) {
            bail!("Initial gallery {} is not in the manifest", gallery);
        }
    }

    // Audio device and mixer
    let mut output = AudioOutput::open(config.device.as_deref(), config.buffer_size)
        .context("Failed to open audio output")?;
    let (mixer, sink_events) = MixerSink::with_events(output.sample_rate());
    output
        .start(mixer.clone())
        .context("Failed to start audio stream")?;

    // Playback engine
    let events = EventBus::new(EVENT_CAPACITY);
    let scheduler = Scheduler::new(
        mixer,
        Arc::clone(&catalog),
        config.scheduler.clone(),
        events.clone(),
        config.initial_gallery.clone(),
    );
    let autoplay = config
        .autoplay
        .then(|| scheduler.gallery().cloned())
        .flatten()
        .map(|gallery| SegmentKey::new(gallery, 0));
    let decoder = Arc::new(SymphoniaDecoder::new(output.sample_rate()));
    let (handle, engine_task) = spawn_engine(scheduler, decoder, Some(sink_events));
    let poller = spawn_status_poller(handle.clone(), config.poll_interval);
    info!("Playback engine initialized");

    // Segment downloads
    let fetcher = SegmentFetcher::new(config.source.clone(), config.parallel_downloads);
    let (progress, _downloads) = fetcher.spawn(catalog.download_order());
    tokio::spawn(forward_progress(
        progress,
        Arc::clone(&catalog),
        handle.clone(),
        autoplay,
    ));

    let app = api::create_router(AppState {
        handle: handle.clone(),
        catalog,
        port: config.port,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if handle.shutdown().await.is_err() {
        debug!("Engine already stopped");
    }
    poller.abort();
    if let Err(e) = engine_task.await {
        warn!("Engine task ended abnormally: {}", e);
    }
    output.stop();

    info!("Server shutdown complete");
    Ok(())
}

/// Apply download snapshots to the catalog and wake the engine
async fn forward_progress(
    mut progress: tokio::sync::mpsc::UnboundedReceiver<Vec<galleria_ap::fetch::ItemProgress>>,
    catalog: Arc<SegmentCatalog>,
    handle: PlaybackHandle,
    mut autoplay: Option<SegmentKey>,
) {
    while let Some(snapshot) = progress.recv().await {
        let newly_ready = catalog.apply_progress(&snapshot);
        handle.events().emit_lossy(PlayerEvent::DownloadProgress {
            finished: catalog.finished_count(),
            total: catalog.len(),
            timestamp: chrono::Utc::now(),
        });
        if newly_ready == 0 {
            continue;
        }
        if handle.notify_catalog_updated().await.is_err() {
            break;
        }

        let first_ready = autoplay
            .as_ref()
            .is_some_and(|key| catalog.get(key).is_some_and(|s| s.is_ready()));
        if first_ready {
            if let Some(key) = autoplay.take() {
                info!("Autoplay: starting {}", key);
                let command = PlaybackCommand::ChangeIteration {
                    iteration: key.iteration,
                };
                if let Err(e) = handle.dispatch(command).await {
                    warn!("Autoplay failed: {}", e);
                }
            }
        }
    }
    info!(
        "Downloads complete: {}/{} segments",
        catalog.finished_count(),
        catalog.len()
    );
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
