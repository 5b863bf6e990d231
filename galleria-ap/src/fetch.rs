//! Segment download collaborator
//!
//! Fetches segment bytes with bounded parallelism: N workers each claim the
//! next unstarted item in download order until none remain. Every state change
//! pushes a full progress snapshot so the consumer never has to merge deltas.
//!
//! Failed items finish with no bytes and an error string. There are no
//! retries.

use crate::error::{Error, Result};
use galleria_common::SegmentKey;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default number of concurrent downloads
pub const DEFAULT_PARALLEL_DOWNLOADS: usize = 3;

/// Where segment bytes come from
#[derive(Debug, Clone)]
pub enum SegmentSource {
    /// Locators are paths relative to this folder
    Directory(PathBuf),
    /// Locators are URLs relative to this base
    Http { base: String, client: reqwest::Client },
}

impl SegmentSource {
    pub fn directory(root: impl Into<PathBuf>) -> Self {
        SegmentSource::Directory(root.into())
    }

    pub fn http(base: impl Into<String>) -> Self {
        SegmentSource::Http {
            base: base.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Resolve a locator to a full path or URL
    pub fn resolve(&self, locator: &str) -> String {
        match self {
            SegmentSource::Directory(root) => root.join(locator).display().to_string(),
            SegmentSource::Http { base, .. } => {
                if locator.starts_with("http://") || locator.starts_with("https://") {
                    locator.to_string()
                } else {
                    format!(
                        "{}/{}",
                        base.trim_end_matches('/'),
                        locator.trim_start_matches('/')
                    )
                }
            }
        }
    }

    pub async fn fetch(&self, locator: &str) -> Result<Vec<u8>> {
        match self {
            SegmentSource::Directory(root) => {
                let path = root.join(Path::new(locator));
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| Error::Fetch(format!("{}: {}", path.display(), e)))
            }
            SegmentSource::Http { client, .. } => {
                let url = self.resolve(locator);
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::Fetch(format!("{}: {}", url, e)))?;
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Fetch(format!("{}: {}", url, e)))?;
                Ok(bytes.to_vec())
            }
        }
    }
}

/// Download state of one segment
#[derive(Debug, Clone)]
pub struct ItemProgress {
    pub key: SegmentKey,
    pub started: bool,
    pub finished: bool,
    pub bytes: Option<Arc<[u8]>>,
    pub error: Option<String>,
}

impl ItemProgress {
    fn pending(key: SegmentKey) -> Self {
        Self {
            key,
            started: false,
            finished: false,
            bytes: None,
            error: None,
        }
    }
}

/// Summary counts of a snapshot
pub fn finished_count(progress: &[ItemProgress]) -> usize {
    progress.iter().filter(|p| p.finished).count()
}

struct Shared {
    items: Vec<ItemProgress>,
    locators: Vec<String>,
    tx: mpsc::UnboundedSender<Vec<ItemProgress>>,
}

impl Shared {
    // Snapshots go out while the lock is held so receivers see them in order
    fn publish(&self) {
        if self.tx.send(self.items.clone()).is_err() {
            debug!("Progress receiver dropped");
        }
    }

    fn claim_next(&mut self) -> Option<(usize, String)> {
        let idx = self.items.iter().position(|p| !p.started)?;
        self.items[idx].started = true;
        self.publish();
        Some((idx, self.locators[idx].clone()))
    }

    fn complete(&mut self, idx: usize, result: Result<Vec<u8>>) {
        let item = &mut self.items[idx];
        item.finished = true;
        match result {
            Ok(bytes) => item.bytes = Some(Arc::from(bytes)),
            Err(e) => item.error = Some(e.to_string()),
        }
        self.publish();
    }
}

/// Bounded-parallelism segment downloader
pub struct SegmentFetcher {
    source: Arc<SegmentSource>,
    parallel: usize,
}

impl SegmentFetcher {
    pub fn new(source: SegmentSource, parallel: usize) -> Self {
        Self {
            source: Arc::new(source),
            parallel: parallel.max(1),
        }
    }

    /// Start downloading `items` (key, locator) in the given order.
    ///
    /// Returns the snapshot stream and a handle that completes once every
    /// item has finished. The stream closes after the last snapshot.
    pub fn spawn(
        self,
        items: Vec<(SegmentKey, String)>,
    ) -> (mpsc::UnboundedReceiver<Vec<ItemProgress>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let total = items.len();
        let (keys, locators): (Vec<_>, Vec<_>) = items.into_iter().unzip();
        let shared = Arc::new(Mutex::new(Shared {
            items: keys.into_iter().map(ItemProgress::pending).collect(),
            locators,
            tx,
        }));

        info!(
            "Fetching {} segments with {} parallel downloads",
            total, self.parallel
        );

        let workers: Vec<JoinHandle<()>> = (0..self.parallel)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let source = Arc::clone(&self.source);
                tokio::spawn(async move {
                    loop {
                        let next = shared
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .claim_next();
                        let Some((idx, locator)) = next else {
                            break;
                        };
                        debug!("Worker {} fetching {}", worker, locator);
                        let result = source.fetch(&locator).await;
                        if let Err(e) = &result {
                            warn!("Download failed: {}", e);
                        }
                        shared
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .complete(idx, result);
                    }
                })
            })
            .collect();

        let handle = tokio::spawn(async move {
            for worker in workers {
                if let Err(e) = worker.await {
                    warn!("Download worker panicked: {}", e);
                }
            }
            info!("All segment downloads finished");
        });

        (rx, handle)
    }
}
