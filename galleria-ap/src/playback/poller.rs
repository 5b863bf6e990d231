//! Status poller
//!
//! Periodic task that asks the engine to sample the timeline. It only
//! observes: promotion of a due successor happens inside the scheduler's
//! tick, never here.

use crate::playback::PlaybackHandle;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

/// Default poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Spawn the poller. It stops once the engine is gone.
pub fn spawn_status_poller(handle: PlaybackHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Status poller started ({}ms interval)", interval.as_millis());

        loop {
            ticker.tick().await;
            if handle.poll_now().await.is_err() {
                debug!("Engine stopped; status poller exiting");
                break;
            }
        }
    })
}
