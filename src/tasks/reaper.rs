//! TTL Reaper Task
//!
//! Background task that periodically removes expired cache entries and keeps key
//! material in shape (scheduled rotation, retired-key purge).

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::WeakSecureCache;
use crate::error::CacheError;

// == Reaper Handle ==
/// Owner side of a running reaper: signals it to stop and awaits its exit.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signals the reaper and waits for any in-flight pass to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            warn!("Reaper task ended abnormally: {}", err);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawns a background task that reaps the cache every `interval`.
///
/// The task holds only a weak handle: it exits once the cache is dropped, shut
/// down, or signalled through the returned [`ReaperHandle`].
///
/// # Example
/// ```ignore
/// let handle = spawn_reaper_task(cache.downgrade(), Duration::from_secs(5));
/// // Later, during shutdown:
/// handle.stop().await;
/// ```
pub fn spawn_reaper_task(cache: WeakSecureCache, interval: Duration) -> ReaperHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!("Starting TTL reaper with interval of {:?}", interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let Some(cache) = cache.upgrade() else {
                break;
            };

            match cache.reap_expired().await {
                Ok(report) => {
                    if report.expired > 0 {
                        info!(
                            "TTL reaper: removed {} expired entries in {} batches",
                            report.expired, report.batches
                        );
                    } else {
                        debug!("TTL reaper: no expired entries found");
                    }
                    if let Some(version) = report.rotated_to {
                        info!("TTL reaper: rotated to key version {}", version);
                    }
                }
                Err(CacheError::CacheClosed) => break,
                Err(err) => warn!("TTL reaper pass failed: {}", err),
            }
        }

        debug!("TTL reaper stopped");
    });

    ReaperHandle {
        shutdown_tx,
        handle,
    }
}
