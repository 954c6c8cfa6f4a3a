//! Background flusher moving buffered results into the local store

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::buffer::ResultBuffer;
use super::local_store::LocalResultStore;

/// Move everything currently buffered into the store
///
/// Returns the number of entries stored.
pub async fn flush_once(buffer: &ResultBuffer, store: &LocalResultStore) -> usize {
    let entries = buffer.take();
    if entries.is_empty() {
        return 0;
    }
    let stored = store.write(&entries).await;
    debug!(taken = entries.len(), stored, "Flushed results");
    stored
}

/// Periodic flush task
///
/// Runs until [`ResultFlusher::stop`], which flushes one final time.
pub struct ResultFlusher {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ResultFlusher {
    /// Spawn the flusher on the current runtime
    pub fn spawn(
        buffer: Arc<ResultBuffer>,
        store: Arc<LocalResultStore>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        flush_once(&buffer, &store).await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            let stored = flush_once(&buffer, &store).await;
            store.close().await;
            info!(stored, "Result flusher stopped");
        });

        info!(interval_ms = period.as_millis() as u64, "Started result flusher");
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the timer, flush what is left, and wait for the task to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!("Result flusher terminated abnormally: {}", e);
        }
    }
}
