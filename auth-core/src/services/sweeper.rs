//! Background removal of expired sessions.
//!
//! Validation already rejects expired sessions on its own, so a late or
//! skipped pass only leaves dead rows behind for longer.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::store::{with_timeout, CacheStore, DurableStore, StoreError, StoreTimeouts};

pub struct ExpirySweeper {
    durable: Arc<dyn DurableStore>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: i64,
    timeouts: StoreTimeouts,
}

impl ExpirySweeper {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        config: &SessionConfig,
        timeouts: StoreTimeouts,
    ) -> Self {
        Self {
            durable,
            cache,
            clock,
            interval: config.sweep_interval(),
            batch_size: config.sweep_batch_size.max(1),
            timeouts,
        }
    }

    /// One pass: delete expired rows batch by batch, evicting each batch
    /// from the cache. Returns the number of sessions removed.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut removed = 0;

        loop {
            let batch = with_timeout(
                self.timeouts.durable,
                self.durable.delete_expired_sessions(now, self.batch_size),
            )
            .await?;
            if batch.is_empty() {
                break;
            }
            removed += batch.len();

            if let Err(e) =
                with_timeout(self.timeouts.cache, self.cache.delete_sessions(&batch)).await
            {
                tracing::warn!(count = batch.len(), error = %e, "Failed to evict swept sessions");
            }

            if (batch.len() as i64) < self.batch_size {
                break;
            }
        }

        Ok(removed)
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Starting session sweeper"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Session sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => tracing::debug!("Sweep found no expired sessions"),
                        Ok(removed) => tracing::info!(removed, "Expired sessions swept"),
                        Err(e) => tracing::error!(error = %e, "Session sweep failed"),
                    }
                }
            }
        }
    }
}
