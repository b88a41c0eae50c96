use super::FallbackStore;
use crate::delivery::{DeliveryAttempt, DeliveryPool};
use crate::error::{PipelineError, Result};
use crate::metrics::PipelineMetrics;
use crate::router::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries handed back to the delivery pool and removed from the store
    pub resubmitted: usize,
    /// Entries left in the store for a later pass
    pub deferred: usize,
}

/// Periodically moves fallback entries back into the delivery pool.
///
/// Each entry re-enters as a fresh attempt with the full retry budget. The
/// router is applied again; enrichment is not. Delivery is at-least-once: an
/// entry whose record did reach the bus before it failed may be published
/// twice.
pub struct FallbackReplayer {
    store: Arc<dyn FallbackStore>,
    pool: DeliveryPool,
    router: Arc<Router>,
    batch_size: usize,
    metrics: Arc<PipelineMetrics>,
    // Serializes timer-driven and on-demand passes
    pass: Mutex<()>,
}

impl FallbackReplayer {
    pub fn new(
        store: Arc<dyn FallbackStore>,
        pool: DeliveryPool,
        router: Arc<Router>,
        batch_size: usize,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            pool,
            router,
            batch_size,
            metrics,
            pass: Mutex::new(()),
        }
    }

    /// Resubmits at most one batch of the oldest entries.
    ///
    /// An entry is removed from the store only after the pool accepted it.
    /// The pass stops early, leaving the rest in place, once the pool stops
    /// accepting work.
    pub async fn replay_once(&self) -> Result<ReplayReport> {
        let _pass = self.pass.lock().await;

        let batch = self.store.drain_batch(self.batch_size).await?;
        let mut report = ReplayReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let total = batch.len();
        for entry in batch {
            if !self.pool.is_accepting() {
                break;
            }

            let channel = match self.router.route(entry.record.source_type()) {
                Ok(channel) => channel.to_string(),
                Err(e) => {
                    warn!(entry_id = %entry.id, "Leaving fallback entry in place: {}", e);
                    continue;
                }
            };

            let id = entry.id;
            let record_id = entry.record.id();
            match self.pool.submit(DeliveryAttempt::new(entry.record, channel)).await {
                Ok(()) => {}
                Err(PipelineError::PipelineShuttingDown) => break,
                Err(e) => return Err(e),
            }

            if self.store.remove(id).await? {
                self.metrics.fallback_size.dec();
            }
            self.metrics.records_replayed.inc();
            report.resubmitted += 1;
            debug!(entry_id = %id, record_id = %record_id, "Fallback entry resubmitted");
        }

        report.deferred = total - report.resubmitted;
        info!(
            "Fallback replay resubmitted {} entries, deferred {}",
            report.resubmitted, report.deferred
        );
        Ok(report)
    }

    /// Runs `replay_once` every `every` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First pass runs one interval after startup
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.replay_once().await {
                            warn!("Fallback replay failed: {}", e);
                        }
                    }
                }
            }
            debug!("Fallback replayer stopped");
        })
    }
}
