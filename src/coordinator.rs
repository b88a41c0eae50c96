//! Pipeline coordinator: wires enrichment, routing and delivery together and
//! owns the `Running -> Draining -> Stopped` lifecycle.

use crate::bus::MessageBus;
use crate::config::PipelineConfig;
use crate::delivery::{DeliveryAttempt, DeliveryEvent, DeliveryPool};
use crate::enrichment::{Classifier, EnrichmentStage};
use crate::error::{PipelineError, Result};
use crate::fallback::{open_store, EntryId, FallbackReplayer, FallbackStore, ReplayReport};
use crate::metrics::PipelineMetrics;
use crate::router::Router;
use crate::types::{PartitionKey, Record};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight attempt resolved within the grace period
    pub drained_gracefully: bool,
    /// Attempts moved to the fallback store when the grace period ran out
    pub flushed_to_fallback: usize,
    pub bus_closed_cleanly: bool,
}

/// Read-only view for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    pub in_flight: usize,
    pub queued: usize,
    pub queue_depths: BTreeMap<PartitionKey, usize>,
    pub fallback_size: usize,
}

#[derive(Default)]
pub struct PipelineBuilder {
    config: Option<PipelineConfig>,
    bus: Option<Arc<dyn MessageBus>>,
    classifier: Option<Arc<dyn Classifier>>,
    fallback: Option<Arc<dyn FallbackStore>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Without a classifier customer interactions are forwarded unenriched.
    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Overrides the backend named in `FallbackConfig`.
    pub fn fallback_store(mut self, store: Arc<dyn FallbackStore>) -> Self {
        self.fallback = Some(store);
        self
    }

    /// Validates the configuration, opens the fallback store and starts the
    /// replayer. The returned pipeline is `Running`.
    ///
    /// # Errors
    ///
    /// * `PipelineError::InvalidConfig` - invalid configuration or no bus
    /// * `PipelineError::FallbackStore` / `PipelineError::Io` - the fallback
    ///   store cannot be opened or read; the pipeline refuses to start
    ///   without its safety net
    pub async fn build(self) -> Result<Pipeline> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let bus = self
            .bus
            .ok_or_else(|| PipelineError::InvalidConfig("a message bus is required".to_string()))?;

        let metrics = PipelineMetrics::new()?;

        let fallback = match self.fallback {
            Some(store) => store,
            None => open_store(&config.fallback).await.map_err(|e| {
                error!("Failed to open fallback store: {}", e);
                e
            })?,
        };

        let pending = fallback.len().await.map_err(|e| {
            error!("Fallback store unusable at startup: {}", e);
            PipelineError::FallbackStore(format!("fallback store unusable at startup: {}", e))
        })?;
        metrics.fallback_size.set(pending as i64);

        let router = Arc::new(Router::new(&config.routing));
        let enrichment = EnrichmentStage::new(self.classifier, config.enrichment.clone(), Arc::clone(&metrics));
        let pool = DeliveryPool::new(
            bus,
            Arc::clone(&fallback),
            config.delivery.clone(),
            &config.retry,
            Arc::clone(&metrics),
        );

        let replayer = Arc::new(FallbackReplayer::new(
            Arc::clone(&fallback),
            pool.clone(),
            Arc::clone(&router),
            config.fallback.replay_batch_size,
            Arc::clone(&metrics),
        ));
        let replay_shutdown = CancellationToken::new();
        let replay_task = Arc::clone(&replayer).spawn(config.fallback.replay_interval(), replay_shutdown.clone());

        info!(
            "Pipeline running: {} fallback entries pending replay, replay every {}ms",
            pending, config.fallback.replay_interval_ms
        );

        Ok(Pipeline {
            config,
            state: Arc::new(AsyncRwLock::new(PipelineState::Running)),
            enrichment,
            router,
            pool,
            fallback,
            replayer,
            replay_shutdown,
            replay_task: Mutex::new(Some(replay_task)),
            shutdown_report: AsyncMutex::new(None),
            metrics,
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    state: Arc<AsyncRwLock<PipelineState>>,
    enrichment: EnrichmentStage,
    router: Arc<Router>,
    pool: DeliveryPool,
    fallback: Arc<dyn FallbackStore>,
    replayer: Arc<FallbackReplayer>,
    replay_shutdown: CancellationToken,
    replay_task: Mutex<Option<JoinHandle<()>>>,
    // Also serializes concurrent shutdown calls
    shutdown_report: AsyncMutex<Option<ShutdownReport>>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Ingress for adapters.
    ///
    /// Enrichment and routing run on the caller's task, so a full per-key
    /// queue suspends only the adapter feeding that key. Returns once the
    /// record is queued for delivery.
    ///
    /// # Errors
    ///
    /// * `PipelineError::PipelineShuttingDown` - the pipeline is draining or stopped
    /// * `PipelineError::UnknownSourceType` - no channel is configured for the record's source
    pub async fn submit(&self, record: Record) -> Result<()> {
        if *self.state.read().await != PipelineState::Running {
            self.metrics.records_rejected.inc();
            return Err(PipelineError::PipelineShuttingDown);
        }

        let record = self.enrichment.enrich(record).await;
        let channel = self.router.route(record.source_type())?.to_string();

        match self.pool.submit(DeliveryAttempt::new(record, channel)).await {
            Ok(()) => {
                self.metrics.records_submitted.inc();
                Ok(())
            }
            Err(e) => {
                if matches!(e, PipelineError::PipelineShuttingDown) {
                    self.metrics.records_rejected.inc();
                }
                Err(e)
            }
        }
    }

    /// Drains and stops the pipeline. Safe to call more than once; later
    /// calls return the first report.
    ///
    /// New records are rejected immediately. In-flight attempts get the
    /// configured grace period to be published or exhaust their retries;
    /// whatever is left afterwards goes to the fallback store. The bus is
    /// closed last.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report_slot = self.shutdown_report.lock().await;
        if let Some(report) = report_slot.as_ref() {
            return report.clone();
        }

        let grace = self.config.shutdown.grace_period();
        {
            let mut state = self.state.write().await;
            *state = PipelineState::Draining;
        }
        info!(
            "Pipeline draining: {} attempts in flight, grace period {}ms",
            self.pool.in_flight(),
            grace.as_millis()
        );

        self.pool.stop_accepting();
        self.replay_shutdown.cancel();

        let drained_gracefully = if grace.is_zero() {
            self.pool.in_flight() == 0
        } else {
            timeout(grace, self.pool.wait_idle()).await.is_ok()
        };

        let flushed_to_fallback = if drained_gracefully {
            0
        } else {
            warn!(
                "Grace period elapsed with {} attempts unresolved, flushing to fallback store",
                self.pool.in_flight()
            );
            self.pool.abort().await
        };

        let replay_task = self.replay_task.lock().take();
        if let Some(task) = replay_task {
            if let Err(e) = task.await {
                warn!("Fallback replayer ended abnormally: {}", e);
            }
        }

        let bus_closed_cleanly = self.pool.close_bus().await.is_ok();

        match self.fallback.len().await {
            Ok(size) => self.metrics.fallback_size.set(size as i64),
            Err(e) => error!("Failed to read fallback store size during shutdown: {}", e),
        }

        {
            let mut state = self.state.write().await;
            *state = PipelineState::Stopped;
        }
        info!(
            "Pipeline stopped: drained_gracefully={}, flushed_to_fallback={}",
            drained_gracefully, flushed_to_fallback
        );

        let report = ShutdownReport {
            drained_gracefully,
            flushed_to_fallback,
            bus_closed_cleanly,
        };
        *report_slot = Some(report.clone());
        report
    }

    pub async fn state(&self) -> PipelineState {
        *self.state.read().await
    }

    pub async fn snapshot(&self) -> Result<PipelineSnapshot> {
        let queue_depths = self.pool.queue_depths();
        let fallback_size = self.fallback.len().await?;
        self.metrics.fallback_size.set(fallback_size as i64);

        Ok(PipelineSnapshot {
            state: self.state().await,
            in_flight: self.pool.in_flight(),
            queued: queue_depths.values().sum(),
            queue_depths,
            fallback_size,
        })
    }

    /// Runs one replay pass now instead of waiting for the timer.
    pub async fn replay_now(&self) -> Result<ReplayReport> {
        if self.state().await != PipelineState::Running {
            return Err(PipelineError::PipelineShuttingDown);
        }
        self.replayer.replay_once().await
    }

    /// Operator purge: drops a fallback entry without delivering it.
    pub async fn purge_fallback(&self, id: EntryId) -> Result<bool> {
        let removed = self.fallback.remove(id).await?;
        if removed {
            self.metrics.fallback_size.dec();
            info!(entry_id = %id, "Fallback entry purged by operator");
        }
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.pool.subscribe()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn fallback_store(&self) -> &Arc<dyn FallbackStore> {
        &self.fallback
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.replay_shutdown.cancel();
    }
}
