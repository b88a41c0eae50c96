use super::attempt::DeliveryAttempt;
use super::backoff::Backoff;
use crate::bus::{MessageBus, PublishError};
use crate::config::{DeliveryConfig, RetryConfig};
use crate::error::{PipelineError, Result};
use crate::fallback::{EntryId, FallbackStore};
use crate::metrics::PipelineMetrics;
use crate::types::{ChannelName, PartitionKey, RecordId};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const FALLBACK_PUT_ATTEMPTS: u32 = 3;
const FALLBACK_PUT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Why a record left the delivery pool for the fallback store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    PermanentFailure,
    RetriesExhausted,
    /// Still unresolved when the shutdown grace period ran out
    ShutdownDeadline,
}

/// Observability events emitted by the delivery pool.
///
/// Publish errors never propagate past the pool; subscribers see them here.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    Published {
        record_id: RecordId,
        partition_key: PartitionKey,
        channel: ChannelName,
        /// Failed attempts before the successful one
        attempt_count: u32,
    },
    Retrying {
        record_id: RecordId,
        partition_key: PartitionKey,
        channel: ChannelName,
        attempt_count: u32,
        next_retry_in: Duration,
        error: PublishError,
    },
    MovedToFallback {
        record_id: RecordId,
        partition_key: PartitionKey,
        channel: ChannelName,
        attempt_count: u32,
        reason: FallbackReason,
        entry_id: EntryId,
    },
    /// The fallback store refused the record. It is lost.
    FallbackPersistFailed {
        record_id: RecordId,
        partition_key: PartitionKey,
        error: String,
    },
}

/// Publishes records to the bus with per-key FIFO ordering.
///
/// Each partition key gets a bounded lane drained by at most one worker task,
/// so records sharing a key are never published concurrently or out of
/// order. Workers for different keys run in parallel, limited by
/// `worker_concurrency` publish calls in flight. Lanes are created on first
/// use and retired as soon as they run empty.
///
/// The pool is the only component holding the `MessageBus`.
#[derive(Clone)]
pub struct DeliveryPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    bus: Arc<dyn MessageBus>,
    fallback: Arc<dyn FallbackStore>,
    lanes: DashMap<PartitionKey, Arc<KeyLane>>,
    workers: Semaphore,
    backoff: Backoff,
    config: DeliveryConfig,
    max_retries: u32,
    metrics: Arc<PipelineMetrics>,
    events: broadcast::Sender<DeliveryEvent>,
    // Submissions accepted (or blocked on a full lane) and not yet resolved
    pending: watch::Sender<usize>,
    accepting: AtomicBool,
    abort: CancellationToken,
    tracker: TaskTracker,
    bus_closed: AtomicBool,
    flushed_on_abort: AtomicUsize,
}

/// Holds one unit of the pending count for a submission that has not
/// reached its lane yet. Dropping it (error or cancelled caller) gives the
/// unit back.
struct PendingGuard<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(inner: &'a PoolInner) -> Self {
        inner.begin_one();
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.finish_one();
        }
    }
}

/// Frees the lane slot and settles the pending count of one dequeued
/// attempt, even if the worker driving it unwinds.
struct Settle<'a> {
    inner: &'a PoolInner,
    slot: Option<OwnedSemaphorePermit>,
}

impl<'a> Settle<'a> {
    fn new(inner: &'a PoolInner, slot: OwnedSemaphorePermit) -> Self {
        Self { inner, slot: Some(slot) }
    }
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        drop(self.slot.take());
        self.inner.finish_one();
    }
}

/// Hands the lane back if its worker stops without draining it, so the next
/// submit starts a new worker and `abort` can flush what is left.
struct LaneWorker<'a> {
    lane: &'a KeyLane,
    finished: bool,
}

impl Drop for LaneWorker<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.lane.state.lock();
        state.worker_active = false;
        error!(
            target: "amr_pipeline::delivery",
            partition_key = %self.lane.key,
            queued = state.queue.len(),
            "Lane worker stopped unexpectedly"
        );
    }
}

struct KeyLane {
    key: PartitionKey,
    // One permit per queued or in-progress attempt
    slots: Arc<Semaphore>,
    state: Mutex<LaneState>,
}

#[derive(Default)]
struct LaneState {
    queue: VecDeque<QueuedAttempt>,
    worker_active: bool,
    // Set once the worker found the queue empty; the lane takes no more work
    retired: bool,
}

struct QueuedAttempt {
    attempt: DeliveryAttempt,
    // Released once the attempt is published or handed to the fallback store
    slot: OwnedSemaphorePermit,
}

impl KeyLane {
    fn new(key: &str, depth: usize) -> Self {
        Self {
            key: key.to_string(),
            slots: Arc::new(Semaphore::new(depth)),
            state: Mutex::new(LaneState::default()),
        }
    }

    /// Queues `item` and reports whether a worker must be started.
    /// Hands the item back if the lane has already been retired.
    fn enqueue(&self, item: QueuedAttempt) -> std::result::Result<bool, QueuedAttempt> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(item);
        }
        state.queue.push_back(item);
        if state.worker_active {
            Ok(false)
        } else {
            state.worker_active = true;
            Ok(true)
        }
    }

    fn next(&self) -> Option<QueuedAttempt> {
        let mut state = self.state.lock();
        let next = state.queue.pop_front();
        if next.is_none() {
            state.worker_active = false;
            state.retired = true;
        }
        next
    }

    /// Takes the queue of a lane that has no worker left to drain it.
    fn take_stranded(&self) -> VecDeque<QueuedAttempt> {
        let mut state = self.state.lock();
        if state.worker_active {
            return VecDeque::new();
        }
        state.retired = true;
        std::mem::take(&mut state.queue)
    }
}

impl DeliveryPool {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        fallback: Arc<dyn FallbackStore>,
        config: DeliveryConfig,
        retry: &RetryConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        let (pending, _) = watch::channel(0usize);

        info!(
            target: "amr_pipeline::delivery",
            "Starting delivery pool: worker_concurrency={}, per_key_queue_depth={}, max_retries={}",
            config.worker_concurrency,
            config.per_key_queue_depth,
            retry.max_retries
        );

        Self {
            inner: Arc::new(PoolInner {
                bus,
                fallback,
                lanes: DashMap::new(),
                workers: Semaphore::new(config.worker_concurrency),
                backoff: Backoff::new(retry),
                config,
                max_retries: retry.max_retries,
                metrics,
                events,
                pending,
                accepting: AtomicBool::new(true),
                abort: CancellationToken::new(),
                tracker: TaskTracker::new(),
                bus_closed: AtomicBool::new(false),
                flushed_on_abort: AtomicUsize::new(0),
            }),
        }
    }

    /// Hands an attempt to the lane of its partition key.
    ///
    /// Waits while that lane is full; other keys are unaffected. Returns once
    /// the attempt is queued, not once it is published.
    ///
    /// # Errors
    ///
    /// * `PipelineError::PipelineShuttingDown` - the pool stopped accepting
    ///   work before or while this call was waiting for room
    pub async fn submit(&self, attempt: DeliveryAttempt) -> Result<()> {
        // Counted before the accepting check so wait_idle cannot miss it
        let pending = PendingGuard::new(&self.inner);
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(PipelineError::PipelineShuttingDown);
        }

        self.inner.enqueue(attempt).await?;
        // The lane worker settles the count from here on
        pending.disarm();
        Ok(())
    }

    /// Rejects further submissions. Already queued attempts keep running.
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Resolves once every submitted attempt is published or in the fallback store.
    pub async fn wait_idle(&self) {
        let mut pending = self.inner.pending.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us
        let _ = pending.wait_for(|count| *count == 0).await;
    }

    /// Stops all retries and moves every unresolved attempt to the fallback
    /// store. Returns how many records were flushed this way.
    pub async fn abort(&self) -> usize {
        self.stop_accepting();
        self.inner.abort.cancel();

        let lanes: Vec<Arc<KeyLane>> = self
            .inner
            .lanes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for lane in lanes {
            lane.slots.close();
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        // Queues whose worker died never saw the cancellation
        let stranded: Vec<QueuedAttempt> = self
            .inner
            .lanes
            .iter()
            .flat_map(|entry| entry.value().take_stranded())
            .collect();
        for QueuedAttempt { attempt, slot } in stranded {
            let _settle = Settle::new(&self.inner, slot);
            self.inner
                .move_to_fallback(attempt, FallbackReason::ShutdownDeadline)
                .await;
        }

        self.wait_idle().await;

        let flushed = self.inner.flushed_on_abort.load(Ordering::SeqCst);
        if flushed > 0 {
            warn!(
                target: "amr_pipeline::delivery",
                "Flushed {} unresolved records to the fallback store",
                flushed
            );
        }
        flushed
    }

    /// Closes the bus connection. Only the first call reaches the bus.
    pub async fn close_bus(&self) -> Result<()> {
        if self.inner.bus_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.inner.bus.close().await {
            Ok(()) => {
                info!(target: "amr_pipeline::delivery", "Message bus connection closed");
                Ok(())
            }
            Err(e) => {
                error!(target: "amr_pipeline::delivery", "Failed to close message bus connection: {}", e);
                Err(e.into())
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.events.subscribe()
    }

    /// Attempts queued or being published.
    pub fn in_flight(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Records held per partition key, including the one being published.
    pub fn queue_depths(&self) -> BTreeMap<PartitionKey, usize> {
        let capacity = self.inner.config.per_key_queue_depth;
        self.inner
            .lanes
            .iter()
            .filter_map(|entry| {
                let depth = capacity.saturating_sub(entry.value().slots.available_permits());
                (depth > 0).then(|| (entry.key().clone(), depth))
            })
            .collect()
    }
}

impl PoolInner {
    fn begin_one(&self) {
        self.pending.send_modify(|count| *count += 1);
        self.metrics.in_flight.inc();
    }

    fn finish_one(&self) {
        self.pending.send_modify(|count| *count = count.saturating_sub(1));
        self.metrics.in_flight.dec();
    }

    fn lane(&self, key: &str) -> Arc<KeyLane> {
        if let Some(lane) = self.lanes.get(key) {
            return Arc::clone(lane.value());
        }
        let depth = self.config.per_key_queue_depth;
        Arc::clone(
            self.lanes
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(KeyLane::new(key, depth)))
                .value(),
        )
    }

    async fn enqueue(self: &Arc<Self>, mut attempt: DeliveryAttempt) -> Result<()> {
        loop {
            let lane = self.lane(attempt.partition_key());

            let slot = tokio::select! {
                biased;
                _ = self.abort.cancelled() => return Err(PipelineError::PipelineShuttingDown),
                permit = Arc::clone(&lane.slots).acquire_owned() => {
                    permit.map_err(|_| PipelineError::PipelineShuttingDown)?
                }
            };

            match lane.enqueue(QueuedAttempt { attempt, slot }) {
                Ok(start_worker) => {
                    if start_worker {
                        let inner = Arc::clone(self);
                        self.tracker.spawn(async move { inner.run_lane(lane).await });
                    }
                    return Ok(());
                }
                Err(returned) => {
                    // Lost the race with the lane's retirement; the next lookup sees a fresh lane
                    attempt = returned.attempt;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn run_lane(self: Arc<Self>, lane: Arc<KeyLane>) {
        debug!(target: "amr_pipeline::delivery", partition_key = %lane.key, "Lane worker started");

        let mut worker = LaneWorker {
            lane: &lane,
            finished: false,
        };
        while let Some(QueuedAttempt { attempt, slot }) = lane.next() {
            let _settle = Settle::new(&self, slot);
            let retained = attempt.clone();
            if AssertUnwindSafe(self.deliver(attempt)).catch_unwind().await.is_err() {
                self.deliver_panicked(retained).await;
            }
        }
        worker.finished = true;

        self.lanes.remove_if(&lane.key, |_, current| Arc::ptr_eq(current, &lane));
        debug!(target: "amr_pipeline::delivery", partition_key = %lane.key, "Lane worker retired");
    }

    /// Drives one attempt until it is published or handed to the fallback store.
    /// Later records of the same key wait behind it.
    async fn deliver(&self, mut attempt: DeliveryAttempt) {
        let payload = match attempt.record().to_envelope() {
            Ok(payload) => payload,
            Err(e) => {
                let error = PublishError::Permanent(format!("failed to encode record envelope: {}", e));
                attempt.record_failure(error, Instant::now(), Duration::ZERO);
                self.metrics.permanent_failures.inc();
                self.move_to_fallback(attempt, FallbackReason::PermanentFailure).await;
                return;
            }
        };

        loop {
            if !attempt.is_due(Instant::now()) {
                tokio::select! {
                    biased;
                    _ = self.abort.cancelled() => {
                        self.move_to_fallback(attempt, FallbackReason::ShutdownDeadline).await;
                        return;
                    }
                    _ = sleep_until(attempt.next_retry_at()) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = self.abort.cancelled() => {
                    self.move_to_fallback(attempt, FallbackReason::ShutdownDeadline).await;
                    return;
                }
                result = self.publish_once(&attempt, payload.clone()) => result,
            };

            match result {
                Ok(()) => {
                    self.metrics.records_published.inc();
                    debug!(
                        target: "amr_pipeline::delivery",
                        record_id = %attempt.record().id(),
                        partition_key = attempt.partition_key(),
                        channel = attempt.channel(),
                        attempt = attempt.attempt_count(),
                        "Record published"
                    );
                    self.emit(DeliveryEvent::Published {
                        record_id: attempt.record().id(),
                        partition_key: attempt.partition_key().to_string(),
                        channel: attempt.channel().to_string(),
                        attempt_count: attempt.attempt_count(),
                    });
                    return;
                }
                Err(error) if error.is_retryable() => {
                    let delay = self.backoff.delay(attempt.attempt_count().saturating_add(1));
                    attempt.record_failure(error.clone(), Instant::now(), delay);

                    if attempt.exceeds_budget(self.max_retries) {
                        warn!(
                            target: "amr_pipeline::delivery",
                            record_id = %attempt.record().id(),
                            partition_key = attempt.partition_key(),
                            attempt = attempt.attempt_count(),
                            "Retry budget exhausted: {}",
                            error
                        );
                        self.move_to_fallback(attempt, FallbackReason::RetriesExhausted).await;
                        return;
                    }

                    self.metrics.publish_retries.inc();
                    debug!(
                        target: "amr_pipeline::delivery",
                        record_id = %attempt.record().id(),
                        partition_key = attempt.partition_key(),
                        attempt = attempt.attempt_count(),
                        delay_ms = delay.as_millis() as u64,
                        "Publish failed, retrying: {}",
                        error
                    );
                    self.emit(DeliveryEvent::Retrying {
                        record_id: attempt.record().id(),
                        partition_key: attempt.partition_key().to_string(),
                        channel: attempt.channel().to_string(),
                        attempt_count: attempt.attempt_count(),
                        next_retry_in: delay,
                        error,
                    });
                }
                Err(error) => {
                    warn!(
                        target: "amr_pipeline::delivery",
                        record_id = %attempt.record().id(),
                        partition_key = attempt.partition_key(),
                        channel = attempt.channel(),
                        "Publish rejected, not retrying: {}",
                        error
                    );
                    attempt.record_failure(error, Instant::now(), Duration::ZERO);
                    self.metrics.permanent_failures.inc();
                    self.move_to_fallback(attempt, FallbackReason::PermanentFailure).await;
                    return;
                }
            }
        }
    }

    async fn deliver_panicked(&self, mut attempt: DeliveryAttempt) {
        error!(
            target: "amr_pipeline::delivery",
            record_id = %attempt.record().id(),
            partition_key = attempt.partition_key(),
            "Delivery panicked, moving record to fallback store"
        );
        attempt.record_failure(
            PublishError::Permanent("delivery panicked".to_string()),
            Instant::now(),
            Duration::ZERO,
        );
        self.metrics.permanent_failures.inc();
        self.move_to_fallback(attempt, FallbackReason::PermanentFailure).await;
    }

    async fn publish_once(&self, attempt: &DeliveryAttempt, payload: Bytes) -> std::result::Result<(), PublishError> {
        let _worker = self
            .workers
            .acquire()
            .await
            .map_err(|_| PublishError::Transient("delivery workers unavailable".to_string()))?;

        let publish = self.bus.publish(attempt.channel(), attempt.partition_key(), payload);
        match timeout(self.config.publish_timeout(), publish).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Transient(format!(
                "publish timed out after {}ms",
                self.config.publish_timeout_ms
            ))),
        }
    }

    async fn move_to_fallback(&self, attempt: DeliveryAttempt, reason: FallbackReason) {
        let record_id = attempt.record().id();
        let partition_key = attempt.partition_key().to_string();
        let channel = attempt.channel().to_string();
        let attempt_count = attempt.attempt_count();
        let first_failure_at = attempt.first_failure_at().unwrap_or_else(Utc::now);
        let last_error = attempt.last_error().cloned();
        let record = attempt.into_record();

        let mut tries = 0;
        loop {
            tries += 1;
            let put = self
                .fallback
                .put(record.clone(), attempt_count, first_failure_at, last_error.clone())
                .await;

            match put {
                Ok(entry_id) => {
                    self.metrics.fallback_transfers.inc();
                    self.metrics.fallback_size.inc();
                    if reason == FallbackReason::ShutdownDeadline {
                        self.flushed_on_abort.fetch_add(1, Ordering::SeqCst);
                    }
                    info!(
                        target: "amr_pipeline::delivery",
                        record_id = %record_id,
                        partition_key = %partition_key,
                        entry_id = %entry_id,
                        reason = ?reason,
                        "Record moved to fallback store"
                    );
                    self.emit(DeliveryEvent::MovedToFallback {
                        record_id,
                        partition_key,
                        channel,
                        attempt_count,
                        reason,
                        entry_id,
                    });
                    return;
                }
                Err(e) if tries < FALLBACK_PUT_ATTEMPTS => {
                    warn!(
                        target: "amr_pipeline::delivery",
                        record_id = %record_id,
                        "Fallback store write failed (try {}/{}): {}",
                        tries,
                        FALLBACK_PUT_ATTEMPTS,
                        e
                    );
                    sleep(FALLBACK_PUT_RETRY_DELAY * tries).await;
                }
                Err(e) => {
                    self.metrics.fallback_persist_failures.inc();
                    error!(
                        target: "amr_pipeline::delivery",
                        record_id = %record_id,
                        partition_key = %partition_key,
                        "Fallback store unavailable, record lost: {}",
                        e
                    );
                    self.emit(DeliveryEvent::FallbackPersistFailed {
                        record_id,
                        partition_key,
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    fn emit(&self, event: DeliveryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
