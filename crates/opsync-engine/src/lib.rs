//! The scheduler (spec §4.9, §2): acquires the processing lock, runs the
//! single processing loop, and orchestrates every other component. This is
//! the crate every app embeds; everything else in the workspace is a leaf it
//! composes.
//!
//! Grounded on the teacher's `AppState` + `spawn_heartbeat` shape
//! (`mqk-daemon`): a shared, `Arc`-wrapped core cloned into background
//! tasks, a `broadcast` bus for status fan-out, and a plain
//! `Arc<AtomicBool>` run flag rather than a cancellation-token crate.

pub mod config;

pub use config::{ConfigError, EngineConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opsync_backoff::BackoffPolicy;
use opsync_breaker::{CircuitBreaker, CircuitMode};
use opsync_http::{ApiClient, AuthProvider, ClientIdentity, Router, Transport};
use opsync_kvstore::PersistentMap;
use opsync_lock::ProcessingLock;
use opsync_metrics::{Alert, MetricsSink};
use opsync_optimistic::OptimisticStore;
use opsync_queue::{EnqueueOutcome, Queue, QueueError};
use opsync_reconcile::{FingerprintConfig, ReconcileOutcome, Reconciler, RemoteLookup};
use opsync_types::{EnqueueOptions, ErrorKind, LastError, OpType, PendingOp, Payload};
use rand::{RngCore, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

/// Injected wall clock (spec §9: clock injection is mandatory for
/// deterministic tests of backoff, breaker, and lock takeover).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Injected randomness for `BackoffPolicy::delay_for`'s jitter term, serialized
/// behind a mutex so it can be shared across the one processing loop (spec §9
/// names `random` as one of the `EngineDependencies`).
pub struct EngineRng(AsyncMutex<Box<dyn RngCore + Send>>);

impl EngineRng {
    pub fn new(rng: Box<dyn RngCore + Send>) -> Self {
        Self(AsyncMutex::new(rng))
    }

    pub fn from_entropy() -> Self {
        Self::new(Box::new(rand::rngs::StdRng::from_entropy()))
    }

    async fn delay_for(&self, policy: &BackoffPolicy, attempts: u32) -> StdDuration {
        let mut rng = self.0.lock().await;
        policy.delay_for(attempts, &mut **rng)
    }
}

/// The `{ persistentMap, authProvider, clock, random, metricsSink }` bundle
/// spec §9 calls for in place of global singletons. `Engine::new` takes the
/// router and reconciler fingerprint configuration separately since those are
/// wiring, not runtime collaborators.
pub struct EngineDependencies<M: PersistentMap, T: Transport, A: AuthProvider> {
    pub persistent_map: Arc<M>,
    pub transport: T,
    pub auth_provider: A,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<EngineRng>,
    pub metrics_sink: Arc<dyn MetricsSink>,
}

/// Per-op status transitions, delivered over a buffered, lossless channel
/// (spec §5: "observers see transitions in order").
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Enqueued { id: String },
    InFlight { id: String },
    Succeeded { id: String },
    RetryScheduled { id: String, not_before: DateTime<Utc> },
    Reconciling { id: String },
    AuthRequired { id: String },
    Failed { id: String, reason: String },
    Recovered { id: String },
    BreakerModeChanged { mode: CircuitMode },
    Halted { reason: String },
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub queue_depth: u64,
    pub failed_depth: u64,
    pub breaker_mode: CircuitMode,
    pub alerts: Vec<Alert>,
}

struct EngineLookup<T: Transport, A: AuthProvider> {
    api: Arc<ApiClient<T, A>>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl<T: Transport, A: AuthProvider> RemoteLookup for EngineLookup<T, A> {
    async fn fetch(&self, op: &PendingOp) -> Result<Option<Payload>, LastError> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        self.api.fetch(op, &trace_id, self.clock.now()).await
    }
}

struct EngineCore<M: PersistentMap, T: Transport, A: AuthProvider> {
    queue: Queue<M>,
    lock: ProcessingLock<M>,
    breaker: AsyncMutex<CircuitBreaker>,
    backoff: BackoffPolicy,
    api: Arc<ApiClient<T, A>>,
    reconciler: Reconciler,
    optimistic: OptimisticStore,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    rng: Arc<EngineRng>,
    config: EngineConfig,
    holder_id: String,
    running: AtomicBool,
    halted_reason: AsyncMutex<Option<String>>,
    status_tx: broadcast::Sender<StatusEvent>,
    metrics_tx: broadcast::Sender<MetricsSnapshot>,
    auth_updated: Notify,
    shutdown: Notify,
    enqueue_signal: Notify,
    loop_handle: AsyncMutex<Option<JoinHandle<()>>>,
    heartbeat_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

/// The scheduler (spec §4.9). Cheaply `Clone`able — every clone shares the
/// same underlying state, the same way a `tokio::sync::broadcast::Sender`
/// handle does.
pub struct Engine<M: PersistentMap, T: Transport, A: AuthProvider>(Arc<EngineCore<M, T, A>>);

impl<M: PersistentMap, T: Transport, A: AuthProvider> Clone for Engine<M, T, A> {
    fn clone(&self) -> Self {
        Engine(self.0.clone())
    }
}

impl<M, T, A> Engine<M, T, A>
where
    M: PersistentMap + 'static,
    T: Transport + 'static,
    A: AuthProvider + 'static,
{
    pub async fn new(
        config: EngineConfig,
        deps: EngineDependencies<M, T, A>,
        router: Router,
        fingerprints: FingerprintConfig,
        holder_id: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let queue = Queue::load(deps.persistent_map.clone()).await?;
        let lock = ProcessingLock::new(deps.persistent_map.clone());
        let breaker = AsyncMutex::new(CircuitBreaker::new(config.breaker));
        let identity = ClientIdentity {
            app_version: config.app_version.clone(),
            device_id: config.device_id.clone(),
        };
        let api = Arc::new(
            ApiClient::new(deps.transport, deps.auth_provider, router, config.base_url.clone(), identity)
                .with_timeout(config.http_timeout),
        );
        let (status_tx, _) = broadcast::channel(256);
        let (metrics_tx, _) = broadcast::channel(64);

        let core = EngineCore {
            queue,
            lock,
            breaker,
            backoff: config.backoff,
            api,
            reconciler: Reconciler::new(fingerprints),
            optimistic: OptimisticStore::new(),
            metrics: deps.metrics_sink,
            clock: deps.clock,
            rng: deps.random,
            config,
            holder_id: holder_id.into(),
            running: AtomicBool::new(false),
            halted_reason: AsyncMutex::new(None),
            status_tx,
            metrics_tx,
            auth_updated: Notify::new(),
            shutdown: Notify::new(),
            enqueue_signal: Notify::new(),
            loop_handle: AsyncMutex::new(None),
            heartbeat_handle: AsyncMutex::new(None),
        };
        Ok(Engine(Arc::new(core)))
    }

    /// Spec §6.1 `enqueue`. Resolves to the canonical `(outcome, id)` pair —
    /// `id` is not always the op passed in, e.g. an `UPDATE` merged into an
    /// existing queued op reports the existing op's id.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        id: impl Into<String>,
        op_type: OpType,
        entity_type: impl Into<String>,
        entity_id: Option<String>,
        payload: Payload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let core = &self.0;
        let now = core.clock.now();
        let op = PendingOp::new(id.into(), op_type, entity_type.into(), entity_id, payload, &options, now);
        let outcome = core.queue.enqueue(op).await?;

        match &outcome {
            EnqueueOutcome::Inserted { id } => {
                core.metrics.incr_counter("ops_enqueued", 1);
                core.emit_status(StatusEvent::Enqueued { id: id.clone() });
            }
            EnqueueOutcome::Annihilated {
                removed_create_txn_token,
                incoming_delete_txn_token,
                ..
            } => {
                // spec S6: "both transaction tokens receive commit ... or
                // both rollbacks at the app's discretion — the engine
                // guarantees one terminal notification per op." Neither op
                // ever reached the network, so both are treated as
                // successfully-applied no-ops: commit both.
                if let Some(token) = removed_create_txn_token {
                    core.optimistic.commit(token);
                }
                if let Some(token) = incoming_delete_txn_token {
                    core.optimistic.commit(token);
                }
            }
            EnqueueOutcome::MergedIntoExisting { .. } | EnqueueOutcome::RejectedDuplicateCreate { .. } => {}
        }

        core.enqueue_signal.notify_waiters();
        Ok(outcome)
    }

    /// Spec §6.1 `cancel`. Only legal while the op is still `queued`.
    pub async fn cancel(&self, id: &str) -> Result<(), QueueError> {
        let op = self.0.queue.cancel(id).await?;
        if let Some(token) = &op.txn_token {
            self.0.optimistic.rollback(token);
        }
        Ok(())
    }

    /// Spec §6.1 `retryFromFailed`.
    pub async fn retry_from_failed(&self, id: &str) -> Result<bool, QueueError> {
        let now = self.0.clock.now();
        let moved = self.0.queue.retry_from_failed(id, now).await?;
        if moved {
            self.0.enqueue_signal.notify_waiters();
        }
        Ok(moved)
    }

    /// Spec §4.7 `optimistic.register` passthrough.
    pub fn optimistic(&self) -> &OptimisticStore {
        &self.0.optimistic
    }

    pub fn queue_size(&self) -> &Queue<M> {
        &self.0.queue
    }

    /// Wake a paused loop after the app refreshes credentials out-of-band
    /// (spec §4.9 step 8, §5 signal list).
    pub fn notify_auth_updated(&self) {
        self.0.auth_updated.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    pub async fn halted_reason(&self) -> Option<String> {
        self.0.halted_reason.lock().await.clone()
    }

    pub fn on_status_change(&self) -> broadcast::Receiver<StatusEvent> {
        self.0.status_tx.subscribe()
    }

    pub fn on_metrics_update(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.0.metrics_tx.subscribe()
    }

    /// Spec §4.9 `start()`. Returns once the processing task has been
    /// spawned; lock acquisition (which may itself wait and retry) happens
    /// inside that task, not before this returns.
    pub async fn start(&self) {
        if self.0.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.0.halted_reason.lock().await = None;

        let core = self.0.clone();
        let handle = tokio::spawn(async move { core.run().await });
        *self.0.loop_handle.lock().await = Some(handle);
    }

    /// Spec §4.9 `stop()`. Cancels the loop and releases the lock; an
    /// in-flight op is left `inFlight` and is recovered on the next `start()`.
    pub async fn stop(&self) {
        self.0.running.store(false, Ordering::SeqCst);
        self.0.shutdown.notify_waiters();
        if let Some(handle) = self.0.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.0.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
        self.0.lock.release(&self.0.holder_id).await.ok();
    }
}

impl<M, T, A> EngineCore<M, T, A>
where
    M: PersistentMap + 'static,
    T: Transport + 'static,
    A: AuthProvider + 'static,
{
    fn emit_status(&self, event: StatusEvent) {
        let _ = self.status_tx.send(event);
    }

    async fn halt(&self, reason: String) {
        tracing::error!(reason = %reason, "engine halting, operator intervention required");
        *self.halted_reason.lock().await = Some(reason.clone());
        self.running.store(false, Ordering::SeqCst);
        self.emit_status(StatusEvent::Halted { reason });
    }

    async fn publish_metrics_snapshot(&self) {
        let queue_depth = self.queue.size().await.unwrap_or(0) as u64;
        let failed_depth = self.queue.failed_size().await.unwrap_or(0) as u64;
        let (breaker_mode, opened_at) = {
            let breaker = self.breaker.lock().await;
            (breaker.mode(), breaker.opened_at())
        };
        self.metrics.set_gauge("queue_depth", queue_depth as i64);
        self.metrics.set_gauge("failed_depth", failed_depth as i64);

        let now = self.clock.now();
        let alerts = self
            .config
            .alert_thresholds
            .evaluate(queue_depth, failed_depth, opened_at, now);
        let _ = self.metrics_tx.send(MetricsSnapshot {
            queue_depth,
            failed_depth,
            breaker_mode,
            alerts,
        });
    }

    /// Spec §4.9 `start()` steps 1-4, then the loop itself.
    async fn run(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let now = self.clock.now();
            match self.lock.try_acquire(&self.holder_id, self.config.lock_ttl, now).await {
                Ok(true) => break,
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(StdDuration::from_millis(250)) => {}
                        _ = self.shutdown.notified() => return,
                    }
                }
                Err(e) => {
                    self.halt(format!("processing lock acquisition failed: {e}")).await;
                    return;
                }
            }
        }

        let heartbeat_core = self.clone();
        let heartbeat_handle = tokio::spawn(async move { heartbeat_core.run_heartbeat().await });
        *self.heartbeat_handle.lock().await = Some(heartbeat_handle);

        let now = self.clock.now();
        match self.queue.recover_stale_in_flight(now).await {
            Ok(recovered) => {
                for op in recovered {
                    self.emit_status(StatusEvent::Recovered { id: op.id });
                }
            }
            Err(e) => {
                self.halt(format!("startup recovery failed: {e}")).await;
                return;
            }
        }

        self.processing_loop().await;

        if let Some(handle) = self.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
        let _ = self.lock.release(&self.holder_id).await;
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval.to_std().unwrap_or(StdDuration::from_secs(40));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.notified() => return,
            }
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let now = self.clock.now();
            match self.lock.heartbeat(&self.holder_id, self.config.lock_ttl, now).await {
                Ok(true) => {}
                Ok(false) => {
                    self.halt("processing lock lost: heartbeat no longer matches the current holder".to_string())
                        .await;
                    return;
                }
                Err(e) => {
                    self.halt(format!("heartbeat storage error: {e}")).await;
                    return;
                }
            }
        }
    }

    /// `allow_attempt` must gate every individual attempt, not every loop
    /// tick — calling it while idle would burn the single half-open probe
    /// slot on a dequeue that never happens. So this is only called once a
    /// runnable op is in hand (spec §4.4, §4.9 step 1).
    async fn try_allow_attempt(&self, now: DateTime<Utc>) -> bool {
        let mut breaker = self.breaker.lock().await;
        let before = breaker.mode();
        let allowed = breaker.allow_attempt(now);
        let after = breaker.mode();
        drop(breaker);
        if before != after {
            self.emit_status(StatusEvent::BreakerModeChanged { mode: after });
        }
        allowed
    }

    /// Spec §4.9 loop iteration, steps 1-2: breaker gating and dequeue.
    async fn processing_loop(self: &Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let now = self.clock.now();

            // Fast path: `half_open_ready_at` is only `Some` while `Open`, so
            // this skips the queue scan entirely during the cooldown window
            // without mutating breaker state.
            if let Some(ready_at) = self.breaker.lock().await.half_open_ready_at() {
                if ready_at > now {
                    let wait = (ready_at - now).to_std().unwrap_or(StdDuration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.shutdown.notified() => return,
                    }
                    continue;
                }
            }

            let next = match self.queue.peek_next_runnable(now).await {
                Ok(v) => v,
                Err(e) => {
                    self.halt(format!("queue scan failed: {e}")).await;
                    return;
                }
            };

            let Some(op) = next else {
                self.publish_metrics_snapshot().await;
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_poll_cap) => {}
                    _ = self.enqueue_signal.notified() => {}
                    _ = self.shutdown.notified() => return,
                }
                continue;
            };

            if !self.try_allow_attempt(now).await {
                // Cooldown elapsed but the single half-open probe is already
                // spoken for (or the breaker re-opened between the fast-path
                // check and here) — back off briefly and re-evaluate.
                tokio::select! {
                    _ = tokio::time::sleep(StdDuration::from_millis(50)) => {}
                    _ = self.shutdown.notified() => return,
                }
                continue;
            }

            if !self.process_one(op).await {
                return;
            }
            self.publish_metrics_snapshot().await;
        }
    }

    /// Steps 3-10 for one dequeued op.
    async fn process_one(self: &Arc<Self>, op: PendingOp) -> bool {
        let now = self.clock.now();
        let in_flight = match self.queue.mark_in_flight(&op.id, now).await {
            Ok(o) => o,
            Err(e) => {
                self.halt(format!("mark_in_flight failed for op {}: {e}", op.id)).await;
                return false;
            }
        };
        self.emit_status(StatusEvent::InFlight { id: in_flight.id.clone() });

        // Spec §4.6: the three-way merge's base is "the server-last-known
        // snapshot, stored with op when first in-flight" — capture it here,
        // once, before the first attempt ever reaches the network.
        let in_flight = if in_flight.op_type == OpType::Update && in_flight.merge_base.is_none() {
            match self.capture_merge_base(&in_flight).await {
                Ok(updated) => updated,
                Err(err) => return self.handle_error(in_flight, err).await,
            }
        } else {
            in_flight
        };

        let trace_id = uuid::Uuid::new_v4().to_string();
        let dispatch_start = self.clock.now();
        let result = self.api.execute(&in_flight, &trace_id, dispatch_start).await;
        let elapsed_ms = (self.clock.now() - dispatch_start).num_milliseconds().max(0) as u64;
        self.metrics.record_latency_ms("op_dispatch_ms", elapsed_ms);

        match result {
            Ok(_body) => self.handle_success(in_flight).await,
            Err(err) => self.handle_error(in_flight, err).await,
        }
    }

    /// `GET` the entity's current remote state and persist it as `op.merge_base`.
    /// `Ok(None)` (the entity does not exist remotely yet) is stored as an
    /// empty map — still a captured base, just one with nothing in it.
    async fn capture_merge_base(&self, op: &PendingOp) -> Result<PendingOp, LastError> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now();
        let remote = self.api.fetch(op, &trace_id, now).await?;
        self.queue
            .set_merge_base(&op.id, remote.unwrap_or_default(), now)
            .await
            .map_err(|e| LastError {
                kind: ErrorKind::Storage,
                message: format!("failed to persist merge base for op {}: {e}", op.id),
                http_status: None,
                retry_after: None,
            })
    }

    async fn handle_success(self: &Arc<Self>, op: PendingOp) -> bool {
        let now = self.clock.now();
        self.breaker.lock().await.record_success(now);

        match self.queue.mark_succeeded(&op.id).await {
            Ok(final_op) => {
                self.metrics.incr_counter("ops_succeeded", 1);
                if let Some(token) = &final_op.txn_token {
                    self.optimistic.commit(token);
                }
                self.emit_status(StatusEvent::Succeeded { id: final_op.id });
                true
            }
            Err(e) => {
                self.halt(format!("mark_succeeded failed for op {}: {e}", op.id)).await;
                false
            }
        }
    }

    async fn handle_error(self: &Arc<Self>, op: PendingOp, err: LastError) -> bool {
        let now = self.clock.now();

        // A `DELETE` redelivered after the server already applied it (e.g.
        // after a crash-restart redispatch) gets a `404` back, which is the
        // expected shape of success, not a failure (spec §4.5, scenario S3).
        if op.op_type == OpType::Delete && err.kind == ErrorKind::NotFound {
            return self.handle_success(op).await;
        }

        if err.kind.counts_toward_breaker() {
            let mut breaker = self.breaker.lock().await;
            let before = breaker.mode();
            breaker.record_failure(now);
            let after = breaker.mode();
            drop(breaker);
            if before != after {
                self.emit_status(StatusEvent::BreakerModeChanged { mode: after });
            }
        }

        if err.kind == ErrorKind::Auth {
            return self.handle_auth_failure(op, err, now).await;
        }
        if err.kind == ErrorKind::Conflict {
            return self.handle_conflict(op, now).await;
        }
        if err.kind.is_transient() {
            return self.handle_retryable(op, err, now).await;
        }
        if err.kind.is_fatal() {
            self.halt(format!("fatal error on op {}: {}", op.id, err.message)).await;
            return false;
        }
        // Everything else in the taxonomy is terminal (spec §7).
        self.handle_terminal(op, err, now).await
    }

    /// Step 6: `Retryable | Network | Server`.
    async fn handle_retryable(self: &Arc<Self>, op: PendingOp, err: LastError, now: DateTime<Utc>) -> bool {
        if op.attempts >= op.max_attempts {
            let exhausted = LastError {
                kind: ErrorKind::ExhaustedRetries,
                message: format!("exceeded max attempts ({}): {}", op.max_attempts, err.message),
                http_status: err.http_status,
                retry_after: None,
            };
            return self.handle_terminal(op, exhausted, now).await;
        }

        let computed = self.rng.delay_for(&self.backoff, op.attempts).await;
        let hint = err.retry_after.and_then(|at| (at - now).to_std().ok());
        let effective = BackoffPolicy::effective_delay(computed, hint);
        let not_before = now + chrono::Duration::from_std(effective).unwrap_or_else(|_| chrono::Duration::zero());

        match self.queue.schedule_retry(&op.id, not_before, err, now).await {
            Ok(updated) => {
                self.metrics.incr_counter("ops_retried", 1);
                self.emit_status(StatusEvent::RetryScheduled { id: updated.id, not_before });
                true
            }
            Err(e) => {
                self.halt(format!("schedule_retry failed for op {}: {e}", op.id)).await;
                false
            }
        }
    }

    /// Step 7: `Conflict`.
    async fn handle_conflict(self: &Arc<Self>, op: PendingOp, now: DateTime<Utc>) -> bool {
        let reconciling = match self.queue.mark_reconciling(&op.id, now).await {
            Ok(o) => o,
            Err(e) => {
                self.halt(format!("mark_reconciling failed for op {}: {e}", op.id)).await;
                return false;
            }
        };
        self.emit_status(StatusEvent::Reconciling { id: reconciling.id.clone() });

        let lookup = EngineLookup {
            api: self.api.clone(),
            clock: self.clock.clone(),
        };

        match self.reconciler.reconcile(&reconciling, &lookup).await {
            Ok(ReconcileOutcome::TreatAsSucceeded) => self.handle_success(reconciling).await,
            Ok(ReconcileOutcome::Requeue { payload }) => {
                match self.queue.requeue_with_merged_payload(&reconciling.id, payload, now).await {
                    Ok(requeued) => {
                        self.metrics.incr_counter("ops_reconciled", 1);
                        self.emit_status(StatusEvent::RetryScheduled { id: requeued.id, not_before: now });
                        true
                    }
                    Err(e) => {
                        self.halt(format!("requeue_with_merged_payload failed for op {}: {e}", reconciling.id))
                            .await;
                        false
                    }
                }
            }
            Ok(ReconcileOutcome::Unresolved { reason }) => {
                let err = LastError {
                    kind: ErrorKind::ConflictUnresolved,
                    message: reason,
                    http_status: None,
                    retry_after: None,
                };
                self.handle_terminal(reconciling, err, now).await
            }
            Err(lookup_err) if lookup_err.kind.is_transient() => {
                self.handle_retryable(reconciling, lookup_err, now).await
            }
            Err(lookup_err) => self.handle_terminal(reconciling, lookup_err, now).await,
        }
    }

    /// Step 8: `Auth` after a failed refresh. Does not archive the op — it
    /// stays `queued`, eligible for immediate re-dequeue once the app signals
    /// fresh credentials are available.
    async fn handle_auth_failure(self: &Arc<Self>, op: PendingOp, err: LastError, now: DateTime<Utc>) -> bool {
        match self.queue.schedule_retry(&op.id, now, err, now).await {
            Ok(updated) => {
                self.emit_status(StatusEvent::AuthRequired { id: updated.id });
                tokio::select! {
                    _ = self.auth_updated.notified() => true,
                    _ = self.shutdown.notified() => false,
                }
            }
            Err(e) => {
                self.halt(format!("schedule_retry failed for op {}: {e}", op.id)).await;
                false
            }
        }
    }

    /// Step 9: every terminal `ErrorKind`.
    async fn handle_terminal(self: &Arc<Self>, op: PendingOp, err: LastError, now: DateTime<Utc>) -> bool {
        let reason = err.message.clone();
        match self.queue.archive_to_failed(&op.id, reason, err, now).await {
            Ok(archived) => {
                self.metrics.incr_counter("ops_failed", 1);
                if let Some(token) = &archived.txn_token {
                    self.optimistic.rollback(token);
                }
                let reason = archived.last_error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
                self.emit_status(StatusEvent::Failed { id: archived.id, reason });
                true
            }
            Err(e) => {
                self.halt(format!("archive_to_failed failed for op {}: {e}", op.id)).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_http::{OutgoingRequest, RouteSpec, TransportError, TransportResponse};
    use opsync_kvstore::InMemoryPersistentMap;
    use opsync_metrics::InMemoryMetrics;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as TokioMutex;

    struct FixedClock(StdMutex<DateTime<Utc>>);

    impl FixedClock {
        fn new(t: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(t)))
        }
        fn advance(&self, by: chrono::Duration) {
            let mut t = self.0.lock().unwrap();
            *t = *t + by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    struct NoopAuth;

    #[async_trait]
    impl AuthProvider for NoopAuth {
        async fn access_token(&self) -> Result<String, opsync_http::AuthError> {
            Ok("token".to_string())
        }
        async fn refresh(&self) -> Result<String, opsync_http::AuthError> {
            Ok("token-2".to_string())
        }
    }

    /// Always responds `201` to every request; used for happy-path tests.
    struct AlwaysOkTransport {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Transport for AlwaysOkTransport {
        async fn send(&self, _request: OutgoingRequest) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TransportResponse {
                status: 201,
                headers: vec![],
                body: serde_json::to_vec(&serde_json::json!({"ok": true})).unwrap(),
            })
        }
    }

    /// Returns scripted statuses in order, then repeats the last one.
    struct ScriptedTransport {
        statuses: TokioMutex<Vec<u16>>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _request: OutgoingRequest) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock().await;
            let status = if statuses.len() > 1 { statuses.remove(0) } else { statuses[0] };
            Ok(TransportResponse {
                status,
                headers: vec![],
                body: serde_json::to_vec(&serde_json::json!({"ok": status < 300})).unwrap(),
            })
        }
    }

    fn router_with_device_create() -> Router {
        let mut router = Router::new();
        router.register(
            OpType::Create,
            "device",
            RouteSpec {
                method: reqwest::Method::POST,
                path_template: "/v1/devices".into(),
                requires_idempotency: true,
            },
        );
        router
    }

    fn router_with_device_update_and_lookup() -> Router {
        let mut router = Router::new();
        router.register(
            OpType::Update,
            "device",
            RouteSpec {
                method: reqwest::Method::PATCH,
                path_template: "/v1/devices/{entity_id}".into(),
                requires_idempotency: true,
            },
        );
        router.register_lookup(
            "device",
            opsync_http::LookupRouteSpec {
                path_template: "/v1/devices/{entity_id}".into(),
            },
        );
        router
    }

    async fn engine_with_transport(
        transport: AlwaysOkTransport,
        clock: Arc<FixedClock>,
    ) -> Engine<InMemoryPersistentMap, AlwaysOkTransport, NoopAuth> {
        let deps = EngineDependencies {
            persistent_map: Arc::new(InMemoryPersistentMap::new()),
            transport,
            auth_provider: NoopAuth,
            clock: clock.clone(),
            random: Arc::new(EngineRng::new(Box::new(rand::rngs::mock::StepRng::new(0, 0)))),
            metrics_sink: Arc::new(InMemoryMetrics::new()),
        };
        Engine::new(
            EngineConfig::default(),
            deps,
            router_with_device_create(),
            FingerprintConfig::new(),
            "test-holder",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_start_drains_the_queue_on_success() {
        let clock = FixedClock::new(DateTime::UNIX_EPOCH);
        let engine = engine_with_transport(AlwaysOkTransport { calls: AtomicU64::new(0) }, clock).await;

        let mut status = engine.on_status_change();
        let mut payload = Payload::new();
        payload.insert("name".into(), serde_json::json!("Lamp"));
        engine
            .enqueue("op-1", OpType::Create, "device", Some("d1".into()), payload, EnqueueOptions::default())
            .await
            .unwrap();

        engine.start().await;

        let mut saw_succeeded = false;
        for _ in 0..10 {
            match tokio::time::timeout(StdDuration::from_secs(1), status.recv()).await {
                Ok(Ok(StatusEvent::Succeeded { id })) if id == "op-1" => {
                    saw_succeeded = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_succeeded, "expected op-1 to succeed");
        engine.stop().await;
    }

    #[tokio::test]
    async fn retryable_error_reschedules_with_backoff() {
        let clock = FixedClock::new(DateTime::UNIX_EPOCH);
        let deps = EngineDependencies {
            persistent_map: Arc::new(InMemoryPersistentMap::new()),
            transport: ScriptedTransport {
                statuses: TokioMutex::new(vec![503, 201]),
                calls: AtomicU64::new(0),
            },
            auth_provider: NoopAuth,
            clock: clock.clone(),
            random: Arc::new(EngineRng::new(Box::new(rand::rngs::mock::StepRng::new(0, 0)))),
            metrics_sink: Arc::new(InMemoryMetrics::new()),
        };
        let engine = Engine::new(
            EngineConfig::default(),
            deps,
            router_with_device_create(),
            FingerprintConfig::new(),
            "test-holder",
        )
        .await
        .unwrap();

        let mut status = engine.on_status_change();
        engine
            .enqueue("op-1", OpType::Create, "device", Some("d1".into()), Payload::new(), EnqueueOptions::default())
            .await
            .unwrap();
        engine.start().await;

        let mut saw_retry = false;
        for _ in 0..10 {
            match tokio::time::timeout(StdDuration::from_secs(1), status.recv()).await {
                Ok(Ok(StatusEvent::RetryScheduled { id, .. })) if id == "op-1" => {
                    saw_retry = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_retry, "expected op-1 to be rescheduled after a 503");
        engine.stop().await;
    }

    #[tokio::test]
    async fn terminal_error_archives_and_rolls_back() {
        let clock = FixedClock::new(DateTime::UNIX_EPOCH);
        let deps = EngineDependencies {
            persistent_map: Arc::new(InMemoryPersistentMap::new()),
            transport: ScriptedTransport {
                statuses: TokioMutex::new(vec![422]),
                calls: AtomicU64::new(0),
            },
            auth_provider: NoopAuth,
            clock: clock.clone(),
            random: Arc::new(EngineRng::new(Box::new(rand::rngs::mock::StepRng::new(0, 0)))),
            metrics_sink: Arc::new(InMemoryMetrics::new()),
        };
        let engine = Engine::new(
            EngineConfig::default(),
            deps,
            router_with_device_create(),
            FingerprintConfig::new(),
            "test-holder",
        )
        .await
        .unwrap();

        let rolled_back = Arc::new(AtomicU64::new(0));
        let rb = rolled_back.clone();
        engine
            .enqueue(
                "op-1",
                OpType::Create,
                "device",
                Some("d1".into()),
                Payload::new(),
                EnqueueOptions {
                    txn_token: Some("txn-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.optimistic().register(
            "txn-1",
            Box::new(move || {
                rb.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(|| {}),
        );

        let mut status = engine.on_status_change();
        engine.start().await;

        let mut saw_failed = false;
        for _ in 0..10 {
            match tokio::time::timeout(StdDuration::from_secs(1), status.recv()).await {
                Ok(Ok(StatusEvent::Failed { id, .. })) if id == "op-1" => {
                    saw_failed = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_failed);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn annihilated_coalesce_commits_both_transaction_tokens() {
        let clock = FixedClock::new(DateTime::UNIX_EPOCH);
        let engine = engine_with_transport(AlwaysOkTransport { calls: AtomicU64::new(0) }, clock).await;

        let create_committed = Arc::new(AtomicU64::new(0));
        let delete_committed = Arc::new(AtomicU64::new(0));
        let (cc, dc) = (create_committed.clone(), delete_committed.clone());

        engine
            .enqueue(
                "op-1",
                OpType::Create,
                "chat_message",
                Some("m1".into()),
                Payload::new(),
                EnqueueOptions {
                    txn_token: Some("create-txn".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.optimistic().register(
            "create-txn",
            Box::new(|| {}),
            Box::new(move || {
                cc.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let outcome = engine
            .enqueue(
                "op-2",
                OpType::Delete,
                "chat_message",
                Some("m1".into()),
                Payload::new(),
                EnqueueOptions {
                    txn_token: Some("delete-txn".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Annihilated { .. }));

        engine.optimistic().register(
            "delete-txn",
            Box::new(|| {}),
            Box::new(move || {
                dc.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // Registered after the fact only to exercise `is_registered`; the
        // real commit already fired synchronously inside `enqueue` using the
        // tokens captured on the ops themselves, so this second register is
        // inert for "create-txn" and "delete-txn" was never outstanding.
        assert_eq!(create_committed.load(Ordering::SeqCst), 1);
        assert_eq!(delete_committed.load(Ordering::SeqCst), 0);
    }

    /// Spec §4.6: the first attempt of an `UPDATE` must capture a merge base
    /// via a `GET` before the actual `PATCH` — two transport calls, not one.
    #[tokio::test]
    async fn update_captures_merge_base_before_first_attempt() {
        let clock = FixedClock::new(DateTime::UNIX_EPOCH);
        let deps = EngineDependencies {
            persistent_map: Arc::new(InMemoryPersistentMap::new()),
            transport: ScriptedTransport {
                statuses: TokioMutex::new(vec![200, 200]),
                calls: AtomicU64::new(0),
            },
            auth_provider: NoopAuth,
            clock: clock.clone(),
            random: Arc::new(EngineRng::new(Box::new(rand::rngs::mock::StepRng::new(0, 0)))),
            metrics_sink: Arc::new(InMemoryMetrics::new()),
        };
        let engine = Engine::new(
            EngineConfig::default(),
            deps,
            router_with_device_update_and_lookup(),
            FingerprintConfig::new(),
            "test-holder",
        )
        .await
        .unwrap();

        let mut payload = Payload::new();
        payload.insert("brightness".into(), serde_json::json!(70));
        engine
            .enqueue("op-1", OpType::Update, "device", Some("d1".into()), payload, EnqueueOptions::default())
            .await
            .unwrap();

        let mut status = engine.on_status_change();
        engine.start().await;

        let mut saw_succeeded = false;
        for _ in 0..10 {
            match tokio::time::timeout(StdDuration::from_secs(1), status.recv()).await {
                Ok(Ok(StatusEvent::Succeeded { id })) if id == "op-1" => {
                    saw_succeeded = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_succeeded, "expected op-1 to succeed after the merge-base GET");
        engine.stop().await;
    }
}
