//! SyncCoordinator - outbound / inbound パイプラインの統合
//!
//! # Outbound
//! validate → dedup 確認 → rate limit → mark sent → 楽観的 timeline 反映 →
//! （online かつ queue が空なら）直接 write ／（それ以外）offline queue へ
//!
//! # Inbound
//! backend event → dedup filter → 世代チェック → timeline へ適用 →
//! （設定があれば）settle task を BoundedTaskQueue に積む
//!
//! # ロック
//! - `view` → `gate` の順でしか入れ子にしない
//! - どちらも parking_lot の同期ロックで、await を跨いで持たない
//! - offline queue だけは drain 中に await するので tokio の Mutex

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::listeners::{ListenerHandle, Listeners};
use crate::config::SyncConfig;
use crate::dedup::{DedupWindows, Inbound};
use crate::domain::{
    ActionId, BackendEvent, Category, ConnectionState, DropReason, ErrorKind, PendingAction,
    Submission, SyncError, SyncEvent, TaskKey, Timeline, TimelineChange, ValidationError,
    WriteAck,
};
use crate::observability::SyncStatus;
use crate::ports::{
    Clock, ConnectivitySignal, Disposer, DocumentStore, IdGenerator, LocalStorage, Subscription,
};
use crate::ports::clock::add_std;
use crate::queue::{ActionSender, DrainReport, OfflineActionQueue, RetryPolicy, SendOutcome};
use crate::rate_limit::{RateLimitStatus, RateLimiter};
use crate::stale::{Epoch, Generation, StaleRequestGuard};
use crate::tasks::{BoundedTaskQueue, ScheduledTask};

const EVENT_BUFFER: usize = 256;

/// What `apply_inbound` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// A remote change, applied to the timeline.
    Applied,
    /// The echo of one of our own writes; the entry is now confirmed.
    Confirmed(ActionId),
    /// Already applied once.
    Duplicate,
    /// Belongs to a view that is no longer current.
    Stale,
}

/// Admission state shared by both pipelines.
struct Gate {
    limiter: RateLimiter<Arc<dyn Clock>>,
    dedup: DedupWindows,
    timeline: Timeline,
}

impl Gate {
    fn reduce(&mut self, change: TimelineChange) {
        let current = std::mem::take(&mut self.timeline);
        self.timeline = current.apply(change);
    }
}

#[derive(Default)]
struct View {
    guard: StaleRequestGuard,
    path: Option<String>,
    subscription: Option<Disposer>,
}

pub(crate) struct Parts {
    pub(crate) config: SyncConfig,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) storage: Arc<dyn LocalStorage>,
    pub(crate) connectivity: ConnectivitySignal,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
}

struct Inner {
    config: SyncConfig,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    connectivity: ConnectivitySignal,
    gate: Mutex<Gate>,
    view: Mutex<View>,
    queue: AsyncMutex<OfflineActionQueue>,
    queue_depth: AtomicUsize,
    kick: Notify,
    tasks: BoundedTaskQueue,
    listeners: Listeners,
    events: broadcast::Sender<SyncEvent>,
    shutdown: watch::Sender<bool>,
}

/// Client-side sync layer over one document store.
///
/// Build it with [`CoordinatorBuilder`](super::CoordinatorBuilder). One
/// coordinator per logical session: the persisted queue assumes a single
/// writer.
pub struct SyncCoordinator {
    inner: Arc<Inner>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub(crate) async fn start(parts: Parts) -> Result<Self, SyncError> {
        let Parts {
            config,
            store,
            storage,
            connectivity,
            clock,
            ids,
        } = parts;

        let queue =
            OfflineActionQueue::open(storage, config.offline.clone(), Arc::clone(&clock)).await?;

        let mut gate = Gate {
            limiter: RateLimiter::from_config(&config, Arc::clone(&clock)),
            dedup: DedupWindows::new(config.dedup_capacity),
            timeline: Timeline::new(),
        };
        // restored actions were submitted before the restart
        for action in queue.iter() {
            gate.dedup.mark_sent(action.id);
            gate.reduce(TimelineChange::Optimistic(action.clone()));
        }
        let restored = queue.size();

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            tasks: BoundedTaskQueue::new(config.tasks),
            config,
            store,
            clock,
            ids,
            connectivity,
            gate: Mutex::new(gate),
            view: Mutex::new(View::default()),
            queue: AsyncMutex::new(queue),
            queue_depth: AtomicUsize::new(restored),
            kick: Notify::new(),
            listeners: Listeners::default(),
            events,
            shutdown,
        });

        let watcher = tokio::spawn(watch_connectivity(
            Arc::clone(&inner),
            inner.shutdown.subscribe(),
        ));
        info!(
            restored,
            connection = ?inner.connectivity.state(),
            "sync coordinator started"
        );

        Ok(Self {
            inner,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    // ========================================
    // Outbound
    // ========================================

    /// Submit `payload` under `category`, written to the path named after
    /// the category.
    pub async fn submit(
        &self,
        category: impl Into<Category>,
        payload: serde_json::Value,
    ) -> Result<ActionId, SyncError> {
        self.submit_action(Submission::new(category, payload)).await
    }

    /// Submit an action.
    ///
    /// Returns once the action is delivered, queued or dropped. Drops are
    /// reported through `on_dropped`; validation, rate limiting, duplicates
    /// and queue overflow are returned as errors and leave nothing behind.
    pub async fn submit_action(&self, submission: Submission) -> Result<ActionId, SyncError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        submission.validate(inner.config.max_payload_bytes)?;

        let Submission {
            id,
            category,
            path,
            payload,
            actor,
        } = submission;
        let id = id.unwrap_or_else(|| inner.ids.generate_action_id());
        let path = path.unwrap_or_else(|| category.to_string());
        let mut action =
            PendingAction::new(id, category, path, payload, inner.clock.now()).with_actor(actor);

        // queued entries go first so per-category order holds
        let direct = inner.connectivity.state().is_online() && inner.depth() == 0;
        let capacity = inner.config.offline.max_queue_size;
        if !direct && inner.depth() >= capacity {
            return Err(SyncError::Overflow { capacity });
        }

        inner.admit(&action)?;

        if direct {
            let written = inner
                .store
                .write(&action.path, &action.to_write_request())
                .await;
            match written {
                Ok(ack) => {
                    info!(
                        action_id = %id,
                        category = %action.category,
                        server_timestamp = ack.server_timestamp,
                        "action delivered"
                    );
                    inner.report_delivered(id, ack);
                    return Ok(id);
                }
                Err(e) if e.kind() == ErrorKind::Transient => {
                    // the direct attempt counts against the retry budget
                    let offline = &inner.config.offline;
                    let attempts = action.record_failure(e.message());
                    if attempts >= offline.max_retries {
                        warn!(
                            action_id = %id,
                            attempts,
                            error = %e,
                            "action dropped after max retries"
                        );
                        inner.report_dropped(id, DropReason::MaxRetriesExceeded);
                        return Ok(id);
                    }
                    let delay = RetryPolicy::from_config(offline).next_delay(attempts);
                    action.schedule_retry(add_std(inner.clock.now(), delay));
                    warn!(
                        action_id = %id,
                        retry_count = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "direct write failed, queueing"
                    );
                }
                Err(e) => {
                    warn!(action_id = %id, error = %e, "action rejected by backend");
                    inner.report_dropped(id, DropReason::Rejected(e.message().to_string()));
                    return Ok(id);
                }
            }
        }

        inner.enqueue(action).await?;
        Ok(id)
    }

    /// Run one drain pass now. Does nothing while offline.
    pub async fn flush(&self) -> Result<DrainReport, SyncError> {
        self.inner.flush().await
    }

    /// Remove every queued action, reporting each as dropped (`cleared`).
    pub async fn clear_queue(&self) -> Result<Vec<PendingAction>, SyncError> {
        let cleared = {
            let mut queue = self.inner.queue.lock().await;
            let cleared = queue.clear().await?;
            self.inner.queue_depth.store(queue.size(), Ordering::SeqCst);
            cleared
        };
        for action in &cleared {
            self.inner.report_dropped(action.id, DropReason::Cleared);
        }
        Ok(cleared)
    }

    /// Actions waiting in the offline queue, oldest first.
    pub async fn queued(&self) -> Vec<PendingAction> {
        self.inner.queue.lock().await.snapshot()
    }

    // ========================================
    // Inbound
    // ========================================

    /// Switch to the resource at `path`.
    ///
    /// Starts a new generation: the previous subscription is disposed and
    /// any of its events still in flight are discarded.
    pub fn open_view(&self, path: impl Into<String>) -> Result<Generation, SyncError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let path = path.into();
        if path.trim().is_empty() {
            return Err(ValidationError::EmptyPath.into());
        }

        let Subscription { events, disposer } = inner.store.subscribe(&path);
        let epoch = {
            let mut view = inner.view.lock();
            let epoch = view.guard.begin();
            if let Some(previous) = view.subscription.replace(disposer) {
                previous.dispose();
            }
            view.path = Some(path.clone());
            let mut gate = inner.gate.lock();
            gate.reduce(TimelineChange::Reset);
            // the new subscription replays from scratch
            gate.dedup.clear_received();
            epoch
        };
        info!(%path, generation = %epoch.generation, "view opened");

        tokio::spawn(pump(
            Arc::clone(inner),
            epoch.clone(),
            events,
            inner.shutdown.subscribe(),
        ));
        Ok(epoch.generation)
    }

    /// Stop following the current view.
    pub fn close_view(&self) {
        let mut view = self.inner.view.lock();
        view.guard.cancel_current();
        if let Some(disposer) = view.subscription.take() {
            disposer.dispose();
        }
        if let Some(path) = view.path.take() {
            info!(%path, "view closed");
        }
    }

    /// Apply one backend event received under `generation`.
    ///
    /// The view's pump calls this for every event; it is public so events
    /// obtained another way go through the same filters.
    pub fn apply_inbound(&self, generation: Generation, event: BackendEvent) -> InboundOutcome {
        self.inner.apply_inbound(generation, event)
    }

    // ========================================
    // Observers
    // ========================================

    pub fn on_applied(
        &self,
        f: impl Fn(&BackendEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.on_applied(f)
    }

    pub fn on_dropped(
        &self,
        f: impl Fn(ActionId, &DropReason) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.on_dropped(f)
    }

    pub fn on_delivered(
        &self,
        f: impl Fn(ActionId, WriteAck) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.on_delivered(f)
    }

    /// Stream of every outcome. Slow receivers may observe `Lagged`.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    // ========================================
    // Queries
    // ========================================

    pub fn queue_depth(&self) -> usize {
        self.inner.depth()
    }

    pub fn rate_limit_status(&self, category: &Category) -> RateLimitStatus {
        self.inner.gate.lock().limiter.status(category)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connectivity.state()
    }

    /// The signal the platform reports connectivity through.
    pub fn connectivity(&self) -> &ConnectivitySignal {
        &self.inner.connectivity
    }

    pub fn timeline(&self) -> Timeline {
        self.inner.gate.lock().timeline.clone()
    }

    pub fn current_generation(&self) -> Generation {
        self.inner.view.lock().guard.current()
    }

    /// Completion effects scheduled for the UI.
    pub fn tasks(&self) -> &BoundedTaskQueue {
        &self.inner.tasks
    }

    /// A fresh id, for callers that pin ids up front (see `Submission::with_id`).
    pub fn next_action_id(&self) -> ActionId {
        self.inner.ids.generate_action_id()
    }

    pub async fn status(&self) -> SyncStatus {
        let (queue_depth, next_retry) = {
            let queue = self.inner.queue.lock().await;
            (queue.size(), queue.head_wait())
        };
        let view = self.inner.view.lock();
        let gate = self.inner.gate.lock();
        SyncStatus {
            connection: self.inner.connectivity.state(),
            queue_depth,
            next_retry_in_ms: next_retry.map(|d| d.as_millis() as u64),
            view: view.path.clone(),
            generation: view.guard.current().get(),
            sent_window: gate.dedup.sent_len(),
            received_window: gate.dedup.received_len(),
            tasks_in_flight: self.inner.tasks.len(),
            timeline_entries: gate.timeline.len(),
            timeline_pending: gate.timeline.pending_count(),
        }
    }

    /// Stop background work. Further submissions fail with
    /// `SyncError::Shutdown`; queued actions stay persisted.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.close_view();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
        self.inner.tasks.clear();
        info!("sync coordinator stopped");
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
        self.inner.view.lock().guard.cancel_current();
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("connection", &self.inner.connectivity.state())
            .field("queue_depth", &self.inner.depth())
            .finish()
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<(), SyncError> {
        if *self.shutdown.borrow() {
            return Err(SyncError::Shutdown);
        }
        Ok(())
    }

    fn depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    fn publish(&self, event: SyncEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Dedup check, rate limit, mark sent and optimistic insert, as one step.
    fn admit(&self, action: &PendingAction) -> Result<(), SyncError> {
        let actor = action.actor.as_deref();
        let view = self.view.lock();
        let mut gate = self.gate.lock();

        if gate.dedup.has_sent(action.id) {
            debug!(action_id = %action.id, "duplicate submission");
            return Err(SyncError::Duplicate(action.id));
        }
        if !gate.limiter.try_admit_for(&action.category, actor) {
            let retry_after_ms = gate.limiter.blocked_for_ms_for(&action.category, actor);
            debug!(
                action_id = %action.id,
                category = %action.category,
                retry_after_ms,
                "submission rate limited"
            );
            return Err(SyncError::RateLimited {
                category: action.category.clone(),
                retry_after_ms,
            });
        }

        gate.dedup.mark_sent(action.id);
        if view.path.as_deref().is_none_or(|p| p == action.path) {
            gate.reduce(TimelineChange::Optimistic(action.clone()));
        }
        Ok(())
    }

    async fn enqueue(&self, action: PendingAction) -> Result<(), SyncError> {
        let action_id = action.id;
        let result = {
            let mut queue = self.queue.lock().await;
            let result = queue.enqueue(action).await;
            self.queue_depth.store(queue.size(), Ordering::SeqCst);
            result
        };

        match result {
            Ok(depth) => {
                info!(%action_id, depth, "action queued");
                self.publish(SyncEvent::Queued { action_id, depth });
                self.kick.notify_one();
                Ok(())
            }
            Err(e) => {
                warn!(%action_id, error = %e, "could not queue action");
                let mut gate = self.gate.lock();
                gate.reduce(TimelineChange::Retracted { action_id });
                Err(e)
            }
        }
    }

    async fn flush(&self) -> Result<DrainReport, SyncError> {
        self.ensure_running()?;
        if !self.connectivity.state().is_online() {
            return Ok(DrainReport {
                remaining: self.depth(),
                ..DrainReport::default()
            });
        }

        let report = {
            let mut queue = self.queue.lock().await;
            let report = queue.drain(&Outbound { inner: self }).await;
            self.queue_depth.store(queue.size(), Ordering::SeqCst);
            report
        };

        for (action_id, ack) in &report.delivered {
            self.report_delivered(*action_id, *ack);
        }
        for (action, reason) in &report.dropped {
            self.report_dropped(action.id, reason.clone());
        }
        Ok(report)
    }

    fn report_delivered(&self, action_id: ActionId, ack: WriteAck) {
        {
            let mut gate = self.gate.lock();
            gate.reduce(TimelineChange::Confirmed {
                action_id,
                server_timestamp: ack.server_timestamp,
            });
        }
        self.publish(SyncEvent::Delivered { action_id, ack });
        self.listeners.delivered(action_id, ack);
    }

    fn report_dropped(&self, action_id: ActionId, reason: DropReason) {
        {
            let mut gate = self.gate.lock();
            gate.reduce(TimelineChange::Dropped {
                action_id,
                reason: reason.clone(),
            });
        }
        self.listeners.dropped(action_id, &reason);
        self.publish(SyncEvent::Dropped { action_id, reason });
    }

    fn apply_inbound(&self, generation: Generation, event: BackendEvent) -> InboundOutcome {
        let outcome = {
            let view = self.view.lock();
            let mut gate = self.gate.lock();
            match gate.dedup.filter_received(&event) {
                Inbound::Duplicate => InboundOutcome::Duplicate,
                _ if !view.guard.is_current(generation) => InboundOutcome::Stale,
                inbound => {
                    gate.dedup.mark_received(event.event_id);
                    gate.reduce(TimelineChange::Remote(event.clone()));
                    match inbound {
                        Inbound::Echo(action_id) => InboundOutcome::Confirmed(action_id),
                        _ => InboundOutcome::Applied,
                    }
                }
            }
        };

        match outcome {
            InboundOutcome::Duplicate => {
                debug!(event_id = %event.event_id, "duplicate event ignored");
            }
            InboundOutcome::Stale => {
                debug!(event_id = %event.event_id, %generation, "stale event discarded");
            }
            InboundOutcome::Confirmed(action_id) => {
                debug!(%action_id, server_timestamp = event.server_timestamp, "echo confirmed");
                self.publish(SyncEvent::Confirmed {
                    action_id,
                    server_timestamp: event.server_timestamp,
                });
            }
            InboundOutcome::Applied => {
                self.listeners.applied(&event);
                self.schedule_settle(&event);
                self.publish(SyncEvent::Applied(event));
            }
        }
        outcome
    }

    fn schedule_settle(&self, event: &BackendEvent) {
        let Some(settle_ms) = self.config.settle_ms else {
            return;
        };
        let key = TaskKey::new(format!("settle:{}", event.event_id));
        let settled = self.events.clone();
        let failed = self.events.clone();
        let failed_key = key.clone();
        let task = ScheduledTask::new(key, Duration::from_millis(settle_ms))
            .on_complete(move |done| {
                let _ = settled.send(SyncEvent::Settled {
                    key: done.key,
                    timed_out: done.timed_out,
                });
            })
            .on_error(move |e| {
                warn!(key = %failed_key, error = %e, "settle task failed");
                let _ = failed.send(SyncEvent::TaskFailed {
                    key: failed_key,
                    error: e.to_string(),
                });
            });
        self.tasks.schedule(task);
    }
}

/// Sends queued actions through the same admission path as fresh ones.
struct Outbound<'a> {
    inner: &'a Inner,
}

#[async_trait]
impl ActionSender for Outbound<'_> {
    async fn send(&self, action: &PendingAction) -> SendOutcome {
        if !self.inner.connectivity.state().is_online() {
            return SendOutcome::Deferred(Duration::ZERO);
        }
        {
            let actor = action.actor.as_deref();
            let mut gate = self.inner.gate.lock();
            // a full window defers without starting a block
            if !gate.limiter.can_admit_for(&action.category, actor) {
                let wait_ms = gate.limiter.blocked_for_ms_for(&action.category, actor).max(1);
                debug!(action_id = %action.id, wait_ms, "queued action rate limited");
                return SendOutcome::Deferred(Duration::from_millis(wait_ms));
            }
            gate.limiter.try_admit_for(&action.category, actor);
            gate.dedup.mark_sent(action.id);
        }

        match self
            .inner
            .store
            .write(&action.path, &action.to_write_request())
            .await
        {
            Ok(ack) => SendOutcome::Delivered(ack),
            Err(e) => SendOutcome::Failed(e),
        }
    }
}

/// Drains the queue while online: on reconnect, after each enqueue, and
/// again when the head's backoff expires.
async fn watch_connectivity(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut connectivity = inner.connectivity.subscribe();
    let mut last = *connectivity.borrow_and_update();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut retry_after = None;
        if last.is_online() && inner.depth() > 0 {
            match inner.flush().await {
                Ok(report) if !report.is_settled() => retry_after = report.retry_after,
                Ok(_) => {}
                Err(SyncError::Shutdown) => break,
                Err(e) => warn!(error = %e, "flush failed"),
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => continue,
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connectivity.borrow_and_update();
                if state != last {
                    info!(?state, "connectivity changed");
                    inner.publish(SyncEvent::ConnectionChanged(state));
                    last = state;
                }
            }
            _ = inner.kick.notified() => {}
            _ = sleep_opt(retry_after) => {}
        }
    }
    debug!("connectivity watcher stopped");
}

/// Feeds one view's subscription into `apply_inbound` until superseded.
async fn pump(
    inner: Arc<Inner>,
    epoch: Epoch,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = epoch.run(events.recv()) => next,
        };
        match next {
            Some(Some(event)) => {
                inner.apply_inbound(epoch.generation, event);
            }
            Some(None) => {
                debug!(generation = %epoch.generation, "subscription closed");
                break;
            }
            None => break,
        }
    }
}

async fn sleep_opt(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}
