//! BoundedTaskQueue - 期限保証つき single-flight 実行
//!
//! # 保証
//! - 同時に running になる task は高々 1 つ
//! - 期限は schedule 時点から `min(duration, max_timeout)`
//! - キャンセルされない task は、期限までに `on_complete` / `on_error` の
//!   どちらか一方が必ず 1 回だけ呼ばれる
//! - 期限切れは失敗ではない（`Completion::timed_out` が立つだけ）
//!
//! # 実装詳細
//! - 状態は `parking_lot::Mutex` で守り、callback はロックの外で呼ぶ
//! - driver task が 1 つ spawn され、effect の完了・期限・pending の期限・
//!   schedule/cancel の通知を `select!` で待つ
//! - effect は `tokio::spawn` で起動し JoinHandle を待つので、キャンセルや
//!   期限切れで effect 自体が中断されることはない（callback が抑止されるだけ）
//! - 終了した entry は `status()` 用に残し、容量が足りないときに捨てる

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TaskQueueConfig;
use crate::domain::{TaskError, TaskKey, TaskState};

/// Passed to `on_complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub key: TaskKey,
    /// The deadline was reached before the work finished.
    pub timed_out: bool,
    /// Time from scheduling to resolution.
    pub elapsed: Duration,
}

type CompleteFn = Box<dyn FnOnce(Completion) + Send>;
type ErrorFn = Box<dyn FnOnce(TaskError) + Send>;
type Effect = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

struct Callbacks {
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
}

impl Callbacks {
    fn complete(self, completion: Completion) {
        if let Some(f) = self.on_complete {
            f(completion);
        }
    }

    fn fail(self, error: TaskError) {
        if let Some(f) = self.on_error {
            f(error);
        }
    }
}

/// A unit of deferred work.
///
/// Without an effect the task is a pure timer: it completes when its
/// (clamped) duration has elapsed.
pub struct ScheduledTask {
    key: TaskKey,
    duration: Duration,
    callbacks: Callbacks,
    effect: Option<Effect>,
}

impl ScheduledTask {
    pub fn new(key: impl Into<TaskKey>, duration: Duration) -> Self {
        Self {
            key: key.into(),
            duration,
            callbacks: Callbacks {
                on_complete: None,
                on_error: None,
            },
            effect: None,
        }
    }

    pub fn on_complete(mut self, f: impl FnOnce(Completion) + Send + 'static) -> Self {
        self.callbacks.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(TaskError) + Send + 'static) -> Self {
        self.callbacks.on_error = Some(Box::new(f));
        self
    }

    /// Work started when the task begins running. Finishing early resolves
    /// the task early; an `Err` resolves it through `on_error`.
    pub fn with_effect<F, E>(mut self, effect: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        self.effect = Some(Box::pin(async move {
            effect.await.map_err(|e| e.to_string())
        }));
        self
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("key", &self.key)
            .field("duration", &self.duration)
            .field("has_effect", &self.effect.is_some())
            .finish()
    }
}

struct Entry {
    seq: u64,
    state: TaskState,
    scheduled_at: Instant,
    deadline: Instant,
    callbacks: Option<Callbacks>,
    effect: Option<Effect>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<TaskKey, Entry>,
    pending: VecDeque<(TaskKey, u64)>,
    next_seq: u64,
}

impl QueueState {
    fn is_live(&self, key: &TaskKey, seq: u64, state: TaskState) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.seq == seq && e.state == state)
    }

    /// Resolve a live entry, handing back its callbacks.
    fn resolve(
        &mut self,
        key: &TaskKey,
        seq: u64,
        from: TaskState,
        to: TaskState,
    ) -> Option<(Callbacks, Instant)> {
        if !self.is_live(key, seq, from) {
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.state = to;
        entry.effect = None;
        Some((entry.callbacks.take()?, entry.scheduled_at))
    }

    fn evict_terminal(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.state.is_terminal());
        before - self.entries.len()
    }
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: CancellationToken,
    max_timeout: Duration,
    max_size: usize,
}

struct Running {
    key: TaskKey,
    seq: u64,
    deadline: Instant,
    cancel: CancellationToken,
}

enum Wake {
    Shutdown,
    RunCancelled,
    EffectDone(Result<(), String>),
    Deadline,
    Tick,
}

/// Callbacks collected under the lock, fired after it is released.
#[derive(Default)]
struct Fired {
    completions: Vec<(Callbacks, Completion)>,
    errors: Vec<(Callbacks, TaskError)>,
}

impl Fired {
    fn fire(self) {
        for (callbacks, completion) in self.completions {
            callbacks.complete(completion);
        }
        for (callbacks, error) in self.errors {
            callbacks.fail(error);
        }
    }
}

/// Single-flight queue of deferred work with a hard per-task deadline.
///
/// Must be created inside a tokio runtime; the driver task stops when the
/// queue is dropped.
pub struct BoundedTaskQueue {
    inner: Arc<Inner>,
}

impl BoundedTaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            max_timeout: config.max_timeout(),
            max_size: config.max_size.max(1),
        });
        tokio::spawn(drive(Arc::clone(&inner)));
        Self { inner }
    }

    /// Queue `task`. Re-using a key cancels the previous task with that key.
    ///
    /// When the queue is full even after evicting finished entries, the
    /// task's `on_error` is called with `TaskError::Overflow` before this
    /// returns `false`.
    pub fn schedule(&self, task: ScheduledTask) -> bool {
        let ScheduledTask {
            key,
            duration,
            callbacks,
            effect,
        } = task;

        let mut state = self.inner.state.lock();
        let grows = !state.entries.contains_key(&key);

        if grows && state.entries.len() >= self.inner.max_size {
            let evicted = state.evict_terminal();
            if state.entries.len() >= self.inner.max_size {
                drop(state);
                warn!(%key, capacity = self.inner.max_size, "task queue full");
                callbacks.fail(TaskError::Overflow {
                    capacity: self.inner.max_size,
                });
                return false;
            }
            debug!(evicted, "evicted finished tasks");
        }

        if let Some(previous) = state.entries.get_mut(&key)
            && !previous.state.is_terminal()
        {
            previous.state = TaskState::Cancelled;
            previous.callbacks = None;
            previous.effect = None;
            previous.cancel.cancel();
            debug!(%key, "task replaced");
        }

        let now = Instant::now();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.insert(
            key.clone(),
            Entry {
                seq,
                state: TaskState::Pending,
                scheduled_at: now,
                deadline: now + duration.min(self.inner.max_timeout),
                callbacks: Some(callbacks),
                effect,
                cancel: self.inner.shutdown.child_token(),
            },
        );
        state.pending.push_back((key, seq));
        drop(state);

        self.inner.notify.notify_one();
        true
    }

    /// Cancel a pending or running task. Its callbacks never fire; an effect
    /// that already started keeps running.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        let cancelled = {
            let mut state = self.inner.state.lock();
            match state.entries.get_mut(key) {
                Some(entry) if !entry.state.is_terminal() => {
                    entry.state = TaskState::Cancelled;
                    entry.callbacks = None;
                    entry.effect = None;
                    entry.cancel.cancel();
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            debug!(%key, "task cancelled");
            self.inner.notify.notify_one();
        }
        cancelled
    }

    /// Cancel everything and forget finished entries.
    pub fn clear(&self) {
        {
            let mut state = self.inner.state.lock();
            for entry in state.entries.values_mut() {
                if !entry.state.is_terminal() {
                    entry.cancel.cancel();
                }
            }
            state.entries.clear();
            state.pending.clear();
        }
        self.inner.notify.notify_one();
    }

    pub fn status(&self, key: &TaskKey) -> Option<TaskState> {
        self.inner.state.lock().entries.get(key).map(|e| e.state)
    }

    /// Tasks not yet resolved (pending or running).
    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|e| !e.state.is_terminal())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_size
    }
}

impl Drop for BoundedTaskQueue {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for BoundedTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTaskQueue")
            .field("max_timeout", &self.inner.max_timeout)
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

impl Inner {
    /// Expire overdue pending tasks and, when idle, start the next one.
    ///
    /// Returns the callbacks to fire, the started effect (if any) and the
    /// earliest deadline among the tasks still pending.
    fn advance(
        &self,
        current: &mut Option<Running>,
    ) -> (Fired, Option<JoinHandle<Result<(), String>>>, Option<Instant>) {
        let now = Instant::now();
        let mut fired = Fired::default();
        let mut started = None;
        let mut state = self.state.lock();

        let pending: Vec<(TaskKey, u64)> = state.pending.drain(..).collect();
        for (key, seq) in pending {
            if !state.is_live(&key, seq, TaskState::Pending) {
                continue;
            }
            let Some(deadline) = state.entries.get(&key).map(|e| e.deadline) else {
                continue;
            };

            if deadline <= now {
                if let Some((callbacks, scheduled_at)) =
                    state.resolve(&key, seq, TaskState::Pending, TaskState::Completed)
                {
                    debug!(%key, "task expired before it could run");
                    fired.completions.push((
                        callbacks,
                        Completion {
                            key,
                            timed_out: true,
                            elapsed: now - scheduled_at,
                        },
                    ));
                }
                continue;
            }

            if current.is_none()
                && let Some(entry) = state.entries.get_mut(&key)
            {
                entry.state = TaskState::Running;
                started = entry.effect.take().map(tokio::spawn);
                *current = Some(Running {
                    key,
                    seq,
                    deadline,
                    cancel: entry.cancel.clone(),
                });
                continue;
            }

            state.pending.push_back((key, seq));
        }

        let next_deadline = state
            .pending
            .iter()
            .filter_map(|(key, _)| state.entries.get(key).map(|e| e.deadline))
            .min();
        (fired, started, next_deadline)
    }

    fn finish(&self, run: Running, outcome: Result<bool, String>) -> Fired {
        let mut fired = Fired::default();
        let to = if outcome.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Errored
        };
        let resolved = self
            .state
            .lock()
            .resolve(&run.key, run.seq, TaskState::Running, to);
        let Some((callbacks, scheduled_at)) = resolved else {
            return fired;
        };

        match outcome {
            Ok(timed_out) => {
                if timed_out {
                    debug!(key = %run.key, "task reached its deadline");
                }
                fired.completions.push((
                    callbacks,
                    Completion {
                        key: run.key,
                        timed_out,
                        elapsed: Instant::now() - scheduled_at,
                    },
                ));
            }
            Err(message) => {
                warn!(key = %run.key, error = %message, "task effect failed");
                fired.errors.push((callbacks, TaskError::Failed(message)));
            }
        }
        fired
    }
}

async fn drive(inner: Arc<Inner>) {
    let mut current: Option<Running> = None;
    let mut effect: Option<JoinHandle<Result<(), String>>> = None;

    loop {
        let (fired, started, next_pending) = inner.advance(&mut current);
        if started.is_some() {
            effect = started;
        }
        fired.fire();

        let run_deadline = current.as_ref().map(|r| r.deadline);
        let run_cancel = current.as_ref().map(|r| r.cancel.clone());

        let wake = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => Wake::Shutdown,
            _ = cancelled(run_cancel.as_ref()) => Wake::RunCancelled,
            result = effect_done(effect.as_mut()) => Wake::EffectDone(result),
            _ = sleep_until_opt(run_deadline) => Wake::Deadline,
            _ = sleep_until_opt(next_pending) => Wake::Tick,
            _ = inner.notify.notified() => Wake::Tick,
        };

        match wake {
            Wake::Shutdown => break,
            Wake::RunCancelled => {
                current = None;
                effect = None;
            }
            Wake::EffectDone(result) => {
                effect = None;
                if let Some(run) = current.take() {
                    inner.finish(run, result.map(|()| false)).fire();
                }
            }
            Wake::Deadline => {
                // timers complete on time; effects still outstanding time out
                let timed_out = effect.take().is_some();
                if let Some(run) = current.take() {
                    inner.finish(run, Ok(timed_out)).fire();
                }
            }
            Wake::Tick => {}
        }
    }
    debug!("task queue driver stopped");
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn effect_done(handle: Option<&mut JoinHandle<Result<(), String>>>) -> Result<(), String> {
    match handle {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(join) => Err(join.to_string()),
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
