//! Persisted FIFO of actions waiting for delivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{ActionSender, RetryPolicy, SendOutcome};
use crate::config::OfflineConfig;
use crate::domain::{
    ActionId, DropReason, ErrorKind, PendingAction, SyncError, WriteAck,
};
use crate::ports::clock::{add_std, until};
use crate::ports::{Clock, LocalStorage};

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub delivered: Vec<(ActionId, WriteAck)>,
    pub dropped: Vec<(PendingAction, DropReason)>,

    /// Set when the pass stopped early: the head is backing off or the
    /// sender deferred it. Another pass is worth trying after this long.
    pub retry_after: Option<Duration>,

    /// Entries left in the queue.
    pub remaining: usize,
}

impl DrainReport {
    pub fn is_settled(&self) -> bool {
        self.remaining == 0
    }
}

/// Offline action queue.
///
/// Entries are delivered strictly in FIFO order; a failing head blocks the
/// entries behind it until it is delivered or dropped. Every mutation is
/// written through to `LocalStorage` as one JSON array.
pub struct OfflineActionQueue {
    storage: Arc<dyn LocalStorage>,
    clock: Arc<dyn Clock>,
    config: OfflineConfig,
    retry: RetryPolicy,
    entries: VecDeque<PendingAction>,
}

impl OfflineActionQueue {
    /// Open the queue, restoring whatever was persisted under
    /// `config.storage_key`.
    pub async fn open(
        storage: Arc<dyn LocalStorage>,
        config: OfflineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        let entries: VecDeque<PendingAction> = match storage.get(&config.storage_key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => VecDeque::new(),
        };
        if !entries.is_empty() {
            info!(
                restored = entries.len(),
                key = %config.storage_key,
                "restored offline queue"
            );
        }
        if entries.len() > config.max_queue_size {
            warn!(
                restored = entries.len(),
                max_queue_size = config.max_queue_size,
                "restored queue exceeds max size; new actions are refused until it drains"
            );
        }

        Ok(Self {
            storage,
            clock,
            retry: RetryPolicy::from_config(&config),
            config,
            entries,
        })
    }

    /// Append `action` and persist. Returns the new depth.
    pub async fn enqueue(&mut self, action: PendingAction) -> Result<usize, SyncError> {
        if self.contains(action.id) {
            return Err(SyncError::Duplicate(action.id));
        }
        if self.entries.len() >= self.config.max_queue_size {
            return Err(SyncError::Overflow {
                capacity: self.config.max_queue_size,
            });
        }

        let id = action.id;
        self.entries.push_back(action);
        if let Err(e) = self.persist().await {
            // keep memory and storage in agreement
            self.entries.pop_back();
            return Err(e);
        }
        debug!(action_id = %id, depth = self.entries.len(), "action queued");
        Ok(self.entries.len())
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.entries.iter().any(|a| a.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<PendingAction> {
        self.entries.iter().cloned().collect()
    }

    /// Time until the head may be attempted again, if it is backing off.
    pub fn head_wait(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .front()
            .and_then(|head| head.next_attempt_at)
            .map(|at| until(now, at))
            .filter(|wait| !wait.is_zero())
    }

    /// Remove every entry and the persisted copy. Returns what was removed.
    pub async fn clear(&mut self) -> Result<Vec<PendingAction>, SyncError> {
        self.storage.remove(&self.config.storage_key).await?;
        let cleared: Vec<PendingAction> = self.entries.drain(..).collect();
        info!(cleared = cleared.len(), "offline queue cleared");
        Ok(cleared)
    }

    /// Attempt delivery of queued entries in order, awaiting each attempt.
    ///
    /// Transient failures put the head into backoff and end the pass;
    /// permanent failures and exhausted retries drop the head and continue.
    /// Storage failures while draining are logged, not returned: the
    /// in-memory queue stays authoritative and the next mutation rewrites
    /// the persisted copy.
    pub async fn drain(&mut self, sender: &dyn ActionSender) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.entries.is_empty() {
            debug!(depth = self.entries.len(), "drain started");
        }

        loop {
            let now = self.clock.now();
            let Some(head) = self.entries.front() else {
                break;
            };
            if head.is_waiting(now)
                && let Some(at) = head.next_attempt_at
            {
                report.retry_after = Some(until(now, at));
                break;
            }

            let outcome = sender.send(head).await;
            match outcome {
                SendOutcome::Delivered(ack) => {
                    if let Some(action) = self.entries.pop_front() {
                        info!(
                            action_id = %action.id,
                            category = %action.category,
                            retry_count = action.retry_count,
                            server_timestamp = ack.server_timestamp,
                            "queued action delivered"
                        );
                        report.delivered.push((action.id, ack));
                    }
                    self.persist_logged().await;
                }
                SendOutcome::Deferred(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "drain deferred by sender");
                    report.retry_after = Some(wait);
                    break;
                }
                SendOutcome::Failed(error) if error.kind() == ErrorKind::Transient => {
                    let Some(head) = self.entries.front_mut() else {
                        break;
                    };
                    let attempts = head.record_failure(error.message());
                    if attempts >= self.config.max_retries {
                        if let Some(action) = self.entries.pop_front() {
                            warn!(
                                action_id = %action.id,
                                attempts,
                                error = %error,
                                "dropping action after max retries"
                            );
                            report
                                .dropped
                                .push((action, DropReason::MaxRetriesExceeded));
                        }
                        self.persist_logged().await;
                        continue;
                    }

                    let delay = self.retry.next_delay(attempts);
                    head.schedule_retry(add_std(now, delay));
                    info!(
                        action_id = %head.id,
                        retry_count = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "delivery failed, backing off"
                    );
                    self.persist_logged().await;
                    report.retry_after = Some(delay);
                    break;
                }
                SendOutcome::Failed(error) => {
                    if let Some(action) = self.entries.pop_front() {
                        warn!(
                            action_id = %action.id,
                            error = %error,
                            "action rejected by backend, dropping"
                        );
                        report
                            .dropped
                            .push((action, DropReason::Rejected(error.message().to_string())));
                    }
                    self.persist_logged().await;
                }
            }
        }

        report.remaining = self.entries.len();
        if !report.delivered.is_empty() || !report.dropped.is_empty() {
            info!(
                delivered = report.delivered.len(),
                dropped = report.dropped.len(),
                remaining = report.remaining,
                "drain finished"
            );
        }
        report
    }

    async fn persist(&self) -> Result<(), SyncError> {
        let bytes = serde_json::to_vec(&self.entries)?;
        self.storage.set(&self.config.storage_key, bytes).await?;
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, key = %self.config.storage_key, "failed to persist offline queue");
        }
    }
}

impl std::fmt::Debug for OfflineActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineActionQueue")
            .field("storage_key", &self.config.storage_key)
            .field("depth", &self.entries.len())
            .finish()
    }
}
