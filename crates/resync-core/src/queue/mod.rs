//! Queue module: offline action queue and retry policy.

mod offline;
mod retry;

pub use offline::{DrainReport, OfflineActionQueue};
pub use retry::RetryPolicy;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{DeliveryError, PendingAction, WriteAck};

/// What happened to one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(WriteAck),

    /// Counted as an attempt; retried or dropped by error kind.
    Failed(DeliveryError),

    /// Held back before reaching the backend (e.g. rate limited).
    /// Not counted as an attempt.
    Deferred(Duration),
}

/// Delivery seam used by `OfflineActionQueue::drain`.
///
/// Design intent:
/// - The queue owns ordering, retry counting and persistence.
/// - The sender owns admission (rate limit, dedup) and the actual write.
#[async_trait]
pub trait ActionSender: Send + Sync {
    async fn send(&self, action: &PendingAction) -> SendOutcome;
}
