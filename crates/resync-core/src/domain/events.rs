//! Events - backend change events と呼び出し側への通知

use serde::{Deserialize, Serialize};
use std::fmt;

use super::action::WriteAck;
use super::category::{Category, TaskKey};
use super::ids::{ActionId, EventId};
use super::state::ConnectionState;

/// A change event emitted by the document store for a subscribed path.
///
/// `action_id` is set when the change originated from a client write; it is
/// how a client recognises the echo of its own optimistic write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEvent {
    pub event_id: EventId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,

    pub path: String,
    pub category: Category,
    pub payload: serde_json::Value,
    pub server_timestamp: u64,
}

/// Why an action left the pipeline without being delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum DropReason {
    /// Transient failures exhausted `max_retries`.
    MaxRetriesExceeded,

    /// The backend rejected the write.
    Rejected(String),

    /// Removed by `clear()`.
    Cleared,
}

impl DropReason {
    /// Stable reason code reported through `on_dropped`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MaxRetriesExceeded => "max-retries-exceeded",
            DropReason::Rejected(_) => "rejected",
            DropReason::Cleared => "cleared",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Rejected(detail) => write!(f, "rejected: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Terminal and intermediate outcomes, broadcast to observers.
///
/// Every terminal outcome of a submitted action (delivered, dropped) shows up
/// here; nothing is discarded silently.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Held in the offline queue.
    Queued { action_id: ActionId, depth: usize },

    /// Written to the backend.
    Delivered { action_id: ActionId, ack: WriteAck },

    /// Left the pipeline undelivered.
    Dropped { action_id: ActionId, reason: DropReason },

    /// A remote change was applied to local state.
    Applied(BackendEvent),

    /// The backend echoed one of our own writes.
    Confirmed {
        action_id: ActionId,
        server_timestamp: u64,
    },

    /// The UI completion task for an applied change resolved.
    Settled { key: TaskKey, timed_out: bool },

    /// A completion task could not be scheduled or its effect failed.
    TaskFailed { key: TaskKey, error: String },

    ConnectionChanged(ConnectionState),
}
