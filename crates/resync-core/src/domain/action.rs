//! Outbound action records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::category::Category;
use super::errors::ValidationError;
use super::ids::ActionId;

/// An outbound action waiting in the offline queue.
///
/// This is exactly what gets persisted: the storage record is a JSON array
/// of these, one key per logical queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: ActionId,
    pub category: Category,

    /// Document-store path the action is written to.
    pub path: String,

    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,

    /// Per-actor rate-limit key, kept so the drain charges the same window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,

    /// Failed delivery attempts so far.
    #[serde(default)]
    pub retry_count: u32,

    /// Earliest time of the next attempt (set while backing off).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingAction {
    pub fn new(
        id: ActionId,
        category: Category,
        path: impl Into<String>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            category,
            path: path.into(),
            payload,
            created_at,
            actor: None,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    /// Is the entry still backing off at `now`?
    pub fn is_waiting(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }

    /// Record a failed attempt and return the new retry count.
    pub fn record_failure(&mut self, error: impl Into<String>) -> u32 {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.retry_count
    }

    pub fn schedule_retry(&mut self, at: DateTime<Utc>) {
        self.next_attempt_at = Some(at);
    }

    pub fn to_write_request(&self) -> WriteRequest {
        WriteRequest {
            action_id: self.id,
            category: self.category.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// What the caller hands to `SyncCoordinator::submit_action`.
///
/// `id` lets the caller pin an id up front so a UI double-fire of the same
/// logical action is recognised as a duplicate.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: Option<ActionId>,
    pub category: Category,
    pub path: Option<String>,
    pub payload: serde_json::Value,
    pub actor: Option<String>,
}

impl Submission {
    pub fn new(category: impl Into<Category>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            category: category.into(),
            path: None,
            payload,
            actor: None,
        }
    }

    pub fn with_id(mut self, id: ActionId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Rate-limit this submission under a per-actor key.
    pub fn by_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Reject malformed actions before they reach the limiter or the queue.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<(), ValidationError> {
        if self.category.is_blank() {
            return Err(ValidationError::EmptyCategory);
        }
        if self.path.as_deref().is_some_and(|p| p.trim().is_empty()) {
            return Err(ValidationError::EmptyPath);
        }
        // serde_json::Value always serializes
        let size = serde_json::to_vec(&self.payload).map_or(0, |b| b.len());
        if size > max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size,
                limit: max_payload_bytes,
            });
        }
        Ok(())
    }
}

/// Body written to the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub action_id: ActionId,
    pub category: Category,
    pub payload: serde_json::Value,
}

/// Acknowledgement of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Server-assigned, monotonic per store.
    pub server_timestamp: u64,
}
