//! Timeline - 楽観的更新を含むローカル状態
//!
//! `Timeline::apply` は純粋関数です（current_state + change → next_state）。
//! 描画層には依存しないので、UI なしでテストできます。

use serde::{Deserialize, Serialize};

use super::action::PendingAction;
use super::category::Category;
use super::events::{BackendEvent, DropReason};
use super::ids::{ActionId, EventId};

/// Delivery state of a visible entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    /// Optimistically shown, not yet echoed by the backend.
    Pending,
    Confirmed { server_timestamp: u64 },
    /// Dropped; kept visible so the UI can offer a retry.
    Failed { reason: DropReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub action_id: Option<ActionId>,
    pub event_id: Option<EventId>,
    pub category: Category,
    pub payload: serde_json::Value,
    pub status: EntryStatus,
}

impl TimelineEntry {
    fn server_timestamp(&self) -> Option<u64> {
        match self.status {
            EntryStatus::Confirmed { server_timestamp } => Some(server_timestamp),
            _ => None,
        }
    }
}

/// A state transition input.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineChange {
    Optimistic(PendingAction),
    Confirmed {
        action_id: ActionId,
        server_timestamp: u64,
    },
    Remote(BackendEvent),
    Dropped {
        action_id: ActionId,
        reason: DropReason,
    },
    /// The submission was refused before it entered the pipeline.
    Retracted { action_id: ActionId },
    /// The viewed resource changed.
    Reset,
}

/// Ordered local view of one resource.
///
/// Invariant: confirmed entries come first, ordered by server timestamp;
/// pending and failed optimistic entries follow in submission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .count()
    }

    pub fn find(&self, action_id: ActionId) -> Option<&TimelineEntry> {
        self.entries
            .iter()
            .find(|e| e.action_id == Some(action_id))
    }

    /// Apply one change and return the next state.
    ///
    /// Takes `self` by value; callers that keep the previous state clone it.
    pub fn apply(self, change: TimelineChange) -> Timeline {
        let mut next = self;
        match change {
            TimelineChange::Optimistic(action) => {
                if next.find(action.id).is_none() {
                    next.entries.push(TimelineEntry {
                        action_id: Some(action.id),
                        event_id: None,
                        category: action.category,
                        payload: action.payload,
                        status: EntryStatus::Pending,
                    });
                }
            }
            TimelineChange::Confirmed {
                action_id,
                server_timestamp,
            } => {
                if let Some(pos) = next.position(action_id) {
                    let mut entry = next.entries.remove(pos);
                    entry.status = EntryStatus::Confirmed { server_timestamp };
                    next.insert_confirmed(entry);
                }
            }
            TimelineChange::Remote(event) => {
                let known = next
                    .entries
                    .iter()
                    .any(|e| e.event_id == Some(event.event_id));
                if !known {
                    // a remote event for one of our own actions replaces the optimistic entry
                    if let Some(pos) = event.action_id.and_then(|id| next.position(id)) {
                        next.entries.remove(pos);
                    }
                    next.insert_confirmed(TimelineEntry {
                        action_id: event.action_id,
                        event_id: Some(event.event_id),
                        category: event.category,
                        payload: event.payload,
                        status: EntryStatus::Confirmed {
                            server_timestamp: event.server_timestamp,
                        },
                    });
                }
            }
            TimelineChange::Dropped { action_id, reason } => {
                if let Some(pos) = next.position(action_id)
                    && next.entries[pos].status == EntryStatus::Pending
                {
                    next.entries[pos].status = EntryStatus::Failed { reason };
                }
            }
            TimelineChange::Retracted { action_id } => {
                next.entries
                    .retain(|e| !(e.action_id == Some(action_id) && e.status == EntryStatus::Pending));
            }
            TimelineChange::Reset => next.entries.clear(),
        }
        next
    }

    fn position(&self, action_id: ActionId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.action_id == Some(action_id))
    }

    fn insert_confirmed(&mut self, entry: TimelineEntry) {
        let ts = entry.server_timestamp();
        // first slot that is unconfirmed or newer than `entry`
        let pos = self
            .entries
            .iter()
            .position(|e| match (e.server_timestamp(), ts) {
                (Some(existing), Some(ts)) => existing > ts,
                (None, _) => true,
                (Some(_), None) => false,
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }
}
