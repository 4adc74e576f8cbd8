use serde::{Deserialize, Serialize};

use crate::domain::ConnectionState;

/// Point-in-time snapshot of a coordinator, for logs and debug screens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub connection: ConnectionState,
    pub queue_depth: usize,

    /// Set while the queue head is backing off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_in_ms: Option<u64>,

    /// Path of the open view, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
    pub generation: u64,

    pub sent_window: usize,
    pub received_window: usize,
    pub tasks_in_flight: usize,
    pub timeline_entries: usize,
    pub timeline_pending: usize,
}

impl SyncStatus {
    /// Nothing left to deliver and nothing awaiting an echo.
    pub fn is_idle(&self) -> bool {
        self.queue_depth == 0 && self.timeline_pending == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_without_empty_optionals() {
        let status = SyncStatus {
            queue_depth: 2,
            ..SyncStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["connection"], "offline");
        assert_eq!(json["queue_depth"], 2);
        assert!(json.get("next_retry_in_ms").is_none());
        assert!(!status.is_idle());
    }
}
