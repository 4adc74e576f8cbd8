//! State - 接続状態と task の状態

use serde::{Deserialize, Serialize};

/// Connectivity as reported by the platform signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Online,
    #[default]
    Offline,
}

impl ConnectionState {
    pub fn is_online(self) -> bool {
        matches!(self, ConnectionState::Online)
    }
}

/// State of a task in a `BoundedTaskQueue`.
///
/// 状態遷移:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Errored
/// - Pending | Running -> Cancelled
/// - Pending -> Completed（実行前に期限到達した場合、timed_out として完了）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Errored,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Errored
        )
    }
}
