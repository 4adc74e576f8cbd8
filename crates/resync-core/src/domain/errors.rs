//! Errors - エラー型と分類
//!
//! 呼び出し側に返すエラーは `SyncError` に集約し、`ErrorKind` で運用分類
//! （Validation / Transient / Permanent / Overflow / Timeout）を引けるようにします。

use thiserror::Error;

use super::category::Category;
use super::ids::ActionId;

/// ErrorKind は実行エラーの分類
///
/// - Validation: 不正な action（queue に入れない）
/// - Transient: 一時的なエラー（backoff 付きでリトライ）
/// - Permanent: 恒久的なエラー（即 drop、onDropped で通知）
/// - Overflow: 容量超過（同期的に呼び出し側へ返す）
/// - Timeout: task の期限到達（liveness イベント、失敗扱いしない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Transient,
    Permanent,
    Overflow,
    Timeout,
}

/// A malformed action, rejected before it reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("category must not be empty")]
    EmptyCategory,

    #[error("path must not be empty")]
    EmptyPath,

    #[error("payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Failure reported by a `DocumentStore::write`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network or backend unreachable. Retried with backoff.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Backend rejected the write (authorization, schema, ...). Never retried.
    #[error("write rejected: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Transient(_) => ErrorKind::Transient,
            DeliveryError::Permanent(_) => ErrorKind::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DeliveryError::Transient(m) | DeliveryError::Permanent(m) => m,
        }
    }
}

/// Failure of the persisted local storage port.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Reason handed to a task's `on_error` callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task queue is full (capacity {capacity})")]
    Overflow { capacity: usize },

    #[error("task effect failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Overflow { .. } => ErrorKind::Overflow,
            TaskError::Failed(_) => ErrorKind::Permanent,
        }
    }
}

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Caller-facing error of the sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid action: {0}")]
    Validation(#[from] ValidationError),

    #[error("rate limited on `{category}`, retry in {retry_after_ms}ms")]
    RateLimited {
        category: Category,
        retry_after_ms: u64,
    },

    #[error("action {0} was already submitted")]
    Duplicate(ActionId),

    #[error("queue is full (capacity {capacity})")]
    Overflow { capacity: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sync coordinator has shut down")]
    Shutdown,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) | SyncError::Duplicate(_) | SyncError::Config(_) => {
                ErrorKind::Validation
            }
            SyncError::RateLimited { .. } | SyncError::Overflow { .. } => ErrorKind::Overflow,
            SyncError::Storage(_) => ErrorKind::Transient,
            SyncError::Codec(_) | SyncError::Shutdown => ErrorKind::Permanent,
        }
    }
}
