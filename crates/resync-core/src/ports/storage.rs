//! LocalStorage port - 永続ローカルストレージ
//!
//! offline queue はこの port 経由で JSON 配列を保存し、プロセス再起動を跨いで
//! 復元します。書き込みは single-writer を前提とします。

use async_trait::async_trait;

use crate::domain::StorageError;

/// Key/value byte storage that survives restarts.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}
