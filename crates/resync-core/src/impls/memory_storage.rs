//! InMemoryStorage - テスト用の LocalStorage

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::StorageError;
use crate::ports::LocalStorage;

/// Map-backed storage. Clones share the same map, which lets a test "restart"
/// a coordinator over the same persisted state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    /// Raw stored value, for inspection.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }

    fn check(&self) -> Result<(), StorageError> {
        if *self.unavailable.lock() {
            return Err(StorageError::Unavailable("storage switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStorage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.check()?;
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.values.lock().remove(key);
        Ok(())
    }
}
