//! CoordinatorBuilder - SyncCoordinator の構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - document store と local storage は必須。足りなければ build() が失敗
//! - config は build() 時にまとめて検証
//! - 永続化された queue の読み込みも build() で行い、壊れていればここで失敗

use std::sync::Arc;

use super::coordinator::{Parts, SyncCoordinator};
use crate::config::SyncConfig;
use crate::domain::{ConfigError, ConnectionState, SyncError};
use crate::ports::{
    Clock, ConnectivitySignal, DocumentStore, IdGenerator, LocalStorage, SystemClock,
    UlidGenerator,
};

/// Wires a [`SyncCoordinator`] from its collaborators.
///
/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new()
///     .config(SyncConfig::from_path("resync.json")?)
///     .document_store(store)
///     .storage(FileStorage::open("state").await?)
///     .build()
///     .await?;
/// ```
pub struct CoordinatorBuilder {
    config: SyncConfig,
    store: Option<Arc<dyn DocumentStore>>,
    storage: Option<Arc<dyn LocalStorage>>,
    connectivity: Option<ConnectivitySignal>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}. Set it on the builder before build().")]
    MissingComponent(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start coordinator: {0}")]
    Start(#[from] SyncError),
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            store: None,
            storage: None,
            connectivity: None,
            clock: None,
            ids: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// The backend. Required.
    pub fn document_store(mut self, store: impl DocumentStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Where the offline queue persists. Required.
    pub fn storage(mut self, storage: impl LocalStorage + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Defaults to a signal starting `Offline`; the platform flips it.
    pub fn connectivity(mut self, signal: ConnectivitySignal) -> Self {
        self.connectivity = Some(signal);
        self
    }

    /// Defaults to `SystemClock`.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Defaults to ULIDs stamped from the configured clock.
    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    pub async fn build(self) -> Result<SyncCoordinator, BuildError> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or(BuildError::MissingComponent("document_store"))?;
        let storage = self.storage.ok_or(BuildError::MissingComponent("storage"))?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let ids = self.ids.unwrap_or_else(|| {
            Arc::new(UlidGenerator::new(Arc::clone(&clock))) as Arc<dyn IdGenerator>
        });
        let connectivity = self
            .connectivity
            .unwrap_or_else(|| ConnectivitySignal::new(ConnectionState::Offline));

        let coordinator = SyncCoordinator::start(Parts {
            config: self.config,
            store,
            storage,
            connectivity,
            clock,
            ids,
        })
        .await?;
        Ok(coordinator)
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
