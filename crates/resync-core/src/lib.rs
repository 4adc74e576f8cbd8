//! resync-core
//!
//! Client-side sync layer for apps backed by a realtime document store.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, action, events, state, errors, timeline）
//! - **ports**: 抽象化レイヤー（DocumentStore, LocalStorage, Clock, IdGenerator, ConnectivitySignal）
//! - **dedup**: 送受信 ID の有界ウィンドウ
//! - **rate_limit**: カテゴリ別スライディングウィンドウ制限
//! - **stale**: 世代トークンによる古いレスポンスの破棄
//! - **tasks**: タイムアウト付きの有界タスクキュー
//! - **queue**: 永続 offline queue と retry policy
//! - **app**: SyncCoordinator と builder
//! - **impls**: 開発・テスト用の実装（InMemoryDocumentStore, InMemoryStorage, FileStorage）

pub mod app;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod rate_limit;
pub mod stale;
pub mod tasks;

pub use app::{BuildError, CoordinatorBuilder, InboundOutcome, ListenerHandle, SyncCoordinator};
pub use config::{OfflineConfig, RateLimitConfig, SyncConfig, TaskQueueConfig};
pub use observability::SyncStatus;
