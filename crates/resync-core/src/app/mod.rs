//! App - アプリケーション層
//!
//! ports と各コンポーネント（dedup / rate limit / stale guard / task queue /
//! offline queue）を組み合わせて同期層を実装します。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder**: 構築とワイヤリング（Fail-fast 検証）
//! - **SyncCoordinator**: outbound / inbound パイプラインと再接続時の drain
//! - **ListenerHandle**: コールバック登録の寿命管理

pub mod builder;
pub mod coordinator;
pub mod listeners;

pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::coordinator::{InboundOutcome, SyncCoordinator};
pub use self::listeners::ListenerHandle;
