//! Ports - 抽象化レイヤー
//!
//! 外部コラボレータ（backend の document store、永続ストレージ、
//! 接続状態の signal、時計、ID 生成）へのインターフェースを定義します。
//! sync 層はこれらの trait 越しにしか外部に触れません。

pub mod clock;
pub mod connectivity;
pub mod document_store;
pub mod id_generator;
pub mod storage;

pub use self::clock::{Clock, FixedClock, SystemClock, TokioClock};
pub use self::connectivity::ConnectivitySignal;
pub use self::document_store::{Disposer, DocumentStore, Subscription};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::storage::LocalStorage;
