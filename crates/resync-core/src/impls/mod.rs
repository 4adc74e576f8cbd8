//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryDocumentStore**: 障害注入つきのインプロセス backend
//! - **InMemoryStorage**: map ベースの LocalStorage
//! - **FileStorage**: ディレクトリ上の LocalStorage（CLI で使用）
//!
//! 本番の backend（Firestore 風の document store など）は埋め込み側のクレートで
//! `DocumentStore` を実装して差し込みます。

pub mod file_storage;
pub mod memory_storage;
pub mod memory_store;

pub use self::file_storage::FileStorage;
pub use self::memory_storage::InMemoryStorage;
pub use self::memory_store::{InMemoryDocumentStore, StoredWrite};
