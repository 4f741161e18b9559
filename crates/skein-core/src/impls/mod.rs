//! Impls - OrderedQueueStore の実装
//!
//! # 含まれる実装
//! - **InMemoryQueueStore**: 開発用・テスト用（ファイルなし）
//! - **RedbQueueStore**: 本番用（redb, プロセス再起動を跨いで残る）
//!
//! Both keep their views in a shared in-memory [`views`] index.

pub mod memory_store;
pub mod redb_store;
mod views;

pub use self::memory_store::{DEFAULT_NOTIFICATION_CAPACITY, InMemoryQueueStore};
pub use self::redb_store::RedbQueueStore;
