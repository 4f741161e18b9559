//! skein-core
//!
//! Per-queue serialized dispatch of durable actions.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（action, state, outcome, errors）
//! - **ports**: 抽象化レイヤー（OrderedQueueStore, Handler, Clock）
//! - **impls**: 実装（InMemoryQueueStore, RedbQueueStore）
//! - **app**: アプリケーションロジック（QueueBroker, QueueStateTable, setup）
//! - **config**: BrokerConfig（TOML + 環境変数）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{MASTER_VIEW_NAME, QueueBroker, QueueFilter, setup_with_store};
pub use config::{BrokerConfig, StaleProcessingPolicy};
pub use domain::{
    Action, ActionKey, BrokerError, Outcome, QueueStateSnapshot, ResumeAt, RetryDelay,
    SetupError, StoreError,
};
pub use ports::{Handler, OrderedQueueStore};
