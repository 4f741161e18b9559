//! App - アプリケーション層
//!
//! ports を組み合わせて broker を実装します。
//!
//! # 主要コンポーネント
//! - **QueueBroker**: キューごとに一件ずつ Handler へ渡す（reconcile loop）
//! - **QueueStateTable**: キューごとの Processing / Paused 状態
//! - **setup_with_store**: master view の登録と broker の組み立て

pub mod broker;
pub mod setup;
pub mod state_table;

#[cfg(test)]
pub(crate) mod testing;

// 主要な型を再エクスポート
pub use self::broker::{QueueBroker, QueueFilter};
pub use self::setup::{MASTER_VIEW_NAME, master_view, setup_with_store};
pub use self::state_table::{Claim, QueueStateTable};
