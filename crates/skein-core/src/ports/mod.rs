//! Ports - 抽象化レイヤー
//!
//! Interfaces to the collaborators the broker does not own: the ordered queue
//! store, the handler performing side effects, and the clock.

pub mod clock;
pub mod handler;
pub mod queue_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::handler::Handler;
pub use self::queue_store::{
    CommitNotice, Grouping, OrderedQueueStore, QueuePredicate, Sorting, ViewDefinition,
};
