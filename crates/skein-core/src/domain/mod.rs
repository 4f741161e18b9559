//! Domain model (action identity, queue state, outcomes, errors).
//!
//! Nothing in here knows about stores, tasks or timers.

pub mod action;
pub mod errors;
pub mod outcome;
pub mod state;

pub use self::action::{Action, ActionKey};
pub use self::errors::{BrokerError, SetupError, StoreError};
pub use self::outcome::{Outcome, RetryDelay};
pub use self::state::{QueueState, QueueStateSnapshot, ResumeAt};
