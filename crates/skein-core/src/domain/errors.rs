//! Errors - store, broker and setup error types.
//!
//! Handler failures are not errors: they are reported as
//! [`Outcome::Failure`](super::Outcome) and drive the retry state machine.
//! A head that changed under a processing or paused queue is not an error
//! either; the broker reconciles it silently.

use thiserror::Error;

/// Errors raised by an [`OrderedQueueStore`](crate::ports::OrderedQueueStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("view '{0}' is already registered")]
    ViewExists(String),

    #[error("view '{0}' is not registered")]
    UnknownView(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("action codec error: {0}")]
    Codec(String),
}

/// Errors raised by a running [`QueueBroker`](crate::app::QueueBroker).
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A naming helper was used before the broker got a registered name.
    /// Retry after registration completes.
    #[error("broker has no registered name yet")]
    NoRegisteredName,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("store worker failed: {0}")]
    Worker(String),
}

/// Errors raised while installing views and registering a broker.
///
/// A failed setup call leaves nothing behind: a master view installed by the
/// same call is removed again before the error is returned.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("cannot register master view: {0}")]
    CannotRegisterMasterView(#[source] StoreError),

    #[error("cannot register broker view: {0}")]
    CannotRegisterBrokerView(#[source] StoreError),

    #[error("broker is already registered as '{0}'")]
    AlreadyRegistered(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_error_names_the_view() {
        let err = SetupError::CannotRegisterBrokerView(StoreError::ViewExists("outbox".into()));
        let msg = err.to_string();
        assert!(msg.contains("broker view"), "{msg}");
        assert!(msg.contains("outbox"), "{msg}");
    }

    #[test]
    fn store_error_converts_into_broker_error() {
        let err: BrokerError = StoreError::Backend("disk full".into()).into();
        assert!(matches!(err, BrokerError::Store(StoreError::Backend(_))));
        assert_eq!(err.to_string(), "store backend error: disk full");
    }
}
