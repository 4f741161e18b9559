//! Handler port - performs the real side effect for one action.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Action, Outcome};

/// Handler is called with the head of a queue once the queue is idle.
///
/// # Contract
/// - Called at most once per dispatch, never twice concurrently for the same
///   queue (unless `StaleProcessingPolicy::Redispatch` is configured).
/// - The returned future resolving is the completion. A future that never
///   resolves keeps its queue in `Processing` forever; the broker has no
///   watchdog, so put a timeout inside the handler if one is needed.
/// - A panic is caught and treated as `Outcome::retry_manually()`.
///
/// # Example
/// ```ignore
/// struct Sender;
///
/// #[async_trait]
/// impl Handler<SendMessage> for Sender {
///     async fn handle(&self, action: Arc<SendMessage>) -> Outcome {
///         match send(&action).await {
///             Ok(()) => Outcome::success(),
///             Err(_) => Outcome::retry_after(Duration::from_secs(5)),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<A: Action>: Send + Sync {
    async fn handle(&self, action: Arc<A>) -> Outcome;
}
