//! Action - the unit of work a broker hands to a handler.
//!
//! An action lives in the store under a `(collection, key)` pair. That pair is
//! its identity: two actions are the same action iff both parts match, no
//! matter what the rest of their payload looks like.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage identity of an action (key + collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey {
    collection: String,
    key: String,
}

impl ActionKey {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

/// Implement this for anything that should enter a queue and eventually be
/// passed to a [`Handler`](crate::ports::Handler).
///
/// # Example
/// ```ignore
/// struct SendMessage { key: String, peer: String, sent_at: DateTime<Utc> }
///
/// impl Action for SendMessage {
///     fn key(&self) -> &str { &self.key }
///     fn collection(&self) -> &str { "outbox" }
///     fn queue_name(&self) -> Option<&str> { Some(&self.peer) }
///     fn sort(&self, other: &Self) -> Ordering { self.sent_at.cmp(&other.sent_at) }
/// }
/// ```
pub trait Action: Send + Sync + 'static {
    /// Store key of this item.
    fn key(&self) -> &str;

    /// Store collection of this item.
    fn collection(&self) -> &str;

    /// The queue this item belongs to. `None` keeps it out of every queue.
    fn queue_name(&self) -> Option<&str>;

    /// How this item sorts against another item of the same queue.
    ///
    /// Must be a total order for the lifetime of one queue.
    fn sort(&self, other: &Self) -> Ordering;

    fn action_key(&self) -> ActionKey {
        ActionKey::new(self.collection(), self.key())
    }

    /// Identity comparison (key + collection), never a value comparison.
    fn is_same_action(&self, other: &Self) -> bool {
        self.key() == other.key() && self.collection() == other.collection()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A small action type shared by the store and broker tests.

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TestAction {
        pub key: String,
        pub collection: String,
        pub queue: Option<String>,
        pub order: i64,
        #[serde(default)]
        pub label: String,
    }

    impl TestAction {
        pub fn new(key: impl Into<String>, queue: impl Into<String>, order: i64) -> Self {
            let key = key.into();
            Self {
                label: key.clone(),
                key,
                collection: "actions".to_string(),
                queue: Some(queue.into()),
                order,
            }
        }

        pub fn unqueued(key: impl Into<String>, order: i64) -> Self {
            let mut action = Self::new(key, "", order);
            action.queue = None;
            action
        }

        pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
            self.collection = collection.into();
            self
        }

        pub fn labelled(mut self, label: impl Into<String>) -> Self {
            self.label = label.into();
            self
        }
    }

    impl Action for TestAction {
        fn key(&self) -> &str {
            &self.key
        }

        fn collection(&self) -> &str {
            &self.collection
        }

        fn queue_name(&self) -> Option<&str> {
            self.queue.as_deref()
        }

        fn sort(&self, other: &Self) -> Ordering {
            self.order.cmp(&other.order)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestAction;
    use super::*;

    #[test]
    fn identity_ignores_payload() {
        let a = TestAction::new("k1", "q", 1).labelled("first");
        let b = TestAction::new("k1", "other", 9).labelled("second");
        assert!(a.is_same_action(&b));
        assert_eq!(a.action_key(), b.action_key());
    }

    #[test]
    fn identity_needs_matching_collection() {
        let a = TestAction::new("k1", "q", 1);
        let b = TestAction::new("k1", "q", 1).in_collection("elsewhere");
        assert!(!a.is_same_action(&b));
    }

    #[test]
    fn action_key_displays_collection_then_key() {
        let key = ActionKey::new("outbox", "42");
        assert_eq!(key.to_string(), "outbox/42");
        assert_eq!(key.collection(), "outbox");
        assert_eq!(key.key(), "42");
    }
}
