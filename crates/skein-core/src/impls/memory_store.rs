//! InMemoryQueueStore - 開発用・テスト用の OrderedQueueStore
//!
//! Same semantics as the durable store minus the file: every write is one
//! "transaction" under the index lock, and commits are announced on a
//! broadcast channel.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use super::views::ViewIndex;
use crate::domain::{Action, ActionKey, StoreError};
use crate::ports::{CommitNotice, OrderedQueueStore, ViewDefinition};

/// Default capacity of the commit notification channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

struct Inner<A> {
    index: ViewIndex<A>,
    sequence: u64,
}

/// Non-durable ordered queue store.
///
/// # 使用例
/// ```ignore
/// let store = Arc::new(InMemoryQueueStore::new());
/// store.register_view("master", master_view())?;
/// store.put(action)?;
/// ```
pub struct InMemoryQueueStore<A> {
    inner: RwLock<Inner<A>>,
    notices: broadcast::Sender<CommitNotice>,
}

impl<A: Action> InMemoryQueueStore<A> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }

    /// `capacity` bounds how many notices a slow subscriber may fall behind
    /// before it sees `Lagged`.
    pub fn with_capacity(capacity: usize) -> Self {
        let (notices, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: RwLock::new(Inner {
                index: ViewIndex::new(),
                sequence: 0,
            }),
            notices,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&ViewIndex<A>) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard.index)
    }
}

impl<A: Action> Default for InMemoryQueueStore<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Action> OrderedQueueStore<A> for InMemoryQueueStore<A> {
    fn register_view(&self, name: &str, definition: ViewDefinition<A>) -> Result<(), StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.index.register(name, definition)
    }

    fn unregister_view(&self, name: &str) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.index.unregister(name)
    }

    fn has_view(&self, name: &str) -> bool {
        self.read(|index| index.has_view(name))
    }

    fn head_of(&self, view: &str, queue: &str) -> Result<Option<Arc<A>>, StoreError> {
        self.read(|index| index.head_of(view, queue))
    }

    fn queue_names(&self, view: &str) -> Result<Vec<String>, StoreError> {
        self.read(|index| index.queue_names(view))
    }

    fn actions_in(&self, view: &str, queue: &str) -> Result<Vec<Arc<A>>, StoreError> {
        self.read(|index| index.actions_in(view, queue))
    }

    fn heads(&self, view: &str) -> Result<Vec<(String, Arc<A>)>, StoreError> {
        self.read(|index| index.heads(view))
    }

    fn get(&self, key: &ActionKey) -> Result<Option<Arc<A>>, StoreError> {
        Ok(self.read(|index| index.get(key)))
    }

    fn put_all(&self, actions: Vec<A>) -> Result<(), StoreError> {
        if actions.is_empty() {
            return Ok(());
        }
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut queues = std::collections::BTreeSet::new();
        for action in actions {
            queues.extend(guard.index.upsert(Arc::new(action)));
        }
        guard.sequence += 1;
        // 受信者がいなくても commit は成立する
        let _ = self.notices.send(CommitNotice {
            sequence: guard.sequence,
            queues,
        });
        Ok(())
    }

    fn remove(&self, key: &ActionKey) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(queues) = guard.index.remove(key) else {
            return Ok(false);
        };
        guard.sequence += 1;
        let _ = self.notices.send(CommitNotice {
            sequence: guard.sequence,
            queues,
        });
        Ok(true)
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read(|index| index.len()))
    }

    fn subscribe(&self) -> broadcast::Receiver<CommitNotice> {
        self.notices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::action::testing::TestAction;
    use tokio::sync::broadcast::error::TryRecvError;

    fn store() -> InMemoryQueueStore<TestAction> {
        let store = InMemoryQueueStore::new();
        store
            .register_view(
                "master",
                ViewDefinition::grouped(
                    |a: &TestAction| a.queue_name().map(str::to_owned),
                    |a: &TestAction, b: &TestAction| a.sort(b),
                ),
            )
            .unwrap();
        store
    }

    #[test]
    fn put_all_is_one_commit() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .put_all(vec![
                TestAction::new("a", "q1", 1),
                TestAction::new("b", "q2", 1),
            ])
            .unwrap();

        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.sequence, 1);
        assert_eq!(notice.queues.len(), 2);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn removing_absent_key_commits_nothing() {
        let store = store();
        let mut rx = store.subscribe();

        let removed = store.remove(&ActionKey::new("actions", "ghost")).unwrap();

        assert!(!removed);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn remove_by_identity_advances_head() {
        let store = store();
        store.put(TestAction::new("a", "q", 1)).unwrap();
        store.put(TestAction::new("b", "q", 2)).unwrap();

        assert!(store.remove(&ActionKey::new("actions", "a")).unwrap());

        let head = store.head_of("master", "q").unwrap().unwrap();
        assert_eq!(head.key, "b");
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.get(&ActionKey::new("actions", "a")).unwrap().is_none());
    }

    #[test]
    fn heads_track_the_current_head_of_each_queue() {
        let store = store();
        store
            .put_all(vec![
                TestAction::new("a", "q1", 1),
                TestAction::new("b", "q1", 2),
                TestAction::new("c", "q2", 1),
            ])
            .unwrap();
        store.remove(&ActionKey::new("actions", "a")).unwrap();
        store.remove(&ActionKey::new("actions", "c")).unwrap();

        let heads = store.heads("master").unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].0, "q1");
        assert_eq!(heads[0].1.key, "b");
    }

    #[test]
    fn unregister_view_frees_the_name() {
        let store = store();
        assert!(store.has_view("master"));
        assert!(store.unregister_view("master"));
        assert!(!store.has_view("master"));
        assert!(!store.unregister_view("master"));
    }
}
