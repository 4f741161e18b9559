//! Durable ordered queue store using redb.
//!
//! # Table design
//!
//! A single `ACTIONS` table keyed by the action identity:
//! ```text
//! key:   "{collection}\0{key}"
//! value: JSON-encoded action
//! ```
//!
//! Grouping and sorting are code, not data, so views are not persisted. On
//! open the whole table is loaded into a [`ViewIndex`]; views registered
//! afterwards (the master view first, then one filtered view per broker)
//! re-derive every queue from what is on disk. That is how in-flight state is
//! "cancelled" by a restart: the broker starts with an empty state table and
//! finds the same heads again.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use super::memory_store::DEFAULT_NOTIFICATION_CAPACITY;
use super::views::ViewIndex;
use crate::domain::{Action, ActionKey, StoreError};
use crate::ports::{CommitNotice, OrderedQueueStore, ViewDefinition};

const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("skein_actions");

fn storage_key(key: &ActionKey) -> String {
    format!("{}\0{}", key.collection(), key.key())
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn codec(e: serde_json::Error) -> StoreError {
    StoreError::Codec(e.to_string())
}

struct Inner<A> {
    index: ViewIndex<A>,
    sequence: u64,
}

/// Persistent store for actions.
pub struct RedbQueueStore<A> {
    db: Database,
    inner: RwLock<Inner<A>>,
    notices: broadcast::Sender<CommitNotice>,
}

impl<A> RedbQueueStore<A>
where
    A: Action + Serialize + DeserializeOwned,
{
    /// Open or create the redb database at `path` and load every action.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_capacity(path, DEFAULT_NOTIFICATION_CAPACITY)
    }

    pub fn open_with_capacity(path: &Path, capacity: usize) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(backend)?;

        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(backend)?;
        wt.open_table(ACTIONS).map_err(backend)?;
        wt.commit().map_err(backend)?;

        let mut index = ViewIndex::new();
        {
            let rt = db.begin_read().map_err(backend)?;
            let table = rt.open_table(ACTIONS).map_err(backend)?;
            for entry in table.iter().map_err(backend)? {
                let (_, v) = entry.map_err(backend)?;
                let action: A = serde_json::from_slice(v.value()).map_err(codec)?;
                index.upsert(Arc::new(action));
            }
        }
        debug!(path = %path.display(), actions = index.len(), "opened action store");

        let (notices, _) = broadcast::channel(capacity.max(1));
        Ok(Self {
            db,
            inner: RwLock::new(Inner { index, sequence: 0 }),
            notices,
        })
    }

    fn read<T>(&self, f: impl FnOnce(&ViewIndex<A>) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard.index)
    }

    fn notify(&self, inner: &mut Inner<A>, queues: BTreeSet<String>) {
        inner.sequence += 1;
        let _ = self.notices.send(CommitNotice {
            sequence: inner.sequence,
            queues,
        });
    }
}

impl<A> OrderedQueueStore<A> for RedbQueueStore<A>
where
    A: Action + Serialize + DeserializeOwned,
{
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
        let mut encoded = Vec::with_capacity(actions.len());
        for action in &actions {
            let value = serde_json::to_vec(action).map_err(codec)?;
            encoded.push((storage_key(&action.action_key()), value));
        }

        // index の write lock を commit を跨いで保持する（reader は commit 前後どちらかを見る）
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let wt = self.db.begin_write().map_err(backend)?;
        {
            let mut table = wt.open_table(ACTIONS).map_err(backend)?;
            for (key, value) in &encoded {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(backend)?;
            }
        }
        wt.commit().map_err(backend)?;

        let mut queues = BTreeSet::new();
        for action in actions {
            queues.extend(guard.index.upsert(Arc::new(action)));
        }
        self.notify(&mut guard, queues);
        Ok(())
    }

    fn remove(&self, key: &ActionKey) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.index.contains(key) {
            return Ok(false);
        }

        let wt = self.db.begin_write().map_err(backend)?;
        {
            let mut table = wt.open_table(ACTIONS).map_err(backend)?;
            table.remove(storage_key(key).as_str()).map_err(backend)?;
        }
        wt.commit().map_err(backend)?;

        let queues = guard.index.remove(key).unwrap_or_default();
        self.notify(&mut guard, queues);
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
    use tempfile::TempDir;

    fn master() -> ViewDefinition<TestAction> {
        ViewDefinition::grouped(
            |a: &TestAction| a.queue_name().map(str::to_owned),
            |a: &TestAction, b: &TestAction| a.sort(b),
        )
    }

    fn open_tmp() -> (TempDir, RedbQueueStore<TestAction>) {
        let dir = TempDir::new().unwrap();
        let store = RedbQueueStore::open(&dir.path().join("test.redb")).unwrap();
        store.register_view("master", master()).unwrap();
        (dir, store)
    }

    fn queue_keys(store: &RedbQueueStore<TestAction>, queue: &str) -> Vec<String> {
        store
            .actions_in("master", queue)
            .unwrap()
            .iter()
            .map(|a| a.key.clone())
            .collect()
    }

    #[test]
    fn empty_store_has_no_queues() {
        let (_dir, store) = open_tmp();
        assert!(store.queue_names("master").unwrap().is_empty());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn actions_survive_reopen_in_queue_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.redb");
        {
            let store: RedbQueueStore<TestAction> = RedbQueueStore::open(&path).unwrap();
            store
                .put_all(vec![
                    TestAction::new("c", "q", 3),
                    TestAction::new("a", "q", 1),
                    TestAction::new("b", "q", 2),
                ])
                .unwrap();
            assert!(store.remove(&ActionKey::new("actions", "b")).unwrap());
        }

        let reopened: RedbQueueStore<TestAction> = RedbQueueStore::open(&path).unwrap();
        reopened.register_view("master", master()).unwrap();
        assert_eq!(queue_keys(&reopened, "q"), ["a", "c"]);
        assert_eq!(reopened.len().unwrap(), 2);
    }

    #[test]
    fn put_replaces_by_identity() {
        let (_dir, store) = open_tmp();
        store.put(TestAction::new("a", "q1", 1)).unwrap();
        store.put(TestAction::new("a", "q2", 5).labelled("moved")).unwrap();

        assert_eq!(store.queue_names("master").unwrap(), ["q2"]);
        let a = store.get(&ActionKey::new("actions", "a")).unwrap().unwrap();
        assert_eq!(a.label, "moved");
    }

    #[test]
    fn same_key_in_two_collections_are_two_actions() {
        let (_dir, store) = open_tmp();
        store.put(TestAction::new("a", "q", 1)).unwrap();
        store
            .put(TestAction::new("a", "q", 2).in_collection("other"))
            .unwrap();

        assert_eq!(store.len().unwrap(), 2);
        assert!(store.remove(&ActionKey::new("other", "a")).unwrap());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn commits_are_announced_in_order() {
        let (_dir, store) = open_tmp();
        let mut rx = store.subscribe();

        store.put(TestAction::new("a", "q", 1)).unwrap();
        store.remove(&ActionKey::new("actions", "a")).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.sequence + 1, second.sequence);
        assert!(second.queues.contains("q"));
    }
}
