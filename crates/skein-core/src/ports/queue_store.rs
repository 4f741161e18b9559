//! OrderedQueueStore port - durable keyed storage grouped into sorted queues.
//!
//! The store is the source of truth for pending actions. The broker never
//! keeps its own copy of the queue contents; it asks the store for the head
//! of a queue every time it reconciles.
//!
//! # Views
//! - **Grouped** view: a grouping function puts every action into (at most)
//!   one queue, a sorting function orders each queue.
//! - **Filtered** view: a parent view restricted to the queue names that pass
//!   a predicate. Several brokers can share one grouped view this way without
//!   re-deriving it.
//!
//! # Thread safety
//! All methods are blocking. Async callers go through `spawn_blocking`.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::domain::{Action, ActionKey, StoreError};

/// `Action -> queue name` (None = in no queue).
pub type Grouping<A> = Arc<dyn Fn(&A) -> Option<String> + Send + Sync>;

/// Order of two actions within one queue.
pub type Sorting<A> = Arc<dyn Fn(&A, &A) -> Ordering + Send + Sync>;

/// Predicate over queue names.
pub type QueuePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Definition of a view registered with a store.
pub enum ViewDefinition<A> {
    Grouped {
        grouping: Grouping<A>,
        sorting: Sorting<A>,
    },
    Filtered {
        parent: String,
        filter: QueuePredicate,
    },
}

impl<A> ViewDefinition<A> {
    pub fn grouped<G, S>(grouping: G, sorting: S) -> Self
    where
        G: Fn(&A) -> Option<String> + Send + Sync + 'static,
        S: Fn(&A, &A) -> Ordering + Send + Sync + 'static,
    {
        ViewDefinition::Grouped {
            grouping: Arc::new(grouping),
            sorting: Arc::new(sorting),
        }
    }

    pub fn filtered<F>(parent: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        ViewDefinition::Filtered {
            parent: parent.into(),
            filter: Arc::new(filter),
        }
    }
}

impl<A> Clone for ViewDefinition<A> {
    fn clone(&self) -> Self {
        match self {
            ViewDefinition::Grouped { grouping, sorting } => ViewDefinition::Grouped {
                grouping: Arc::clone(grouping),
                sorting: Arc::clone(sorting),
            },
            ViewDefinition::Filtered { parent, filter } => ViewDefinition::Filtered {
                parent: parent.clone(),
                filter: Arc::clone(filter),
            },
        }
    }
}

impl<A> fmt::Debug for ViewDefinition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewDefinition::Grouped { .. } => f.write_str("Grouped"),
            ViewDefinition::Filtered { parent, .. } => {
                f.debug_struct("Filtered").field("parent", parent).finish()
            }
        }
    }
}

/// Emitted once per committed write transaction that changed something.
///
/// `queues` lists every group (of every grouped view) the commit touched,
/// old and new group of a moved action included. It is a hint for skipping
/// unrelated commits, not a complete change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotice {
    pub sequence: u64,
    pub queues: BTreeSet<String>,
}

impl CommitNotice {
    pub fn touches(&self, mut filter: impl FnMut(&str) -> bool) -> bool {
        self.queues.iter().any(|q| filter(q))
    }
}

/// Store port consumed by the broker.
///
/// # Contract
/// - `head_of`, `queue_names` and `heads` each read one consistent snapshot.
/// - `put_all` and `remove` are one write transaction each; a commit that
///   changed anything emits exactly one [`CommitNotice`].
/// - Actions that sort `Equal` keep insertion order.
pub trait OrderedQueueStore<A: Action>: Send + Sync {
    /// Install a view. Fails with `ViewExists` on a name collision and with
    /// `UnknownView` when a filtered view names a missing parent.
    fn register_view(&self, name: &str, definition: ViewDefinition<A>) -> Result<(), StoreError>;

    /// Remove a view. Returns false if nothing was registered under `name`.
    fn unregister_view(&self, name: &str) -> bool;

    fn has_view(&self, name: &str) -> bool;

    /// Current head (lowest item) of `queue` in `view`.
    fn head_of(&self, view: &str, queue: &str) -> Result<Option<Arc<A>>, StoreError>;

    /// All non-empty queue names of `view`, sorted.
    fn queue_names(&self, view: &str) -> Result<Vec<String>, StoreError>;

    /// Every non-empty queue of `view` with its head, sorted by queue name.
    ///
    /// The default reads names and heads separately; stores that can answer
    /// from a single snapshot override it.
    fn heads(&self, view: &str) -> Result<Vec<(String, Arc<A>)>, StoreError> {
        let mut heads = Vec::new();
        for queue in self.queue_names(view)? {
            if let Some(head) = self.head_of(view, &queue)? {
                heads.push((queue, head));
            }
        }
        Ok(heads)
    }

    /// Every action of `queue` in `view`, in queue order.
    fn actions_in(&self, view: &str, queue: &str) -> Result<Vec<Arc<A>>, StoreError>;

    fn get(&self, key: &ActionKey) -> Result<Option<Arc<A>>, StoreError>;

    fn put(&self, action: A) -> Result<(), StoreError> {
        self.put_all(vec![action])
    }

    /// Insert or replace (by identity) in a single commit.
    fn put_all(&self, actions: Vec<A>) -> Result<(), StoreError>;

    /// Delete by identity. Returns whether an action was removed.
    fn remove(&self, key: &ActionKey) -> Result<bool, StoreError>;

    /// Number of stored actions, queued or not.
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<CommitNotice>;
}
