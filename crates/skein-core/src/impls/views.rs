//! ViewIndex - grouped/sorted views over a set of actions.
//!
//! Shared by every store implementation. A store owns the durable copy of the
//! actions and keeps one `ViewIndex` in memory, updated inside its write
//! transaction, so reads never touch the backend.
//!
//! # Layout
//! - `items`: every stored action by identity (with an insertion sequence)
//! - grouped views: `BTreeMap<queue name, Vec<Entry>>`, each Vec kept sorted
//! - filtered views: only a parent name + predicate, resolved on read

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::{Action, ActionKey, StoreError};
use crate::ports::{Grouping, QueuePredicate, Sorting, ViewDefinition};

/// One stored action plus the sequence it was written with.
///
/// The sequence breaks ties between actions that sort `Equal`, which keeps
/// insertion order inside a queue.
struct Entry<A> {
    action: Arc<A>,
    seq: u64,
}

impl<A> Clone for Entry<A> {
    fn clone(&self) -> Self {
        Self {
            action: Arc::clone(&self.action),
            seq: self.seq,
        }
    }
}

struct GroupedView<A> {
    grouping: Grouping<A>,
    sorting: Sorting<A>,
    groups: BTreeMap<String, Vec<Entry<A>>>,
}

impl<A: Action> GroupedView<A> {
    /// Insert into the right group; returns the group name if any.
    fn insert(&mut self, entry: &Entry<A>) -> Option<String> {
        let group = (self.grouping)(&entry.action)?;
        let sorting = Arc::clone(&self.sorting);
        let items = self.groups.entry(group.clone()).or_default();
        let at = items.partition_point(|existing| {
            sorting(&existing.action, &entry.action)
                .then(existing.seq.cmp(&entry.seq))
                != Ordering::Greater
        });
        items.insert(at, entry.clone());
        Some(group)
    }

    /// Remove the previous version of an action; returns its group if any.
    fn remove(&mut self, previous: &Entry<A>) -> Option<String> {
        let group = (self.grouping)(&previous.action)?;
        if let Some(items) = self.groups.get_mut(&group) {
            items.retain(|e| !e.action.is_same_action(&previous.action));
            if items.is_empty() {
                self.groups.remove(&group);
            }
        }
        Some(group)
    }

    fn rebuild<'a>(&mut self, entries: impl Iterator<Item = &'a Entry<A>>)
    where
        A: 'a,
    {
        self.groups.clear();
        for entry in entries {
            if let Some(group) = (self.grouping)(&entry.action) {
                self.groups.entry(group).or_default().push(entry.clone());
            }
        }
        let sorting = Arc::clone(&self.sorting);
        for items in self.groups.values_mut() {
            items.sort_by(|a, b| sorting(&a.action, &b.action).then(a.seq.cmp(&b.seq)));
        }
    }
}

enum View<A> {
    Grouped(GroupedView<A>),
    Filtered {
        parent: String,
        filter: QueuePredicate,
    },
}

/// In-memory index of all stored actions and the views over them.
pub(crate) struct ViewIndex<A> {
    items: HashMap<ActionKey, Entry<A>>,
    views: HashMap<String, View<A>>,
    next_seq: u64,
}

impl<A: Action> ViewIndex<A> {
    pub(crate) fn new() -> Self {
        Self {
            items: HashMap::new(),
            views: HashMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn register(
        &mut self,
        name: &str,
        definition: ViewDefinition<A>,
    ) -> Result<(), StoreError> {
        if self.views.contains_key(name) {
            return Err(StoreError::ViewExists(name.to_string()));
        }
        let view = match definition {
            ViewDefinition::Grouped { grouping, sorting } => {
                let mut view = GroupedView {
                    grouping,
                    sorting,
                    groups: BTreeMap::new(),
                };
                view.rebuild(self.items.values());
                View::Grouped(view)
            }
            ViewDefinition::Filtered { parent, filter } => {
                if !self.views.contains_key(&parent) {
                    return Err(StoreError::UnknownView(parent));
                }
                View::Filtered { parent, filter }
            }
        };
        self.views.insert(name.to_string(), view);
        Ok(())
    }

    pub(crate) fn unregister(&mut self, name: &str) -> bool {
        self.views.remove(name).is_some()
    }

    pub(crate) fn has_view(&self, name: &str) -> bool {
        self.views.contains_key(name)
    }

    /// Walk filtered views up to the grouped view they derive from.
    fn resolve(&self, name: &str) -> Result<(&GroupedView<A>, Vec<&QueuePredicate>), StoreError> {
        let mut filters = Vec::new();
        let mut current = name;
        loop {
            match self.views.get(current) {
                Some(View::Grouped(view)) => return Ok((view, filters)),
                Some(View::Filtered { parent, filter }) => {
                    filters.push(filter);
                    current = parent;
                }
                None => return Err(StoreError::UnknownView(current.to_string())),
            }
        }
    }

    fn group<'a>(&'a self, view: &str, queue: &str) -> Result<Option<&'a [Entry<A>]>, StoreError> {
        let (grouped, filters) = self.resolve(view)?;
        if !filters.iter().all(|f| f(queue)) {
            return Ok(None);
        }
        Ok(grouped.groups.get(queue).map(Vec::as_slice))
    }

    pub(crate) fn head_of(&self, view: &str, queue: &str) -> Result<Option<Arc<A>>, StoreError> {
        Ok(self
            .group(view, queue)?
            .and_then(|items| items.first())
            .map(|e| Arc::clone(&e.action)))
    }

    pub(crate) fn actions_in(&self, view: &str, queue: &str) -> Result<Vec<Arc<A>>, StoreError> {
        Ok(self
            .group(view, queue)?
            .map(|items| items.iter().map(|e| Arc::clone(&e.action)).collect())
            .unwrap_or_default())
    }

    pub(crate) fn queue_names(&self, view: &str) -> Result<Vec<String>, StoreError> {
        let (grouped, filters) = self.resolve(view)?;
        Ok(grouped
            .groups
            .keys()
            .filter(|q| filters.iter().all(|f| f(q.as_str())))
            .cloned()
            .collect())
    }

    pub(crate) fn heads(&self, view: &str) -> Result<Vec<(String, Arc<A>)>, StoreError> {
        let (grouped, filters) = self.resolve(view)?;
        Ok(grouped
            .groups
            .iter()
            .filter(|(q, _)| filters.iter().all(|f| f(q.as_str())))
            .filter_map(|(q, items)| items.first().map(|e| (q.clone(), Arc::clone(&e.action))))
            .collect())
    }

    pub(crate) fn get(&self, key: &ActionKey) -> Option<Arc<A>> {
        self.items.get(key).map(|e| Arc::clone(&e.action))
    }

    pub(crate) fn contains(&self, key: &ActionKey) -> bool {
        self.items.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Insert or replace by identity. Returns the groups touched.
    pub(crate) fn upsert(&mut self, action: Arc<A>) -> BTreeSet<String> {
        let mut touched = BTreeSet::new();
        let key = action.action_key();
        if let Some(previous) = self.items.remove(&key) {
            for view in self.views.values_mut() {
                if let View::Grouped(grouped) = view {
                    touched.extend(grouped.remove(&previous));
                }
            }
        }

        let entry = Entry {
            action,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        for view in self.views.values_mut() {
            if let View::Grouped(grouped) = view {
                touched.extend(grouped.insert(&entry));
            }
        }
        self.items.insert(key, entry);
        touched
    }

    /// Delete by identity. Returns the groups touched, or None if absent.
    pub(crate) fn remove(&mut self, key: &ActionKey) -> Option<BTreeSet<String>> {
        let previous = self.items.remove(key)?;
        let mut touched = BTreeSet::new();
        for view in self.views.values_mut() {
            if let View::Grouped(grouped) = view {
                touched.extend(grouped.remove(&previous));
            }
        }
        Some(touched)
    }
}
