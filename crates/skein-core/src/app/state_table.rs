//! QueueStateTable - which action each queue is busy with.
//!
//! This is the only structure mutated from several paths (notifications,
//! handler completions, retry timers, restarts), so every read and write goes
//! through one mutex. The broker additionally funnels every *write* through
//! its reconcile loop, which gives a total order of writes per queue.
//!
//! Design:
//! - An absent entry means idle.
//! - Compare-and-set style helpers (`claim`, `pause_if_processing`, ...)
//!   decide and write under the same lock, so a decision is never made on a
//!   value that another path already replaced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::StaleProcessingPolicy;
use crate::domain::{Action, ActionKey, QueueState, QueueStateSnapshot, ResumeAt};

/// Result of [`QueueStateTable::claim`].
#[derive(Debug)]
pub enum Claim<A: Action> {
    /// The head is new work and is now `Processing`. `replaced` is the stale
    /// state that was dropped for it, if any.
    Dispatch { replaced: Option<QueueState<A>> },

    /// The head is already in flight or intentionally paused.
    Busy(QueueState<A>),
}

pub struct QueueStateTable<A> {
    states: Mutex<HashMap<String, QueueState<A>>>,
}

impl<A: Action> QueueStateTable<A> {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState<A>>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, queue: &str) -> Option<QueueState<A>> {
        self.lock().get(queue).cloned()
    }

    /// Set or clear (`None`) the state of a queue. Returns the previous state.
    pub fn set(&self, queue: &str, state: Option<QueueState<A>>) -> Option<QueueState<A>> {
        let mut states = self.lock();
        match state {
            Some(state) => states.insert(queue.to_string(), state),
            None => states.remove(queue),
        }
    }

    pub fn snapshot(&self, queue: &str) -> Option<QueueStateSnapshot> {
        self.lock().get(queue).map(QueueState::snapshot)
    }

    /// Names of all non-idle queues, sorted.
    pub fn tracked_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Decide whether `head` should be dispatched and, if so, mark it
    /// `Processing` in the same critical section.
    ///
    /// - idle -> dispatch
    /// - Paused on another action -> stale pause, dispatch
    /// - Processing another action -> dispatch only with `Redispatch`
    /// - tracking `head` itself -> busy
    pub fn claim(&self, queue: &str, head: &Arc<A>, policy: StaleProcessingPolicy) -> Claim<A> {
        let mut states = self.lock();
        match states.get(queue) {
            Some(current) if current.tracks(head) => return Claim::Busy(current.clone()),
            Some(current @ QueueState::Processing(_))
                if policy == StaleProcessingPolicy::Wait =>
            {
                return Claim::Busy(current.clone());
            }
            _ => {}
        }
        let replaced = states.insert(queue.to_string(), QueueState::Processing(Arc::clone(head)));
        Claim::Dispatch { replaced }
    }

    /// Clear the entry if it still refers to `key` (Processing or Paused).
    pub fn clear_if_tracking(&self, queue: &str, key: &ActionKey) -> bool {
        let mut states = self.lock();
        if states.get(queue).is_some_and(|s| s.tracks_key(key)) {
            states.remove(queue);
            return true;
        }
        false
    }

    /// `Processing(key)` -> `Paused { .. }`. No-op if the queue moved on.
    pub fn pause_if_processing(&self, queue: &str, key: &ActionKey, resume_at: ResumeAt) -> bool {
        let mut states = self.lock();
        let Some(QueueState::Processing(action)) = states.get(queue) else {
            return false;
        };
        if action.key() != key.key() || action.collection() != key.collection() {
            return false;
        }
        let action = Arc::clone(action);
        states.insert(queue.to_string(), QueueState::Paused { action, resume_at });
        true
    }

    /// Clear any pause on `queue`.
    pub fn clear_if_paused(&self, queue: &str) -> bool {
        let mut states = self.lock();
        if states.get(queue).is_some_and(QueueState::is_paused) {
            states.remove(queue);
            return true;
        }
        false
    }

    /// Clear the pause only if it is exactly the one a timer was armed for.
    pub fn clear_if_paused_on(&self, queue: &str, key: &ActionKey, resume_at: ResumeAt) -> bool {
        let mut states = self.lock();
        let matches = states.get(queue).is_some_and(|state| match state {
            QueueState::Paused { resume_at: at, .. } => *at == resume_at && state.tracks_key(key),
            QueueState::Processing(_) => false,
        });
        if matches {
            states.remove(queue);
        }
        matches
    }

    /// Drop the state of a queue that has no head any more.
    ///
    /// Under `Wait` an in-flight action keeps its `Processing` entry until its
    /// completion clears it, so a queue refilled meanwhile cannot start a
    /// second dispatch. Returns the dropped state.
    pub fn clear_drained(&self, queue: &str, policy: StaleProcessingPolicy) -> Option<QueueState<A>> {
        let mut states = self.lock();
        if states.get(queue).is_some_and(|s| keeps_in_flight(s, policy)) {
            return None;
        }
        states.remove(queue)
    }

    /// [`QueueStateTable::clear_drained`] for every queue not in `live`.
    /// Returns dropped names.
    pub fn retain_live(&self, live: &[String], policy: StaleProcessingPolicy) -> Vec<String> {
        let mut states = self.lock();
        let mut dropped: Vec<String> = states
            .iter()
            .filter(|(q, s)| !live.contains(q) && !keeps_in_flight(s, policy))
            .map(|(q, _)| q.clone())
            .collect();
        dropped.sort();
        for queue in &dropped {
            states.remove(queue);
        }
        dropped
    }
}

fn keeps_in_flight<A>(state: &QueueState<A>, policy: StaleProcessingPolicy) -> bool {
    policy == StaleProcessingPolicy::Wait && matches!(state, QueueState::Processing(_))
}

impl<A: Action> Default for QueueStateTable<A> {
    fn default() -> Self {
        Self::new()
    }
}
