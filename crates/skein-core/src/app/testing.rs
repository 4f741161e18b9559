//! Test helpers shared by the broker and setup tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::setup::master_view;
use crate::domain::action::testing::TestAction;
use crate::domain::{Action, Outcome};
use crate::impls::InMemoryQueueStore;
use crate::ports::{Handler, OrderedQueueStore};

/// In-memory store with the grouped view installed as `"master"`.
pub(crate) fn master_store() -> Arc<InMemoryQueueStore<TestAction>> {
    let store = Arc::new(InMemoryQueueStore::new());
    store.register_view("master", master_view()).unwrap();
    store
}

/// Poll `condition` until it holds; panics after five seconds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub queue: String,
    pub key: String,
    pub at: Instant,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    scripts: HashMap<String, VecDeque<Outcome>>,
    panics: HashSet<String>,
    active: HashMap<String, usize>,
    max_active: HashMap<String, usize>,
}

/// Records every call; answers from a per-key script, success otherwise.
#[derive(Default)]
pub(crate) struct ScriptedHandler {
    state: Mutex<State>,
    delays: HashMap<String, Duration>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call for `queue` takes `delay`.
    pub fn with_delay(mut self, queue: &str, delay: Duration) -> Self {
        self.delays.insert(queue.to_string(), delay);
        self
    }

    /// Outcomes for the next calls with `key`, in order.
    pub fn script(&self, key: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(key.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// The next call with `key` panics.
    pub fn panic_on(&self, key: &str) {
        self.state.lock().unwrap().panics.insert(key.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.key).collect()
    }

    pub fn keys_in(&self, queue: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.queue == queue)
            .map(|c| c.key)
            .collect()
    }

    /// Highest number of overlapping calls seen for `queue`.
    pub fn max_concurrency(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_active
            .get(queue)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Handler<TestAction> for ScriptedHandler {
    async fn handle(&self, action: Arc<TestAction>) -> Outcome {
        let queue = action.queue_name().unwrap_or_default().to_string();
        let (outcome, panic) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call {
                queue: queue.clone(),
                key: action.key.clone(),
                at: Instant::now(),
            });
            let active = state.active.entry(queue.clone()).or_default();
            *active += 1;
            let active = *active;
            let max = state.max_active.entry(queue.clone()).or_default();
            *max = (*max).max(active);
            let outcome = state
                .scripts
                .get_mut(&action.key)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Outcome::Success);
            (outcome, state.panics.remove(&action.key))
        };

        if let Some(delay) = self.delays.get(&queue) {
            tokio::time::sleep(*delay).await;
        }

        if let Some(active) = self.state.lock().unwrap().active.get_mut(&queue) {
            *active -= 1;
        }
        if panic {
            panic!("handler exploded on {}", action.key);
        }
        outcome
    }
}
