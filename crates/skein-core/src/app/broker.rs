//! QueueBroker - 各キューの先頭を一件ずつ Handler に渡す
//!
//! # 構成
//! - **reconcile loop**: 1 本の tokio task。state table への書き込みはすべてここを通る
//! - **handler task**: dispatch ごとに spawn。完了は `Command::Completed` で loop に戻す
//! - **timer task**: 有限の retry delay ごとに spawn。起床時に `Command::Resume` を送る
//!
//! The loop, handler tasks and timers hold only weak handles: dropping the
//! last `QueueBroker` closes the command channel, the loop exits, and late
//! completions or timers find nothing to talk to.
//!
//! # Reconcile
//! For a queue name: read the head from the store, then compare it by
//! identity with the tracked state (see [`QueueStateTable::claim`]). Every
//! pass is idempotent, so spurious or overlapping notifications never cause a
//! second dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::state_table::{Claim, QueueStateTable};
use crate::config::{BrokerConfig, StaleProcessingPolicy};
use crate::domain::{
    Action, ActionKey, BrokerError, Outcome, QueueStateSnapshot, ResumeAt, RetryDelay,
    SetupError, StoreError,
};
use crate::ports::{
    Clock, CommitNotice, Handler, OrderedQueueStore, QueuePredicate, SystemClock, ViewDefinition,
};

/// Longest single tokio sleep; longer delays are slept in chunks.
const MAX_SLEEP: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Which queue names of the parent view a broker serves.
#[derive(Clone)]
pub enum QueueFilter {
    All,
    Prefix(String),
    Exact(String),
    Predicate(QueuePredicate),
}

impl QueueFilter {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        QueueFilter::Prefix(prefix.into())
    }

    pub fn exact(name: impl Into<String>) -> Self {
        QueueFilter::Exact(name.into())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        QueueFilter::Predicate(Arc::new(f))
    }

    pub fn matches(&self, queue: &str) -> bool {
        match self {
            QueueFilter::All => true,
            QueueFilter::Prefix(prefix) => queue.starts_with(prefix.as_str()),
            QueueFilter::Exact(name) => queue == name,
            QueueFilter::Predicate(f) => f(queue),
        }
    }
}

impl fmt::Debug for QueueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueFilter::All => f.write_str("All"),
            QueueFilter::Prefix(p) => f.debug_tuple("Prefix").field(p).finish(),
            QueueFilter::Exact(n) => f.debug_tuple("Exact").field(n).finish(),
            QueueFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Work items of the reconcile loop.
enum Command<A> {
    CheckAll,
    CheckQueue(String),
    Restart(String),
    Resume {
        queue: String,
        key: ActionKey,
        resume_at: ResumeAt,
    },
    Completed {
        queue: String,
        action: Arc<A>,
        outcome: Outcome,
    },
}

struct BrokerInner<A: Action> {
    store: Arc<dyn OrderedQueueStore<A>>,
    parent_view: String,
    handler: Arc<dyn Handler<A>>,
    filter: QueueFilter,
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    states: QueueStateTable<A>,
    registration: watch::Sender<Option<String>>,
    register_lock: Mutex<()>,
    commands: OnceLock<mpsc::UnboundedSender<Command<A>>>,
    /// Succeeded actions whose removal failed, with their queue. Never
    /// dispatched again; the removal is retried on the next check.
    pending_removals: std::sync::Mutex<HashMap<ActionKey, String>>,
}

/// Serializes handler invocations per queue name.
///
/// # 使用例
/// ```ignore
/// let broker = QueueBroker::new(store, MASTER_VIEW_NAME, handler,
///     QueueFilter::prefix("MessageQueue-"), BrokerConfig::default());
/// broker.register("MessageQueue").await?;
/// let queue = broker.queue_name_with_suffix("peer42")?; // "MessageQueue-peer42"
/// ```
pub struct QueueBroker<A: Action> {
    inner: Arc<BrokerInner<A>>,
}

impl<A: Action> Clone for QueueBroker<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Action> fmt::Debug for QueueBroker<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBroker")
            .field("name", &self.registered_name())
            .field("parent_view", &self.inner.parent_view)
            .field("filter", &self.inner.filter)
            .finish_non_exhaustive()
    }
}

impl<A: Action> QueueBroker<A> {
    /// Create an unregistered broker over `parent_view` of `store`.
    pub fn new<S, H>(
        store: Arc<S>,
        parent_view: impl Into<String>,
        handler: Arc<H>,
        filter: QueueFilter,
        config: BrokerConfig,
    ) -> Self
    where
        S: OrderedQueueStore<A> + 'static,
        H: Handler<A> + 'static,
    {
        Self::new_with_clock(store, parent_view, handler, filter, config, Arc::new(SystemClock))
    }

    /// Same as [`QueueBroker::new`] with the clock used for `ResumeAt` stamps.
    pub fn new_with_clock<S, H>(
        store: Arc<S>,
        parent_view: impl Into<String>,
        handler: Arc<H>,
        filter: QueueFilter,
        config: BrokerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        S: OrderedQueueStore<A> + 'static,
        H: Handler<A> + 'static,
    {
        let (registration, _) = watch::channel(None);
        Self {
            inner: Arc::new(BrokerInner {
                store,
                parent_view: parent_view.into(),
                handler,
                filter,
                config,
                clock,
                states: QueueStateTable::new(),
                registration,
                register_lock: Mutex::new(()),
                commands: OnceLock::new(),
                pending_removals: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install this broker's filtered view under `name` and start reconciling.
    ///
    /// The first pass re-derives every queue from what the store holds, which
    /// is how work left over from a previous process gets picked up.
    pub async fn register(&self, name: impl Into<String>) -> Result<(), SetupError> {
        let name = name.into();
        let _guard = self.inner.register_lock.lock().await;
        if let Some(existing) = self.registered_name() {
            return Err(SetupError::AlreadyRegistered(existing));
        }

        // 先に subscribe しておけば view 登録直後の commit も取りこぼさない
        let notices = self.inner.store.subscribe();

        let store = Arc::clone(&self.inner.store);
        let filter = self.inner.filter.clone();
        let definition = ViewDefinition::filtered(self.inner.parent_view.clone(), move |q: &str| {
            filter.matches(q)
        });
        let view = name.clone();
        blocking(move || store.register_view(&view, definition))
            .await
            .map_err(|e| match e {
                BrokerError::Store(e) => SetupError::CannotRegisterBrokerView(e),
                other => SetupError::CannotRegisterBrokerView(StoreError::Backend(other.to_string())),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = LoopContext {
            view: name.clone(),
            commands: tx.downgrade(),
        };
        // register_lock の下で一度しか到達しない
        let _ = tx.send(Command::CheckAll);
        let _ = self.inner.commands.set(tx);
        tokio::spawn(reconcile_loop(Arc::downgrade(&self.inner), ctx, rx, notices));

        info!(
            broker = %name,
            parent = %self.inner.parent_view,
            filter = ?self.inner.filter,
            "queue broker registered"
        );
        self.inner.registration.send_replace(Some(name));
        Ok(())
    }

    pub fn registered_name(&self) -> Option<String> {
        self.inner.registration.borrow().clone()
    }

    /// Resolves once [`QueueBroker::register`] has succeeded.
    pub async fn wait_registered(&self) -> Result<String, BrokerError> {
        let mut rx = self.inner.registration.subscribe();
        let name = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BrokerError::NoRegisteredName)?;
        name.clone().ok_or(BrokerError::NoRegisteredName)
    }

    /// `"{registered name}-{suffix}"`, e.g. `MessageQueue-peer42`.
    pub fn queue_name_with_suffix(&self, suffix: &str) -> Result<String, BrokerError> {
        let name = self.registered_name().ok_or(BrokerError::NoRegisteredName)?;
        Ok(format!("{name}-{suffix}"))
    }

    /// Re-scan every queue of this broker's view.
    pub fn check_for_actions(&self) {
        self.send(Command::CheckAll);
    }

    /// Reconcile one queue.
    pub fn check_queue(&self, queue: impl Into<String>) {
        self.send(Command::CheckQueue(queue.into()));
    }

    /// Clear a pause on `queue` (if any) and reconcile it. A no-op for a
    /// queue that is idle or processing.
    pub fn restart_queue_if_paused(&self, queue: impl Into<String>) {
        self.send(Command::Restart(queue.into()));
    }

    pub fn restart_queues<I, S>(&self, queues: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for queue in queues {
            self.restart_queue_if_paused(queue);
        }
    }

    pub fn queue_state(&self, queue: &str) -> Option<QueueStateSnapshot> {
        self.inner.states.snapshot(queue)
    }

    /// Queues that are processing or paused.
    pub fn tracked_queues(&self) -> Vec<String> {
        self.inner.states.tracked_queues()
    }

    pub fn store(&self) -> &Arc<dyn OrderedQueueStore<A>> {
        &self.inner.store
    }

    pub fn parent_view(&self) -> &str {
        &self.inner.parent_view
    }

    fn send(&self, command: Command<A>) {
        match self.inner.commands.get() {
            Some(tx) => {
                let _ = tx.send(command);
            }
            None => debug!("queue broker not registered yet; request ignored"),
        }
    }
}

/// What the loop knows besides the broker itself.
struct LoopContext<A> {
    view: String,
    commands: mpsc::WeakUnboundedSender<Command<A>>,
}

fn send_weak<A>(commands: &mpsc::WeakUnboundedSender<Command<A>>, command: Command<A>) -> bool {
    match commands.upgrade() {
        Some(tx) => tx.send(command).is_ok(),
        None => false,
    }
}

/// Run a blocking store call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, BrokerError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrokerError::Worker(e.to_string()))?
        .map_err(BrokerError::from)
}

async fn reconcile_loop<A: Action>(
    broker: Weak<BrokerInner<A>>,
    ctx: LoopContext<A>,
    mut commands: mpsc::UnboundedReceiver<Command<A>>,
    mut notices: broadcast::Receiver<CommitNotice>,
) {
    let mut notices_open = true;
    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            notice = notices.recv(), if notices_open => match notice {
                Ok(notice) => {
                    let Some(inner) = broker.upgrade() else { break };
                    if !notice.touches(|q| inner.filter.matches(q)) {
                        debug!(broker = %ctx.view, sequence = notice.sequence, "commit does not touch this broker");
                        continue;
                    }
                    Command::CheckAll
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(broker = %ctx.view, skipped, "commit notices lagged; rescanning");
                    Command::CheckAll
                }
                Err(RecvError::Closed) => {
                    notices_open = false;
                    continue;
                }
            },
        };

        let Some(inner) = broker.upgrade() else { break };
        inner.apply(&ctx, command).await;
    }
    debug!(broker = %ctx.view, "reconcile loop stopped");
}

impl<A: Action> BrokerInner<A> {
    async fn apply(self: &Arc<Self>, ctx: &LoopContext<A>, command: Command<A>) {
        if !matches!(command, Command::Completed { .. }) {
            self.retry_removals(ctx).await;
        }
        match command {
            Command::CheckAll => self.check_all(ctx).await,
            Command::CheckQueue(queue) => self.reconcile(ctx, queue).await,
            Command::Restart(queue) => {
                if self.states.clear_if_paused(&queue) {
                    info!(broker = %ctx.view, queue = %queue, "paused queue restarted");
                }
                self.reconcile(ctx, queue).await;
            }
            Command::Resume {
                queue,
                key,
                resume_at,
            } => {
                if self.states.clear_if_paused_on(&queue, &key, resume_at) {
                    debug!(broker = %ctx.view, queue = %queue, key = %key, "retry delay elapsed");
                }
                self.reconcile(ctx, queue).await;
            }
            Command::Completed {
                queue,
                action,
                outcome,
            } => self.complete(ctx, queue, action, outcome).await,
        }
    }

    /// Drop state for drained queues, then reconcile every non-empty one.
    async fn check_all(self: &Arc<Self>, ctx: &LoopContext<A>) {
        let store = Arc::clone(&self.store);
        let view = ctx.view.clone();
        let heads = match blocking(move || store.heads(&view)).await {
            Ok(heads) => heads,
            Err(e) => {
                warn!(broker = %ctx.view, error = %e, "failed to list queues; waiting for next notification");
                return;
            }
        };

        let live: Vec<String> = heads.iter().map(|(q, _)| q.clone()).collect();
        for queue in self.states.retain_live(&live, self.config.stale_processing) {
            debug!(broker = %ctx.view, queue = %queue, "queue drained; state dropped");
        }
        for (queue, head) in heads {
            self.apply_head(ctx, queue, Some(head));
        }
    }

    fn removals(&self) -> std::sync::MutexGuard<'_, HashMap<ActionKey, String>> {
        self.pending_removals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retry removals that failed after a successful handler run.
    async fn retry_removals(self: &Arc<Self>, ctx: &LoopContext<A>) {
        let pending: Vec<(ActionKey, String)> = self
            .removals()
            .iter()
            .map(|(key, queue)| (key.clone(), queue.clone()))
            .collect();
        for (key, queue) in pending {
            let store = Arc::clone(&self.store);
            let target = key.clone();
            match blocking(move || store.remove(&target)).await {
                Ok(_) => {
                    self.removals().remove(&key);
                    self.states.clear_if_tracking(&queue, &key);
                    info!(broker = %ctx.view, queue = %queue, key = %key, "completed action removed on retry");
                }
                Err(e) => {
                    warn!(broker = %ctx.view, queue = %queue, key = %key, error = %e, "removal still failing; queue stays held");
                }
            }
        }
    }

    async fn reconcile(self: &Arc<Self>, ctx: &LoopContext<A>, queue: String) {
        let store = Arc::clone(&self.store);
        let view = ctx.view.clone();
        let name = queue.clone();
        match blocking(move || store.head_of(&view, &name)).await {
            Ok(head) => self.apply_head(ctx, queue, head),
            Err(e) => {
                warn!(broker = %ctx.view, queue = %queue, error = %e, "failed to read queue head; waiting for next notification");
            }
        }
    }

    fn apply_head(self: &Arc<Self>, ctx: &LoopContext<A>, queue: String, head: Option<Arc<A>>) {
        let Some(head) = head else {
            if let Some(old) = self.states.clear_drained(&queue, self.config.stale_processing) {
                debug!(broker = %ctx.view, queue = %queue, state = ?old, "queue empty; state dropped");
            }
            return;
        };
        if self.removals().contains_key(&head.action_key()) {
            debug!(broker = %ctx.view, queue = %queue, key = %head.action_key(), "head awaits removal; not dispatched");
            return;
        }

        match self.states.claim(&queue, &head, self.config.stale_processing) {
            Claim::Busy(state) => {
                debug!(broker = %ctx.view, queue = %queue, state = ?state, "head already tracked");
            }
            Claim::Dispatch { replaced } => {
                if let Some(old) = replaced {
                    debug!(broker = %ctx.view, queue = %queue, stale = ?old, "head changed; stale state replaced");
                    if old.is_processing() && self.config.stale_processing == StaleProcessingPolicy::Redispatch {
                        warn!(broker = %ctx.view, queue = %queue, "dispatching new head while the previous one is still processing");
                    }
                }
                self.dispatch(ctx, queue, head);
            }
        }
    }

    fn dispatch(&self, ctx: &LoopContext<A>, queue: String, action: Arc<A>) {
        let key = action.action_key();
        info!(broker = %ctx.view, queue = %queue, key = %key, "dispatching action");

        let handler = Arc::clone(&self.handler);
        let commands = ctx.commands.clone();
        tokio::spawn(async move {
            let input = Arc::clone(&action);
            // 別 task で走らせて panic を JoinError として受ける
            let outcome = match tokio::spawn(async move { handler.handle(input).await }).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(queue = %queue, key = %key, error = %e, "handler panicked; pausing queue until restart");
                    Outcome::retry_manually()
                }
            };
            if !send_weak(&commands, Command::Completed { queue, action, outcome }) {
                debug!(key = %key, "broker gone; completion dropped");
            }
        });
    }

    async fn complete(
        self: &Arc<Self>,
        ctx: &LoopContext<A>,
        queue: String,
        action: Arc<A>,
        outcome: Outcome,
    ) {
        let key = action.action_key();
        match outcome {
            Outcome::Success => {
                let store = Arc::clone(&self.store);
                let target = key.clone();
                match blocking(move || store.remove(&target)).await {
                    Ok(removed) => {
                        if removed {
                            debug!(broker = %ctx.view, queue = %queue, key = %key, "action completed and removed");
                        } else {
                            debug!(broker = %ctx.view, queue = %queue, key = %key, "completed action was already removed");
                        }
                        self.states.clear_if_tracking(&queue, &key);
                    }
                    Err(e) => {
                        warn!(broker = %ctx.view, queue = %queue, key = %key, error = %e, "failed to remove completed action; holding queue until the removal succeeds");
                        self.removals().insert(key.clone(), queue.clone());
                        self.states.pause_if_processing(&queue, &key, ResumeAt::Indefinite);
                    }
                }
            }
            Outcome::Failure {
                retry: RetryDelay::Immediate,
            } => {
                debug!(broker = %ctx.view, queue = %queue, key = %key, "handler failed; retrying now");
                self.states.clear_if_tracking(&queue, &key);
            }
            Outcome::Failure {
                retry: RetryDelay::After(delay),
            } => {
                let resume_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| self.clock.now().checked_add_signed(d))
                    .map_or(ResumeAt::Indefinite, ResumeAt::At);
                if self.states.pause_if_processing(&queue, &key, resume_at) {
                    info!(
                        broker = %ctx.view,
                        queue = %queue,
                        key = %key,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "handler failed; queue paused"
                    );
                    if matches!(resume_at, ResumeAt::At(_)) {
                        arm_timer(ctx.commands.clone(), queue.clone(), key.clone(), resume_at, delay);
                    }
                }
            }
            Outcome::Failure {
                retry: RetryDelay::Indefinite,
            } => {
                if self.states.pause_if_processing(&queue, &key, ResumeAt::Indefinite) {
                    warn!(broker = %ctx.view, queue = %queue, key = %key, "handler failed; queue paused until restarted");
                }
            }
        }
        // 先頭が入れ替わっていれば pause を待たずに次へ進む
        self.reconcile(ctx, queue).await;
    }
}

fn arm_timer<A: Action>(
    commands: mpsc::WeakUnboundedSender<Command<A>>,
    queue: String,
    key: ActionKey,
    resume_at: ResumeAt,
    delay: Duration,
) {
    tokio::spawn(async move {
        let mut remaining = delay;
        while !remaining.is_zero() {
            let step = remaining.min(MAX_SLEEP);
            tokio::time::sleep(step).await;
            remaining -= step;
            if commands.upgrade().is_none() {
                return;
            }
        }
        send_weak(
            &commands,
            Command::Resume {
                queue,
                key,
                resume_at,
            },
        );
    });
}
