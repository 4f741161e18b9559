use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, ensure};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use skein_core::impls::RedbQueueStore;
use skein_core::{Action, BrokerConfig, Handler, OrderedQueueStore, Outcome, QueueFilter};
use tracing::{info, warn};
use ulid::Ulid;

const BROKER_NAME: &str = "MessageQueue";

#[derive(Parser)]
#[command(
    name = "skein",
    about = "Send messages to peers, one at a time per peer, surviving restarts",
    version
)]
struct Cli {
    /// redb file holding pending actions
    #[arg(long, env = "SKEIN_DB", default_value = "skein.redb")]
    db: PathBuf,

    /// Number of peers (one queue each)
    #[arg(long, default_value_t = 3)]
    peers: u32,

    /// Messages enqueued per peer
    #[arg(long, default_value_t = 5)]
    messages: u32,

    /// Probability that a simulated send fails
    #[arg(long, default_value_t = 0.2)]
    fail_rate: f64,

    /// Retry delay after a failed send, in milliseconds
    #[arg(long, default_value_t = 200)]
    retry_ms: u64,

    /// Give up if the queues have not drained after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Optional broker config (TOML)
    #[arg(long, env = "SKEIN_CONFIG")]
    config: Option<PathBuf>,
}

/// Send one stored message to the peer behind `queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageSendAction {
    key: String,
    collection: String,
    message_key: String,
    message_collection: String,
    queue: String,
    date: DateTime<Utc>,
}

impl MessageSendAction {
    fn new(queue: String, date: DateTime<Utc>) -> Self {
        Self {
            key: Ulid::new().to_string(),
            collection: "messageSendActions".to_string(),
            message_key: Ulid::new().to_string(),
            message_collection: "messages".to_string(),
            queue,
            date,
        }
    }
}

impl Action for MessageSendAction {
    fn key(&self) -> &str {
        &self.key
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn queue_name(&self) -> Option<&str> {
        Some(&self.queue)
    }

    fn sort(&self, other: &Self) -> Ordering {
        self.date.cmp(&other.date)
    }
}

#[derive(Default)]
struct Delivery {
    order: BTreeMap<String, Vec<String>>,
    failures: usize,
}

/// Pretends to talk to the network; fails at random.
struct SendMessageHandler {
    fail_rate: f64,
    retry: Duration,
    delivery: Mutex<Delivery>,
}

impl SendMessageHandler {
    fn new(fail_rate: f64, retry: Duration) -> Self {
        Self {
            fail_rate,
            retry,
            delivery: Mutex::new(Delivery::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Handler<MessageSendAction> for SendMessageHandler {
    async fn handle(&self, action: Arc<MessageSendAction>) -> Outcome {
        tokio::time::sleep(Duration::from_millis(10)).await;

        let failed = rand::thread_rng().gen_bool(self.fail_rate);
        if failed {
            warn!(queue = %action.queue, message = %action.message_key, "send failed");
            self.lock().failures += 1;
            return Outcome::retry_after(self.retry);
        }

        info!(queue = %action.queue, message = %action.message_key, "message sent");
        self.lock()
            .order
            .entry(action.queue.clone())
            .or_default()
            .push(action.message_key.clone());
        Outcome::success()
    }
}

async fn wait_for_drain(store: &RedbQueueStore<MessageSendAction>) -> anyhow::Result<()> {
    while !store.is_empty()? {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    ensure!(
        (0.0..1.0).contains(&cli.fail_rate),
        "--fail-rate must be in [0, 1), got {}",
        cli.fail_rate
    );

    let config = BrokerConfig::load(cli.config.as_deref()).context("loading broker config")?;
    let store = Arc::new(
        RedbQueueStore::<MessageSendAction>::open_with_capacity(
            &cli.db,
            config.notification_capacity,
        )
        .with_context(|| format!("opening {}", cli.db.display()))?,
    );
    let leftover = store.len()?;
    if leftover > 0 {
        info!(leftover, "resuming actions left by a previous run");
    }

    let handler = Arc::new(SendMessageHandler::new(
        cli.fail_rate,
        Duration::from_millis(cli.retry_ms),
    ));
    let broker = skein_core::setup_with_store(
        Arc::clone(&store),
        BROKER_NAME,
        Arc::clone(&handler),
        QueueFilter::prefix(format!("{BROKER_NAME}-")),
        config,
    )
    .await
    .context("setting up broker")?;
    broker.wait_registered().await?;

    // message_key -> 投入順の番号
    let mut numbering = HashMap::new();
    let mut actions = Vec::new();
    let base = Utc::now();
    for peer in 1..=cli.peers {
        let queue = broker.queue_name_with_suffix(&format!("peer{peer}"))?;
        for i in 0..cli.messages {
            let action =
                MessageSendAction::new(queue.clone(), base + chrono::Duration::milliseconds(i.into()));
            numbering.insert(action.message_key.clone(), i + 1);
            actions.push(action);
        }
    }
    let enqueued = actions.len();
    let writer = Arc::clone(&store);
    tokio::task::spawn_blocking(move || writer.put_all(actions)).await??;
    info!(enqueued, peers = cli.peers, "messages enqueued");

    let drained =
        tokio::time::timeout(Duration::from_secs(cli.timeout_secs), wait_for_drain(&store)).await;
    match drained {
        Ok(result) => result?,
        Err(_) => anyhow::bail!(
            "queues did not drain within {}s ({} actions left)",
            cli.timeout_secs,
            store.len()?
        ),
    }

    let delivery = handler.lock();
    for (queue, sent) in &delivery.order {
        let order: Vec<String> = sent
            .iter()
            .map(|key| match numbering.get(key) {
                Some(n) => n.to_string(),
                None => key.clone(),
            })
            .collect();
        println!("{queue}: {}", order.join(" "));
    }
    println!("failed attempts: {}", delivery.failures);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_parse() {
        let cli = Cli::try_parse_from(["skein"]).unwrap();
        assert_eq!(cli.peers, 3);
        assert_eq!(cli.messages, 5);
    }

    #[test]
    fn messages_sort_by_date() {
        let now = Utc::now();
        let later = MessageSendAction::new("MessageQueue-peer1".into(), now);
        let earlier =
            MessageSendAction::new("MessageQueue-peer1".into(), now - chrono::Duration::seconds(1));
        assert_eq!(earlier.sort(&later), Ordering::Less);
        assert_eq!(later.queue_name(), Some("MessageQueue-peer1"));
        assert_ne!(earlier.key(), later.key());
    }

    #[tokio::test]
    async fn handler_records_successful_sends() {
        let handler = SendMessageHandler::new(0.0, Duration::from_millis(5));
        let action = Arc::new(MessageSendAction::new("MessageQueue-peer1".into(), Utc::now()));

        let outcome = handler.handle(Arc::clone(&action)).await;

        assert!(outcome.is_success());
        let delivery = handler.lock();
        assert_eq!(delivery.order["MessageQueue-peer1"], [action.message_key.clone()]);
        assert_eq!(delivery.failures, 0);
    }
}
