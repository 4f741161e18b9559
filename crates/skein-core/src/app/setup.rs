//! Setup - master view の登録と broker の組み立て
//!
//! Every broker of a store shares one grouped view, [`MASTER_VIEW_NAME`],
//! which groups actions by `Action::queue_name` and sorts them with
//! `Action::sort`. Each broker then adds a filtered view on top of it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::broker::{QueueBroker, QueueFilter};
use crate::config::BrokerConfig;
use crate::domain::{Action, SetupError, StoreError};
use crate::ports::{Handler, OrderedQueueStore, ViewDefinition};

pub const MASTER_VIEW_NAME: &str = "SkeinMasterView";

/// The grouped view all brokers filter.
pub fn master_view<A: Action>() -> ViewDefinition<A> {
    ViewDefinition::grouped(
        |action: &A| action.queue_name().map(str::to_owned),
        |a: &A, b: &A| a.sort(b),
    )
}

/// Install the master view (once per store) and register a broker named
/// `name` over the queues accepted by `filter`.
///
/// On failure nothing is left behind: a master view installed by this call
/// is removed again if the broker cannot be registered.
pub async fn setup_with_store<A, S, H>(
    store: Arc<S>,
    name: &str,
    handler: Arc<H>,
    filter: QueueFilter,
    config: BrokerConfig,
) -> Result<QueueBroker<A>, SetupError>
where
    A: Action,
    S: OrderedQueueStore<A> + 'static,
    H: Handler<A> + 'static,
{
    let installed_master = install_master_view::<A, S>(store.as_ref())?;

    let broker = QueueBroker::new(Arc::clone(&store), MASTER_VIEW_NAME, handler, filter, config);
    if let Err(e) = broker.register(name).await {
        warn!(broker = %name, error = %e, "broker registration failed");
        if installed_master && store.unregister_view(MASTER_VIEW_NAME) {
            debug!("master view rolled back");
        }
        return Err(e);
    }
    Ok(broker)
}

/// Returns whether this call installed the view.
fn install_master_view<A, S>(store: &S) -> Result<bool, SetupError>
where
    A: Action,
    S: OrderedQueueStore<A> + ?Sized,
{
    if store.has_view(MASTER_VIEW_NAME) {
        return Ok(false);
    }
    match store.register_view(MASTER_VIEW_NAME, master_view()) {
        Ok(()) => {
            info!(view = MASTER_VIEW_NAME, "master view registered");
            Ok(true)
        }
        // 別の setup が先に登録した
        Err(StoreError::ViewExists(_)) => Ok(false),
        Err(e) => Err(SetupError::CannotRegisterMasterView(e)),
    }
}
