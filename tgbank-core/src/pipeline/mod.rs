//! The deposit pipeline: webhook event → broker → balance credit → notice.

pub mod consumer;
pub mod ledger;
pub mod notify;
pub mod publisher;
mod state;

pub use consumer::DepositConsumer;
pub use ledger::{ApplyDeposit, ApplyError, ApplyOutcome, LedgerSession};
pub use notify::{LogNotifier, Notifier, NotifyError, TelegramNotifier, notifier_from_config};
pub use publisher::{
    DEPOSIT_EXCHANGE, DEPOSIT_QUEUE, DEPOSIT_ROUTING_KEY, DepositPublisher, DepositTopology,
    GATEWAY_EVENT_HEADER, Ingress, IngressError, declare_deposit_topology,
};
pub use state::DepositState;

use crate::broker::{BrokerClient, QueueSubscription, SubscribeOptions};
use crate::session::SessionSource;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Start the supervised consumer for the deposit queue.
pub fn spawn_deposit_consumer<P, N>(
    client: &Arc<BrokerClient>,
    topology: &DepositTopology,
    consumer: DepositConsumer<P, N>,
    options: SubscribeOptions,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    P: SessionSource,
    P::Session: LedgerSession,
    N: Notifier,
{
    client.subscribe(
        vec![QueueSubscription {
            queue: topology.queue.clone(),
            handler: Arc::new(consumer),
        }],
        options,
        shutdown_rx,
    )
}
