use super::message::{Delivery, Disposition, MessageHandler};
use super::supervisor::{ConsumerSupervisor, SupervisorConfig};
use super::topology::{Binding, Exchange, ExchangeKind, Queue, Topology};
use super::transport::{ConsumeOptions, Transport};
use super::{AmqpTransport, BrokerError, BrokerMessage};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A queue and the handler that consumes it.
#[derive(Clone)]
pub struct QueueSubscription {
    pub queue: Queue,
    pub handler: Arc<dyn MessageHandler>,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub auto_ack: bool,
    pub prefetch: u16,
    pub supervisor: SupervisorConfig,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_ack: false,
            prefetch: 16,
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Broker connection owner.
///
/// Connects lazily, records every declaration and re-declares all of it
/// after a reconnect. Operations that fail with a connection-class error are
/// retried once on a fresh connection; messages are never buffered while the
/// broker is unreachable.
pub struct BrokerClient {
    transport: Arc<dyn Transport>,
    topology: Mutex<Topology>,
    reconnect_lock: tokio::sync::Mutex<()>,
    /// Bumped on every connection this client opens.
    generation: AtomicU64,
}

impl BrokerClient {
    pub fn new(transport: impl Transport) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            topology: Mutex::new(Topology::default()),
            reconnect_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn amqp(url: impl Into<String>) -> Self {
        Self::new(AmqpTransport::new(url))
    }

    pub fn topology(&self) -> Topology {
        self.topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Connect if not connected. A no-op on a healthy connection.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        if self.transport.is_connected().await {
            return Ok(());
        }
        let _guard = self.reconnect_lock.lock().await;
        if self.transport.is_connected().await {
            return Ok(());
        }
        self.open().await
    }

    /// Replace the connection of generation `failed`.
    ///
    /// A connection that another caller already rebuilt is left alone.
    async fn reconnect(&self, failed: u64) -> Result<(), BrokerError> {
        let _guard = self.reconnect_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != failed && self.transport.is_connected().await {
            debug!(generation = failed, "Broker connection already replaced");
            return Ok(());
        }
        if let Err(err) = self.transport.close().await {
            debug!(error = %err, "Error while closing broken broker connection");
        }
        self.open().await
    }

    // Callers hold `reconnect_lock`.
    async fn open(&self) -> Result<(), BrokerError> {
        self.transport.connect().await?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.redeclare().await
    }

    async fn redeclare(&self) -> Result<(), BrokerError> {
        let topology = self.topology();
        if topology.is_empty() {
            return Ok(());
        }
        for exchange in topology.exchanges() {
            self.transport.declare_exchange(exchange).await?;
        }
        for queue in topology.queues() {
            self.transport.declare_queue(queue).await?;
        }
        for binding in topology.bindings() {
            self.transport.bind_queue(binding).await?;
        }
        info!(
            exchanges = topology.exchanges().len(),
            queues = topology.queues().len(),
            bindings = topology.bindings().len(),
            "Re-declared broker topology"
        );
        Ok(())
    }

    async fn with_reconnect<T, F, Fut>(&self, op: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        self.connect().await?;
        let generation = self.generation.load(Ordering::Acquire);
        match op().await {
            Err(err) if err.is_connection() => {
                warn!(error = %err, "Broker operation failed, reconnecting once");
                self.reconnect(generation).await?;
                op().await
            }
            other => other,
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<Exchange, BrokerError> {
        let exchange = Exchange {
            name: name.to_string(),
            kind,
            durable,
        };
        self.with_reconnect(|| self.transport.declare_exchange(&exchange))
            .await?;
        self.registry().record_exchange(exchange.clone());
        Ok(exchange)
    }

    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<Queue, BrokerError> {
        let queue = Queue {
            name: name.to_string(),
            durable,
        };
        self.with_reconnect(|| self.transport.declare_queue(&queue))
            .await?;
        self.registry().record_queue(queue.clone());
        Ok(queue)
    }

    pub async fn bind_queue(
        &self,
        queue: &Queue,
        exchange: &Exchange,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let binding = Binding {
            queue: queue.name.clone(),
            exchange: exchange.name.clone(),
            routing_key: routing_key.to_string(),
        };
        self.with_reconnect(|| self.transport.bind_queue(&binding))
            .await?;
        self.registry().record_binding(binding);
        Ok(())
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Result<(), BrokerError> {
        self.with_reconnect(|| self.transport.publish(exchange, routing_key, message))
            .await?;
        debug!(
            exchange,
            routing_key,
            bytes = message.payload.len(),
            persistent = message.persistent,
            "Published message"
        );
        Ok(())
    }

    /// Start one supervised consumer task per subscription.
    ///
    /// Tasks stop only when `shutdown_rx` flips to `true`, finishing the
    /// delivery in hand first. A lost connection restarts the consumer.
    pub fn subscribe(
        self: &Arc<Self>,
        subscriptions: Vec<QueueSubscription>,
        options: SubscribeOptions,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        subscriptions
            .into_iter()
            .map(|subscription| {
                let client = Arc::clone(self);
                let options = options.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    let supervisor = ConsumerSupervisor::new(
                        subscription.queue.name.clone(),
                        options.supervisor.clone(),
                    );
                    supervisor
                        .run(shutdown_rx.clone(), || {
                            client.consume(&subscription, &options, shutdown_rx.clone())
                        })
                        .await;
                    info!(queue = %subscription.queue.name, "Consumer supervisor exited");
                })
            })
            .collect()
    }

    /// Run one consumer until shutdown (`Ok`) or until its stream fails.
    pub async fn consume(
        &self,
        subscription: &QueueSubscription,
        options: &SubscribeOptions,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let queue = &subscription.queue.name;
        let consume_options = ConsumeOptions {
            consumer_tag: format!("{queue}-{}", uuid::Uuid::new_v4().simple()),
            auto_ack: options.auto_ack,
            prefetch: options.prefetch,
        };
        let mut deliveries = self
            .with_reconnect(|| self.transport.consume(queue, &consume_options))
            .await?;
        info!(queue = %queue, consumer_tag = %consume_options.consumer_tag, "Consumer started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(queue = %queue, "Consumer received shutdown signal");
                        return Ok(());
                    }
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        Self::dispatch(delivery, subscription.handler.as_ref(), options.auto_ack).await;
                    }
                    Some(Err(err)) => {
                        error!(queue = %queue, error = %err, "Consumer stream failed");
                        return Err(err);
                    }
                    None => {
                        warn!(queue = %queue, "Consumer stream ended");
                        return Err(BrokerError::Closed);
                    }
                },
            }
        }
    }

    async fn dispatch(delivery: Delivery, handler: &dyn MessageHandler, auto_ack: bool) {
        let delivery_tag = delivery.envelope.delivery_tag;
        let result = handler.consume(&delivery.envelope).await;
        if auto_ack {
            if let Err(err) = result {
                error!(delivery_tag, error = %err, "Message handler failed on an auto-acked delivery");
            }
            return;
        }

        let disposition = match result {
            Ok(disposition) => disposition,
            Err(err) => {
                error!(delivery_tag, error = %err, "Message handler failed, requeueing");
                Disposition::Reject { requeue: true }
            }
        };
        if let Err(err) = delivery.settle(disposition).await {
            warn!(
                delivery_tag,
                ?disposition,
                error = %err,
                "Failed to settle delivery, the broker will redeliver it"
            );
        }
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.transport.close().await
    }
}
