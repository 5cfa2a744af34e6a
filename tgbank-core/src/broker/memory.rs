//! In-process broker with AMQP-like semantics.
//!
//! Supports direct and fanout exchanges, durable and transient entities,
//! persistent and transient messages, explicit acknowledgement with requeue,
//! and simulated connection loss or broker restarts. Used for local runs
//! without RabbitMQ and throughout the test suite.

use super::message::{Acknowledger, BrokerMessage, Delivery, Envelope};
use super::topology::{Binding, Exchange, ExchangeKind, Queue};
use super::transport::{ConsumeOptions, DeliveryStream, Transport};
use super::BrokerError;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    connected: bool,
    unreachable: bool,
    connects: u32,
    next_tag: u64,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, MemoryQueue>,
    bindings: HashSet<Binding>,
}

struct MemoryQueue {
    declared: Queue,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Stored>,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct Stored {
    message: BrokerMessage,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

impl MemoryQueue {
    fn new(declared: Queue) -> Self {
        Self {
            declared,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Put every unacknowledged message back at the head of the queue.
    fn requeue_unacked(&mut self) {
        let mut tags: Vec<u64> = self.unacked.keys().copied().collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(mut stored) = self.unacked.remove(&tag) {
                stored.redelivered = true;
                self.ready.push_front(stored);
            }
        }
    }

    fn wake_all(&self) {
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

fn lock(inner: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the connection. Open consumer streams end and unacknowledged
    /// messages become ready again, flagged as redelivered.
    pub fn simulate_connection_loss(&self) {
        let mut state = lock(&self.inner);
        state.connected = false;
        for queue in state.queues.values_mut() {
            queue.requeue_unacked();
            queue.wake_all();
        }
    }

    /// Refuse new connections while unreachable; going unreachable also
    /// drops the current connection.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.inner).unreachable = !reachable;
        if !reachable {
            self.simulate_connection_loss();
        }
    }

    /// Restart the broker: transient exchanges, queues and messages are lost.
    pub fn restart(&self) {
        let mut state = lock(&self.inner);
        state.connected = false;
        state.exchanges.retain(|_, exchange| exchange.durable);
        state.queues.retain(|_, queue| queue.declared.durable);
        for queue in state.queues.values_mut() {
            queue.requeue_unacked();
            queue.ready.retain(|stored| stored.message.persistent);
            queue.wake_all();
        }
        let BrokerState {
            exchanges,
            queues,
            bindings,
            ..
        } = &mut *state;
        bindings.retain(|b| exchanges.contains_key(&b.exchange) && queues.contains_key(&b.queue));
    }

    /// Messages waiting to be delivered, or `None` if the queue does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        lock(&self.inner).queues.get(queue).map(|q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_len(&self, queue: &str) -> Option<usize> {
        lock(&self.inner).queues.get(queue).map(|q| q.unacked.len())
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.inner).queues.len()
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.inner).bindings.len()
    }

    /// How many connections were opened so far.
    pub fn connect_count(&self) -> u32 {
        lock(&self.inner).connects
    }

    /// Peek at the ready messages of a queue without consuming them.
    pub fn peek(&self, queue: &str) -> Vec<BrokerMessage> {
        lock(&self.inner)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    fn ensure_connected(state: &BrokerState) -> Result<(), BrokerError> {
        if state.connected {
            Ok(())
        } else {
            Err(BrokerError::Connection("not connected".to_string()))
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        if state.unreachable {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        if !state.connected {
            state.connected = true;
            state.connects += 1;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        Self::ensure_connected(&state)?;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing == exchange => Ok(()),
            Some(existing) => Err(BrokerError::TopologyConflict(format!(
                "exchange '{}' exists as {} (durable: {}), requested {} (durable: {})",
                exchange.name, existing.kind, existing.durable, exchange.kind, exchange.durable
            ))),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &Queue) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        Self::ensure_connected(&state)?;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.declared == *queue => Ok(()),
            Some(existing) => Err(BrokerError::TopologyConflict(format!(
                "queue '{}' exists with durable: {}, requested durable: {}",
                queue.name, existing.declared.durable, queue.durable
            ))),
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), MemoryQueue::new(queue.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        Self::ensure_connected(&state)?;
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: binding.exchange.clone(),
            });
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: binding.queue.clone(),
            });
        }
        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        Self::ensure_connected(&state)?;
        let kind = match state.exchanges.get(exchange) {
            Some(e) => e.kind,
            None => {
                return Err(BrokerError::NotFound {
                    kind: "exchange",
                    name: exchange.to_string(),
                });
            }
        };

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();
        if targets.is_empty() {
            tracing::debug!(exchange, routing_key, "Message was unroutable and dropped");
        }
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(Stored {
                    message: message.clone(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
                queue.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        {
            let state = lock(&self.inner);
            Self::ensure_connected(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::NotFound {
                    kind: "queue",
                    name: queue.to_string(),
                });
            }
        }

        let seed = (self.inner.clone(), queue.to_string(), options.auto_ack);
        let stream = futures_util::stream::unfold(seed, |(inner, queue, auto_ack)| async move {
            loop {
                let notify = {
                    let mut guard = lock(&inner);
                    let BrokerState {
                        connected,
                        next_tag,
                        queues,
                        ..
                    } = &mut *guard;
                    if !*connected {
                        return None;
                    }
                    let q = queues.get_mut(&queue)?;
                    if let Some(stored) = q.ready.pop_front() {
                        *next_tag += 1;
                        let delivery_tag = *next_tag;
                        let envelope = Envelope {
                            message: stored.message.clone(),
                            exchange: stored.exchange.clone(),
                            routing_key: stored.routing_key.clone(),
                            delivery_tag,
                            redelivered: stored.redelivered,
                        };
                        if !auto_ack {
                            q.unacked.insert(delivery_tag, stored);
                        }
                        let acker = MemoryAcker {
                            inner: inner.clone(),
                            queue: queue.clone(),
                        };
                        drop(guard);
                        let delivery = Delivery::new(envelope, acker);
                        return Some((Ok(delivery), (inner, queue, auto_ack)));
                    }
                    q.notify.clone()
                };
                notify.notified().await;
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.simulate_connection_loss();
        Ok(())
    }
}

struct MemoryAcker {
    inner: Arc<Mutex<BrokerState>>,
    queue: String,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::Channel(format!("queue '{}' is gone", self.queue)))?;
        queue
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {delivery_tag}")))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = lock(&self.inner);
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::Channel(format!("queue '{}' is gone", self.queue)))?;
        let mut stored = queue
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {delivery_tag}")))?;
        if requeue {
            stored.redelivered = true;
            queue.ready.push_front(stored);
            queue.notify.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> ConsumeOptions {
        ConsumeOptions {
            consumer_tag: "test".to_string(),
            auto_ack: false,
            prefetch: 1,
        }
    }

    async fn setup(broker: &MemoryBroker, durable: bool) {
        broker.connect().await.unwrap();
        broker
            .declare_exchange(&Exchange {
                name: "charge".to_string(),
                kind: ExchangeKind::Direct,
                durable,
            })
            .await
            .unwrap();
        broker
            .declare_queue(&Queue {
                name: "deposits".to_string(),
                durable,
            })
            .await
            .unwrap();
        broker
            .bind_queue(&Binding {
                queue: "deposits".to_string(),
                exchange: "charge".to_string(),
                routing_key: "charge.deposit".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_redeclare_with_other_properties_conflicts() {
        let broker = MemoryBroker::new();
        setup(&broker, true).await;

        let err = broker
            .declare_queue(&Queue {
                name: "deposits".to_string(),
                durable: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::TopologyConflict(_)));

        let err = broker
            .declare_exchange(&Exchange {
                name: "charge".to_string(),
                kind: ExchangeKind::Fanout,
                durable: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::TopologyConflict(_)));
    }

    #[tokio::test]
    async fn test_routing_by_key() {
        let broker = MemoryBroker::new();
        setup(&broker, true).await;

        let message = BrokerMessage::new(&b"{}"[..]);
        broker.publish("charge", "charge.deposit", &message).await.unwrap();
        broker.publish("charge", "charge.other", &message).await.unwrap();

        assert_eq!(broker.queue_len("deposits"), Some(1));
        let err = broker.publish("missing", "x", &message).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { kind: "exchange", .. }));
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers() {
        let broker = MemoryBroker::new();
        setup(&broker, true).await;
        broker
            .publish("charge", "charge.deposit", &BrokerMessage::new(&b"1"[..]))
            .await
            .unwrap();

        let mut stream = broker.consume("deposits", &options()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.envelope.redelivered);
        assert_eq!(broker.unacked_len("deposits"), Some(1));
        first.reject(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.envelope.redelivered);
        assert_eq!(second.envelope.message.payload, &b"1"[..]);
        second.ack().await.unwrap();

        assert_eq!(broker.queue_len("deposits"), Some(0));
        assert_eq!(broker.unacked_len("deposits"), Some(0));
    }

    #[tokio::test]
    async fn test_reject_without_requeue_discards() {
        let broker = MemoryBroker::new();
        setup(&broker, true).await;
        broker
            .publish("charge", "charge.deposit", &BrokerMessage::new(&b"poison"[..]))
            .await
            .unwrap();

        let mut stream = broker.consume("deposits", &options()).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.reject(false).await.unwrap();

        assert_eq!(broker.queue_len("deposits"), Some(0));
        assert_eq!(broker.unacked_len("deposits"), Some(0));
    }

    #[tokio::test]
    async fn test_consumer_waits_for_publish() {
        let broker = MemoryBroker::new();
        setup(&broker, true).await;
        let mut stream = broker.consume("deposits", &options()).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("charge", "charge.deposit", &BrokerMessage::new(&b"late"[..]))
                .await
                .unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.message.payload, &b"late"[..]);
    }

    #[tokio::test]
    async fn test_connection_loss_ends_stream_and_requeues() {
        let broker = MemoryBroker::new();
        setup(&broker, true).await;
        broker
            .publish("charge", "charge.deposit", &BrokerMessage::new(&b"1"[..]))
            .await
            .unwrap();

        let mut stream = broker.consume("deposits", &options()).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        broker.simulate_connection_loss();

        assert!(stream.next().await.is_none());
        assert!(delivery.ack().await.is_err());
        assert_eq!(broker.queue_len("deposits"), Some(1));
        assert!(!broker.is_connected().await);
    }

    #[tokio::test]
    async fn test_restart_keeps_only_durable_state() {
        let broker = MemoryBroker::new();
        setup(&broker, true).await;
        broker
            .declare_queue(&Queue {
                name: "scratch".to_string(),
                durable: false,
            })
            .await
            .unwrap();
        broker
            .publish("charge", "charge.deposit", &BrokerMessage::new(&b"kept"[..]))
            .await
            .unwrap();
        broker
            .publish(
                "charge",
                "charge.deposit",
                &BrokerMessage::new(&b"lost"[..]).transient(),
            )
            .await
            .unwrap();

        broker.restart();

        assert_eq!(broker.queue_count(), 1);
        assert_eq!(broker.binding_count(), 1);
        let remaining = broker.peek("deposits");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, &b"kept"[..]);
    }
}
