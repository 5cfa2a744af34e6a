use super::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// A message as handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub payload: Bytes,
    pub headers: BTreeMap<String, String>,
    /// Survive a broker restart when routed to a durable queue.
    pub persistent: bool,
}

impl BrokerMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: BTreeMap::new(),
            persistent: true,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }
}

/// A received message together with its routing metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: BrokerMessage,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    /// Set when the broker delivered this message before without an ack.
    pub redelivered: bool,
}

/// Outcome a handler chose for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

/// A delivery that still has to be settled.
///
/// Settling consumes the delivery, so each attempt is acknowledged or
/// rejected at most once.
pub struct Delivery {
    pub envelope: Envelope,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: impl Acknowledger + 'static) -> Self {
        Self {
            envelope,
            acker: Box::new(acker),
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack(self.envelope.delivery_tag).await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(self.envelope.delivery_tag, requeue).await
    }

    pub async fn settle(self, disposition: Disposition) -> Result<(), BrokerError> {
        match disposition {
            Disposition::Ack => self.ack().await,
            Disposition::Reject { requeue } => self.reject(requeue).await,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Callback invoked for every delivery on a subscribed queue.
///
/// An `Err` is treated like `Disposition::Reject { requeue: true }`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn consume(&self, envelope: &Envelope) -> anyhow::Result<Disposition>;
}
