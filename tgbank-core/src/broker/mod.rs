//! Message broker client.
//!
//! [`BrokerClient`] owns a [`Transport`] (AMQP via `lapin`, or the in-memory
//! [`MemoryBroker`]), keeps a registry of everything it declared and replays
//! that registry after reconnecting. Consumers are plain [`MessageHandler`]s
//! driven by supervised tasks.

pub mod amqp;
pub mod client;
pub mod memory;
pub mod message;
pub mod supervisor;
pub mod topology;
pub mod transport;

pub use amqp::AmqpTransport;
pub use client::{BrokerClient, QueueSubscription, SubscribeOptions};
pub use memory::MemoryBroker;
pub use message::{Acknowledger, BrokerMessage, Delivery, Disposition, Envelope, MessageHandler};
pub use supervisor::{ConsumerSupervisor, SupervisorConfig};
pub use topology::{Binding, Exchange, ExchangeKind, Queue, Topology};
pub use transport::{ConsumeOptions, DeliveryStream, Transport};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("topology conflict: {0}")]
    TopologyConflict(String),
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("channel error: {0}")]
    Channel(String),
    #[error("message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("broker connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether reconnecting may make the operation succeed.
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Closed)
    }
}
