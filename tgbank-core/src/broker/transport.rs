use super::message::{BrokerMessage, Delivery};
use super::topology::{Binding, Exchange, Queue};
use super::BrokerError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    /// Deliveries are settled by the broker on send.
    pub auto_ack: bool,
    /// Maximum unacknowledged deliveries in flight for this consumer.
    pub prefetch: u16,
}

/// A connection to a message broker.
///
/// Every declaration must be idempotent for identical properties and fail
/// with [`BrokerError::TopologyConflict`] for different ones.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection unless a healthy one exists.
    async fn connect(&self) -> Result<(), BrokerError>;
    async fn is_connected(&self) -> bool;
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), BrokerError>;
    async fn declare_queue(&self, queue: &Queue) -> Result<(), BrokerError>;
    async fn bind_queue(&self, binding: &Binding) -> Result<(), BrokerError>;
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Result<(), BrokerError>;
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;
}
