//! AMQP 0-9-1 transport backed by `lapin`.

use super::message::{Acknowledger, BrokerMessage, Delivery, Envelope};
use super::topology::{Binding, Exchange, ExchangeKind, Queue};
use super::transport::{ConsumeOptions, DeliveryStream, Transport};
use super::BrokerError;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

struct Live {
    connection: Connection,
    /// Shared channel for declarations and publishing, in confirm mode.
    channel: Channel,
}

pub struct AmqpTransport {
    url: String,
    live: RwLock<Option<Live>>,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            live: RwLock::new(None),
        }
    }

    async fn channel(&self) -> Result<Channel, BrokerError> {
        match self.live.read().await.as_ref() {
            Some(live) if live.channel.status().connected() => Ok(live.channel.clone()),
            _ => Err(BrokerError::Connection("no open AMQP channel".to_string())),
        }
    }

    async fn open_channel(connection: &Connection) -> Result<Channel, BrokerError> {
        let channel = connection.create_channel().await.map_err(map_lapin_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_lapin_error)?;
        Ok(channel)
    }
}

fn map_lapin_error(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::TopologyConflict(amqp.to_string())
            }
            AMQPErrorKind::Soft(_) => BrokerError::Channel(amqp.to_string()),
            AMQPErrorKind::Hard(_) => BrokerError::Connection(amqp.to_string()),
        },
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::MissingHeartbeatError => BrokerError::Connection(err.to_string()),
        lapin::Error::InvalidChannelState(_) => BrokerError::Closed,
        _ => BrokerError::Channel(err.to_string()),
    }
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> BTreeMap<String, String> {
    let Some(table) = table else {
        return BTreeMap::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn to_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let persistent = delivery.properties.delivery_mode() == &Some(PERSISTENT);
    let headers = from_field_table(delivery.properties.headers().as_ref());
    let envelope = Envelope {
        message: BrokerMessage {
            payload: delivery.data.into(),
            headers,
            persistent,
        },
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
    };
    Delivery::new(envelope, AmqpAcker(delivery.acker))
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(drop)
            .map_err(map_lapin_error)
    }

    async fn reject(&self, _delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map(drop)
            .map_err(map_lapin_error)
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut live = self.live.write().await;
        if let Some(current) = live.as_mut() {
            if current.connection.status().connected() {
                if !current.channel.status().connected() {
                    current.channel = Self::open_channel(&current.connection).await?;
                    tracing::info!("Reopened AMQP channel");
                }
                return Ok(());
            }
        }

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|err| BrokerError::Connection(err.to_string()))?;
        let channel = Self::open_channel(&connection).await?;
        *live = Some(Live {
            connection,
            channel,
        });
        tracing::info!("Connected to AMQP broker");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.live.read().await.as_ref() {
            Some(live) => live.connection.status().connected() && live.channel.status().connected(),
            None => false,
        }
    }

    async fn declare_exchange(&self, exchange: &Exchange) -> Result<(), BrokerError> {
        let kind = match exchange.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel()
            .await?
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn declare_queue(&self, queue: &Queue) -> Result<(), BrokerError> {
        self.channel()
            .await?
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(drop)
            .map_err(map_lapin_error)
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), BrokerError> {
        self.channel()
            .await?
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &BrokerMessage,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(if message.persistent { PERSISTENT } else { TRANSIENT });
        if !message.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&message.headers));
        }

        let confirm = self
            .channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(map_lapin_error)?;
        let confirmation = confirm.await.map_err(map_lapin_error)?;
        if confirmation.is_nack() {
            return Err(BrokerError::Channel(
                "broker refused to take the message".to_string(),
            ));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        // Each consumer gets its own channel so prefetch applies per consumer.
        let channel = {
            let live = self.live.read().await;
            let live = live
                .as_ref()
                .ok_or_else(|| BrokerError::Connection("not connected".to_string()))?;
            live.connection
                .create_channel()
                .await
                .map_err(map_lapin_error)?
        };
        channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await
            .map_err(map_lapin_error)?;
        let consumer = channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;

        let stream = consumer.map(|delivery| delivery.map(to_delivery).map_err(map_lapin_error));
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let Some(live) = self.live.write().await.take() else {
            return Ok(());
        };
        if live.connection.status().connected() {
            live.connection
                .close(200, "shutdown")
                .await
                .map_err(map_lapin_error)?;
        }
        tracing::info!("Closed AMQP connection");
        Ok(())
    }
}
