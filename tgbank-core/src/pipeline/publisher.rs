//! Turning gateway events into deposit messages on the broker.

use super::DepositState;
use crate::broker::{BrokerClient, BrokerError, BrokerMessage, Exchange, ExchangeKind, Queue};
use std::sync::Arc;
use tgbank_sdk::objects::{CHARGE_SUCCESS, DepositMessage, GatewayEvent, GatewayEventKind};
use thiserror::Error;
use tracing::{info, warn};

pub const DEPOSIT_EXCHANGE: &str = "charge";
pub const DEPOSIT_QUEUE: &str = "charge_deposit_queue";
pub const DEPOSIT_ROUTING_KEY: &str = "charge.deposit";
/// Header carrying the gateway event name that produced a message.
pub const GATEWAY_EVENT_HEADER: &str = "x-gateway-event";

#[derive(Debug, Clone)]
pub struct DepositTopology {
    pub exchange: Exchange,
    pub queue: Queue,
}

/// Declare the durable `charge` exchange and deposit queue and bind them.
pub async fn declare_deposit_topology(client: &BrokerClient) -> Result<DepositTopology, BrokerError> {
    let exchange = client
        .declare_exchange(DEPOSIT_EXCHANGE, ExchangeKind::Direct, true)
        .await?;
    let queue = client.declare_queue(DEPOSIT_QUEUE, true).await?;
    client
        .bind_queue(&queue, &exchange, DEPOSIT_ROUTING_KEY)
        .await?;
    Ok(DepositTopology { exchange, queue })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingress {
    Published(DepositMessage),
    Ignored { reason: String },
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("malformed charge data: {0}")]
    MalformedCharge(#[source] serde_json::Error),
    #[error("failed to publish deposit: {0}")]
    Publish(#[from] BrokerError),
}

#[derive(Clone)]
pub struct DepositPublisher {
    client: Arc<BrokerClient>,
}

impl DepositPublisher {
    pub fn new(client: Arc<BrokerClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<BrokerClient> {
        &self.client
    }

    /// Publish a deposit as a persistent message.
    pub async fn publish(&self, message: &DepositMessage) -> Result<(), BrokerError> {
        let payload = message.to_bytes()?;
        let envelope = BrokerMessage::new(payload).with_header(GATEWAY_EVENT_HEADER, CHARGE_SUCCESS);
        self.client
            .publish(DEPOSIT_EXCHANGE, DEPOSIT_ROUTING_KEY, &envelope)
            .await?;
        info!(
            state = %DepositState::Published,
            customer_code = %message.customer_code,
            amount = %message.amount,
            reference = message.reference.as_deref(),
            "Deposit published"
        );
        Ok(())
    }

    /// Publish the deposit an authenticated gateway event describes, if any.
    pub async fn ingest(&self, event: &GatewayEvent) -> Result<Ingress, IngressError> {
        let charge = match event.kind().map_err(IngressError::MalformedCharge)? {
            GatewayEventKind::VirtualAccountDeposit(charge) => charge,
            GatewayEventKind::OtherCharge { channel } => {
                return Ok(Ingress::Ignored {
                    reason: format!("charge through channel '{channel}'"),
                });
            }
            GatewayEventKind::Ignored => {
                return Ok(Ingress::Ignored {
                    reason: format!("event '{}'", event.event),
                });
            }
        };
        info!(
            state = %DepositState::Received,
            customer_code = %charge.customer.customer_code,
            amount_minor = charge.amount,
            "Virtual account deposit received"
        );

        let message = match DepositMessage::from_charge(&charge) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Ignoring unusable deposit charge");
                return Ok(Ingress::Ignored {
                    reason: err.to_string(),
                });
            }
        };
        self.publish(&message).await?;
        Ok(Ingress::Published(message))
    }
}
