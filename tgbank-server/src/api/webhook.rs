//! Payment gateway webhook.
//!
//! `POST /webhook/paystack` receives gateway events signed with the
//! `x-paystack-signature` header. The signature is checked over the raw body
//! before it is parsed. Virtual account deposits are published to the
//! broker; every other authenticated event is acknowledged and dropped.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use tgbank_core::pipeline::{Ingress, IngressError};
use tgbank_sdk::objects::GatewayEvent;
use tgbank_sdk::signature::{self, SIGNATURE_HEADER, SignatureError};

use crate::state::AppState;

/// Body returned for every accepted event.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub message: bool,
}

/// Errors that can occur while handling a webhook.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("empty request body")]
    EmptyBody,
    #[error("signature verification failed: {0}")]
    Signature(#[from] SignatureError),
    #[error("invalid JSON body: {0}")]
    Json(serde_json::Error),
    #[error(transparent)]
    Ingress(#[from] IngressError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match self {
            WebhookError::EmptyBody => (StatusCode::BAD_REQUEST, "empty request body").into_response(),
            WebhookError::Signature(e) => {
                tracing::warn!(error = %e, "Rejected webhook with bad signature");
                (StatusCode::BAD_REQUEST, "invalid signature").into_response()
            }
            WebhookError::Json(e) => (StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")).into_response(),
            WebhookError::Ingress(IngressError::MalformedCharge(e)) => {
                (StatusCode::BAD_REQUEST, format!("malformed charge data: {e}")).into_response()
            }
            WebhookError::Ingress(IngressError::Publish(e)) => {
                tracing::error!(error = %e, "Failed to publish deposit");
                (StatusCode::SERVICE_UNAVAILABLE, "deposit queue unavailable").into_response()
            }
        }
    }
}

/// `POST /webhook/paystack`
pub async fn paystack_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, WebhookError> {
    if body.is_empty() {
        return Err(WebhookError::EmptyBody);
    }

    let header_value = headers
        .get(SIGNATURE_HEADER)
        .map(|value| value.to_str().map_err(|_| SignatureError::InvalidFormat))
        .transpose()?;
    {
        let gateway = state.config.gateway.read().await;
        signature::verify_body(&body, header_value, gateway.secret_bytes())?;
    }

    let event = GatewayEvent::from_slice(&body).map_err(WebhookError::Json)?;
    match state.publisher.ingest(&event).await? {
        Ingress::Published(message) => {
            tracing::debug!(customer_code = %message.customer_code, "Webhook deposit queued");
        }
        Ingress::Ignored { reason } => {
            tracing::debug!(event = %event.event, reason = %reason, "Webhook event ignored");
        }
    }
    Ok(Json(WebhookAck { message: true }))
}
