//! HTTP API handlers.
//!
//! # Endpoints
//!
//! - `POST /webhook/paystack`   – signed payment gateway events
//! - `GET  /accounts/{user_id}` – balance and virtual account of one user

pub mod accounts;
pub mod webhook;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook/paystack", post(webhook::paystack_webhook))
        .route("/accounts/{user_id}", get(accounts::get_account))
}
