//! The normalized deposit message carried over the broker.

use bytes::Bytes;
use compact_str::CompactString;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::webhook::ChargeData;

/// Message body published on `charge.deposit`.
///
/// ```json
/// {"customer_code": "CUS_123", "amount": 50.0, "reference": "T123"}
/// ```
///
/// `amount` is in major currency units and travels as a JSON number.
/// `reference` is the gateway transaction reference and is used as the
/// idempotency key when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositMessage {
    pub customer_code: CompactString,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<CompactString>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DepositMessageError {
    #[error("deposit amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),
    #[error("customer code is empty")]
    EmptyCustomerCode,
}

impl DepositMessage {
    /// Normalize a dedicated-account charge: minor units are divided by 100.
    pub fn from_charge(charge: &ChargeData) -> Result<Self, DepositMessageError> {
        let message = Self {
            customer_code: charge.customer.customer_code.clone(),
            amount: Decimal::new(charge.amount, 2),
            reference: charge.reference.clone(),
        };
        message.validate()?;
        Ok(message)
    }

    /// A deposit must credit at least one kobo to a named customer.
    pub fn validate(&self) -> Result<(), DepositMessageError> {
        if self.amount.round_dp(2) <= Decimal::ZERO {
            return Err(DepositMessageError::NonPositiveAmount(self.amount));
        }
        if self.customer_code.trim().is_empty() {
            return Err(DepositMessageError::EmptyCustomerCode);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Decode a message body, rounding the amount to two decimal places.
    ///
    /// Only the shape is checked here; call [`validate`](Self::validate)
    /// before acting on the message.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let mut message: Self = serde_json::from_slice(body)?;
        message.amount = message.amount.round_dp(2);
        Ok(message)
    }
}
