//! Payment-gateway webhook payload types.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Event name of a settled charge.
pub const CHARGE_SUCCESS: &str = "charge.success";

/// Charge channel of a transfer into a dedicated virtual account.
pub const DEDICATED_NUBAN_CHANNEL: &str = "dedicated_nuban";

/// The `{event, data}` envelope every webhook call carries.
///
/// `data` is kept as raw JSON because its shape depends on `event`; use
/// [`GatewayEvent::kind`] to obtain a typed view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Typed view of the events the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEventKind {
    /// A successful charge into a dedicated virtual account.
    VirtualAccountDeposit(ChargeData),
    /// A successful charge through another channel (card, bank, ...).
    OtherCharge { channel: String },
    /// Anything else; acknowledged without side effects.
    Ignored,
}

/// The subset of `charge.success` data used for deposits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeData {
    pub channel: String,
    /// Amount in minor currency units (kobo).
    pub amount: i64,
    #[serde(default)]
    pub reference: Option<CompactString>,
    pub customer: ChargeCustomer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeCustomer {
    pub customer_code: CompactString,
}

impl GatewayEvent {
    /// Parse a raw webhook body.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Classify the event.
    ///
    /// Returns an error only when the event is `charge.success` but its
    /// `data` does not have the expected charge shape.
    pub fn kind(&self) -> Result<GatewayEventKind, serde_json::Error> {
        if self.event != CHARGE_SUCCESS {
            return Ok(GatewayEventKind::Ignored);
        }
        let charge: ChargeData = serde_json::from_value(self.data.clone())?;
        if charge.channel == DEDICATED_NUBAN_CHANNEL {
            Ok(GatewayEventKind::VirtualAccountDeposit(charge))
        } else {
            Ok(GatewayEventKind::OtherCharge {
                channel: charge.channel,
            })
        }
    }
}
