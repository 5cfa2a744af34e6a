pub mod deposit;
pub mod webhook;

pub use deposit::{DepositMessage, DepositMessageError};
pub use webhook::{
    CHARGE_SUCCESS, ChargeCustomer, ChargeData, DEDICATED_NUBAN_CHANNEL, GatewayEvent,
    GatewayEventKind,
};
