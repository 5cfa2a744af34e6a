//! Wire types shared between the webhook ingress and the deposit consumer.

pub mod objects;
pub mod signature;
