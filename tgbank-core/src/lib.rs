#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod entities;
pub mod framework;
pub mod pipeline;
pub mod session;
pub mod utils;
