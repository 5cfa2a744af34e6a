//! Runtime configuration shared between the server and the pipeline.
//!
//! Loading and validation live in the server crate; these are the validated
//! values it hands over.

mod gateway;
mod notifier;

pub use gateway::GatewayConfig;
pub use notifier::NotifierConfig;

use std::sync::Arc;
use tokio::sync::RwLock;

/// Sections that can change at runtime (SIGHUP reload).
#[derive(Clone)]
pub struct SharedConfig {
    pub gateway: Arc<RwLock<GatewayConfig>>,
}

impl SharedConfig {
    pub fn new(gateway: GatewayConfig) -> Self {
        Self {
            gateway: Arc::new(RwLock::new(gateway)),
        }
    }
}
