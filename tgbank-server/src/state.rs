//! Application state shared across all request handlers.

use std::sync::Arc;
use tgbank_core::config::SharedConfig;
use tgbank_core::pipeline::DepositPublisher;
use tgbank_core::session::{SessionManager, SessionMiddleware};

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration (the gateway section can be reloaded via SIGHUP).
    pub config: SharedConfig,
    /// Owner of the database pool, used for readiness probes.
    pub sessions: Arc<SessionManager>,
    /// Retrying session runner for request handlers.
    pub middleware: Arc<SessionMiddleware<SessionManager>>,
    /// Publishes verified gateway deposits to the broker.
    pub publisher: DepositPublisher,
}

impl AppState {
    pub fn new(
        config: SharedConfig,
        middleware: Arc<SessionMiddleware<SessionManager>>,
        publisher: DepositPublisher,
    ) -> Self {
        Self {
            config,
            sessions: middleware.source().clone(),
            middleware,
            publisher,
        }
    }
}
