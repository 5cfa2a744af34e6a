//! tgbank deposit server
//!
//! Receives payment gateway webhooks, queues virtual account deposits on the
//! broker and credits them to user balances.

mod api;
mod config;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use config::ConfigLoader;
use server::{build_router, run_server};
use shutdown::spawn_config_reload_handler;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tgbank_core::broker::{BrokerClient, MemoryBroker, SubscribeOptions};
use tgbank_core::pipeline::{
    DepositConsumer, DepositPublisher, declare_deposit_topology, notifier_from_config,
    spawn_deposit_consumer,
};
use tgbank_core::session::{SessionManager, SessionMiddleware};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// tgbank - Resilient deposit pipeline for a chat banking assistant
#[derive(Parser, Debug)]
#[command(name = "tgbank-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "TGBANK_CONFIG", default_value = "./tgbank.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Use an in-process broker instead of RabbitMQ (local development)
    #[arg(long, default_value = "false")]
    in_memory_broker: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "TGBANK_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before clap reads env-backed arguments
    let dotenv = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    init_tracing(args.log_json);

    tracing::info!("Starting tgbank-server v{}", env!("CARGO_PKG_VERSION"));
    match dotenv {
        Ok(path) => tracing::info!("Loaded environment from {:?}", path),
        Err(e) if e.not_found() => tracing::debug!("No .env file found"),
        Err(e) => tracing::warn!("Failed to load .env file: {}", e),
    }

    // Load configuration
    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.listen));
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    // Create the database pool
    tracing::info!("Connecting to database...");
    let sessions = Arc::new(
        SessionManager::connect(loaded_config.database.clone())
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to database: {}", e);
                e
            })?,
    );
    tracing::info!("Database connection established");

    // Run migrations if requested
    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&sessions.pool().await)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    // Connect to the broker and declare the deposit topology
    let broker = if args.in_memory_broker {
        tracing::warn!("Using the in-memory broker; queued deposits are lost on exit");
        Arc::new(BrokerClient::new(MemoryBroker::new()))
    } else {
        Arc::new(BrokerClient::amqp(loaded_config.broker.url.clone()))
    };
    let topology = declare_deposit_topology(&broker).await.map_err(|e| {
        tracing::error!("Failed to declare broker topology: {}", e);
        e
    })?;
    tracing::info!(
        exchange = %topology.exchange.name,
        queue = %topology.queue.name,
        "Broker topology declared"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background pool health checks
    let maintenance = {
        let sessions = sessions.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { sessions.run_maintenance(shutdown_rx).await })
    };

    // Deposit consumer
    let middleware = Arc::new(SessionMiddleware::new(
        sessions.clone(),
        loaded_config.retry.clone(),
    ));
    let consumer = DepositConsumer::new(middleware.clone(), notifier_from_config(&loaded_config.notifier))
        .with_notify_timeout(loaded_config.notifier.timeout);
    let consumers = spawn_deposit_consumer(
        &broker,
        &topology,
        consumer,
        SubscribeOptions {
            prefetch: loaded_config.broker.prefetch,
            ..SubscribeOptions::default()
        },
        shutdown_rx,
    );

    // Create application state
    let state = AppState::new(
        loaded_config.shared(),
        middleware,
        DepositPublisher::new(broker.clone()),
    );

    // Spawn config reload handler (listens for SIGHUP)
    let reload_notify = spawn_config_reload_handler(state.clone(), config_loader);

    // Run the server
    let router = build_router(state);
    tracing::info!("Starting HTTP server on {}", loaded_config.listen);
    let result = run_server(router, loaded_config.listen).await;

    // Stop background tasks
    reload_notify.notify_one();
    if shutdown_tx.send(true).is_err() {
        tracing::debug!("All background tasks already stopped");
    }
    for handle in consumers {
        if let Err(e) = handle.await {
            tracing::error!("Deposit consumer task failed: {}", e);
        }
    }
    if let Err(e) = maintenance.await {
        tracing::error!("Database maintenance task failed: {}", e);
    }

    tracing::info!("Closing broker connection...");
    if let Err(e) = broker.close().await {
        tracing::warn!("Failed to close broker connection: {}", e);
    }
    tracing::info!("Closing database connections...");
    sessions.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,lapin=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
