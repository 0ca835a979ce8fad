//! Latchkey CLI entry point.
//!
//! Provides `start` and `check` subcommands for running the access-control
//! service or validating configuration and storage without serving.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use latchkey::config::LatchkeyConfig;
use latchkey::coordinator::Coordinator;
use latchkey::gateway::server::GatewayServer;
use latchkey::notify::NotificationHub;
use latchkey::store::AccessStore;

/// Queue depth between the gateway and the coordinator.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Queue depth for outbound device/recognizer commands.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Latchkey — two-factor door-lock access backend.
#[derive(Parser)]
#[command(name = "latchkey", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the access-control service.
    Start,
    /// Validate configuration and storage, then exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await,
        Command::Check => handle_check().await,
    }
}

/// Run the access-control service until interrupted.
async fn handle_start() -> anyhow::Result<()> {
    let config = LatchkeyConfig::load().context("failed to load configuration")?;

    let _logging_guard = latchkey::logging::init_production(
        Path::new(&config.paths.logs_dir),
        &config.service.log_level,
    )?;

    info!(version = env!("CARGO_PKG_VERSION"), "latchkey starting");

    let store = Arc::new(
        AccessStore::open(Path::new(&config.paths.db_path))
            .await
            .context("failed to open access store")?,
    );

    let hub = NotificationHub::new();
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

    let coordinator = Coordinator::new(
        Arc::clone(&store),
        hub.clone(),
        commands_tx,
        config.policy.settings(),
    );
    let coordinator_handle = tokio::spawn(coordinator.run(events_rx));

    let gateway = GatewayServer::new(config.service.listen_addr.clone(), events_tx, hub);
    let gateway_handle = tokio::spawn(gateway.run(commands_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = gateway_handle => match result {
            Ok(Ok(())) => warn!("gateway exited"),
            Ok(Err(err)) => error!(error = %err, "gateway failed"),
            Err(err) => error!(error = %err, "gateway task panicked"),
        },
    }

    coordinator_handle.abort();
    info!("latchkey stopped");
    Ok(())
}

/// Validate configuration and storage without serving.
async fn handle_check() -> anyhow::Result<()> {
    latchkey::logging::init_cli();

    let config = LatchkeyConfig::load().context("failed to load configuration")?;
    info!(
        listen_addr = %config.service.listen_addr,
        db_path = %config.paths.db_path,
        window_secs = config.policy.window_secs,
        accept_threshold = config.policy.accept_threshold,
        dedup_threshold = config.policy.dedup_threshold,
        "configuration resolved"
    );

    let store = AccessStore::open(Path::new(&config.paths.db_path))
        .await
        .context("failed to open access store")?;

    let (devices,): (i64,) = sqlx::query_as("SELECT count(*) FROM devices")
        .fetch_one(store.pool())
        .await
        .context("failed to query devices")?;
    let (cards,): (i64,) = sqlx::query_as("SELECT count(*) FROM cards")
        .fetch_one(store.pool())
        .await
        .context("failed to query cards")?;
    let (identities,): (i64,) = sqlx::query_as("SELECT count(*) FROM identities")
        .fetch_one(store.pool())
        .await
        .context("failed to query identities")?;

    info!(devices, cards, identities, "storage check passed");
    store.shutdown().await;
    Ok(())
}
