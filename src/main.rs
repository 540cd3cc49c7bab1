//! Spinwheel round engine server
//!
//! Opens the round store, voids rounds abandoned by a previous run, starts the
//! engine and serves the HTTP / WebSocket API until Ctrl+C or SIGTERM.

use clap::Parser;
use spinwheel::{
    api::{server::shutdown_signal, ApiServer, AppState},
    config::ConfigLoader,
    errors::SpinwheelResult,
    factory::EngineFactory,
    logging,
};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "spinwheel")]
#[command(about = "Multiplayer wheel-of-fortune round engine")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RocksDB directory, overrides storage.data_directory
    #[arg(long)]
    db_path: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> SpinwheelResult<()> {
    let cli = Cli::parse();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;

    if let Some(db_path) = cli.db_path {
        config.storage.data_directory = db_path;
    }
    if let Some(host) = cli.host {
        config.api.host = host;
    }
    if let Some(port) = cli.port {
        config.api.port = port;
    }
    if let Some(level) = cli.log_level {
        config.monitoring.log_level = level;
    }

    logging::init_tracing(&config.monitoring);

    info!(
        data_directory = %config.storage.data_directory,
        betting_secs = config.timing.betting_secs,
        drawing_secs = config.timing.drawing_secs,
        cooldown_secs = config.timing.cooldown_secs,
        "Starting spinwheel"
    );

    let api_config = config.api.clone();
    let engine = EngineFactory::create_persistent(config).await?;

    if !engine.recovery.voided_rounds.is_empty() {
        warn!(
            voided = ?engine.recovery.voided_rounds,
            refunded_wagers = engine.recovery.refunded_wagers,
            refunded_amount = engine.recovery.refunded_amount,
            "Previous run left unsettled rounds; they were voided and refunded"
        );
    }
    if !engine.recovery.completed_rounds.is_empty() {
        info!(
            completed = ?engine.recovery.completed_rounds,
            paid_amount = engine.recovery.paid_amount,
            "Finished settlements interrupted by the previous run"
        );
    }

    let state = Arc::new(AppState::new(
        engine.handle.clone(),
        engine.store.clone(),
        engine.ledger.clone(),
    ));

    let served = ApiServer::new(api_config, state).run(shutdown_signal()).await;

    // Let in-flight settlement writes land before exiting
    if let Err(e) = engine.handle.shutdown().await {
        warn!(error = %e, "Engine already stopped");
    }
    if let Err(e) = engine.task.await {
        error!(error = %e, "Engine task panicked");
    }

    let parked = engine.handle.settlement().pending_reconciliation();
    if !parked.is_empty() {
        error!(rounds = ?parked, "Exiting with settled rounds that were never persisted");
    }

    served
}
