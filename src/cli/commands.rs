//! CLI command implementations
//!
//! `serve` owns the process lifecycle: load config, init logging, build the
//! subsystems, start background work, serve HTTP, and on Ctrl-C close push
//! streams, stop the tasks and flush the broker.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};

use crate::clock::SystemClock;
use crate::http_server::HttpServer;
use crate::observability::init_logging;
use crate::store::{MemoryStore, SharedStore};
use crate::subsystems::Subsystems;

use super::args::Command;
use super::config::Config;
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Init { config } => init(&config),
        Command::Serve { config } => serve(&config),
        Command::Check { config } => check(&config),
    }
}

/// Write the default configuration; never overwrites
pub fn init(config_path: &Path) -> CliResult<()> {
    if config_path.exists() {
        return Err(CliError::config_exists(config_path));
    }
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            CliError::config_error(format!("Failed to create directory {:?}: {}", parent, e))
        })?;
    }

    let content = serde_json::to_string_pretty(&Config::default())?;
    fs::write(config_path, content)
        .map_err(|e| CliError::config_error(format!("Failed to write config: {}", e)))?;

    write_response(json!({ "initialized": true, "config": config_path.display().to_string() }))
}

/// Validate a config file and print the effective settings
pub fn check(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    write_response(json!({
        "valid": true,
        "server": config.server.socket_addr(),
        "bridge_pattern": config.pubsub.bridge_pattern,
        "default_queue": config.queue.name,
    }))
}

/// Start every service and serve HTTP until Ctrl-C
pub fn serve(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    init_logging(&config.logging.level, config.logging.json).map_err(CliError::boot_failed)?;

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(serve_until_signal(config))
}

async fn serve_until_signal(config: Config) -> CliResult<()> {
    let clock = SystemClock::shared();
    let store: SharedStore = Arc::new(MemoryStore::with_channel_capacity(
        Arc::clone(&clock),
        config.store.channel_capacity,
    ));
    let subsystems = Subsystems::start(config.subsystems_config(), store, clock)
        .map_err(|e| CliError::boot_failed(e.to_string()))?;
    let subsystems = Arc::new(subsystems);
    subsystems.spawn_background();

    let server = HttpServer::new(config.server.clone(), Arc::clone(&subsystems));
    let gateway = Arc::clone(&subsystems.gateway);
    let signal = async move {
        wait_for_ctrl_c().await;
        // Push streams never end on their own
        let closed = gateway.close_all();
        info!(closed, "shutdown requested");
    };

    let served = server.start(signal).await;
    subsystems.shutdown().await;
    served.map_err(|e| CliError::serve_failed(e.to_string()))
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C; serving until killed");
        std::future::pending::<()>().await;
    }
}
