//! Casambi ⇄ MQTT bridge - Main Entry Point

use casambi_mqtt::bridge::BridgeLifecycle;
use casambi_mqtt::config::{BridgeConfig, ConfigError};
use casambi_mqtt::error::{BridgeError, BridgeResult};
use casambi_mqtt::mesh::{
    FirstNetworkSelector, FixedIndexSelector, InteractiveSelector, NetworkSelector, VirtualMesh,
};
use casambi_mqtt::observability::{init_default_logging, metrics};
use casambi_mqtt::transport::mqtt::{HealthMonitor, MqttClient, ReconnectConfig};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Bridge a Casambi lighting mesh network to an MQTT broker
#[derive(Parser)]
#[command(name = "casambi-mqtt")]
#[command(about = "Bridge a Casambi lighting mesh network to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Tuning file (TOML); connection settings always come from the environment
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge (default)
    Run,
    /// Validate the configuration
    Config {
        /// Print the resolved configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    info!("Starting casambi-mqtt v{}", env!("CARGO_PKG_VERSION"));

    let config = match BridgeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    match result {
        Ok(0) => info!("Application shutdown complete"),
        Ok(code) => process::exit(code),
        Err(e) if e.is_fatal() => {
            error!("Command failed: {}", e.sanitized());
            process::exit(1);
        }
        Err(e) => {
            warn!("Command stopped: {}", e.sanitized());
            process::exit(1);
        }
    }
}

async fn run_bridge(config: BridgeConfig) -> BridgeResult<i32> {
    let reconnect = ReconnectConfig::from(&config.reconnect);
    HealthMonitor::validate_connection_config(&reconnect).map_err(ConfigError::InvalidConfig)?;
    if let Some(total) = reconnect.calculate_max_total_time() {
        info!(
            attempts = reconnect.max_attempts,
            window_secs = total.as_secs(),
            "Broker reconnection policy"
        );
    }

    let broker = Arc::new(MqttClient::new(&config.mqtt, reconnect));
    let mesh = Arc::new(VirtualMesh::from_backend(&config.casambi.backend));
    let selector = network_selector(&config);

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(BridgeError::Signal)?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(BridgeError::Signal)?;
    let shutdown_signal = async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    };

    let mut bridge = BridgeLifecycle::new(config, broker, mesh, selector);
    let outcome = bridge.run(shutdown_signal).await;

    match serde_json::to_string(&metrics().snapshot()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Final metrics"),
        Err(e) => error!(error = %e, "Failed to serialize metrics"),
    }

    let reason = outcome?;
    info!(?reason, "Bridge stopped");
    Ok(reason.exit_code())
}

/// Fixed index when configured, a prompt on a terminal, otherwise the first network
fn network_selector(config: &BridgeConfig) -> Arc<dyn NetworkSelector> {
    match config.casambi.network_index {
        Some(index) => Arc::new(FixedIndexSelector(index)),
        None if std::io::stdin().is_terminal() => Arc::new(InteractiveSelector),
        None => Arc::new(FirstNetworkSelector),
    }
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> BridgeResult<i32> {
    if show {
        println!("{}", config.render_redacted()?);
    }

    info!("Configuration validation complete");
    Ok(0)
}
