//! Order consumer service
//!
//! Consumes the main order channel, retries transient failures and routes
//! abandoned orders to the dead-letter channel.

use clap::{Parser, Subcommand};
use orderguard::config::{ConfigError, RelayConfig};
use orderguard::consumer::ConsumerLifecycle;
use orderguard::observability::{health::HealthServer, init_default_logging};
use orderguard::processing::{InMemoryIdempotencyGuard, OrderHandler};
use orderguard::{RelayError, RelayResult};
use orderguard::transport::mqtt::MqttClient;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Reliable order consumer
#[derive(Parser)]
#[command(name = "orderguard")]
#[command(about = "Order consumer with idempotency, retries and a dead-letter channel")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consumer until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["orderguard.toml", "config/orderguard.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting orderguard v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_consumer(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&PathBuf>) -> RelayResult<RelayConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(RelayConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(RelayConfig::load_from_file(&path)?);
        }
    }

    Err(ConfigError::InvalidConfig(
        "No configuration file found. Provide one with -c/--config or create orderguard.toml"
            .to_string(),
    )
    .into())
}

async fn run_consumer(config: RelayConfig) -> RelayResult<()> {
    config.validate()?;
    info!(
        group = %config.broker.group,
        channel = %config.channels.main,
        "Consumer starting"
    );

    let transport = MqttClient::new(
        &config.client_id(),
        config.broker.clone(),
        config.consumer.partitions,
    )?;
    let handler = Arc::new(OrderHandler::with_logging_sink(Arc::new(
        InMemoryIdempotencyGuard::new(),
    )));
    let mut consumer = ConsumerLifecycle::new(config.clone(), transport, handler);

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let health_server = Arc::new(HealthServer::new(config.client_id(), health_port));
    tokio::spawn(health_server.clone().start());
    consumer.set_health_server(health_server);

    consumer.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Consumer is running and waiting for orders");

    let fatal = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            None
        }
        reason = consumer.wait_for_fatal() => {
            error!(reason = %reason, "Consumer cannot continue, shutting down");
            Some(reason)
        }
    };

    if let Err(e) = consumer.shutdown().await {
        warn!("Error during shutdown: {}", e);
        return Err(e.into());
    }

    match fatal {
        Some(reason) => Err(RelayError::consumer_failed(reason)),
        None => Ok(()),
    }
}

fn handle_config_command(config: RelayConfig, show: bool) -> RelayResult<()> {
    config.validate()?;
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
