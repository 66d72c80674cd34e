//! MQTT Timestamper - Main Entry Point
//!
//! Runs one relay per `[[relays]]` entry over a single shared MQTT connection.

use clap::{Parser, Subcommand};
use mqtt_timestamper::config::TimestamperConfig;
use mqtt_timestamper::connection::mqtt::{MqttConnection, ReconnectConfig};
use mqtt_timestamper::observability::init_default_logging;
use mqtt_timestamper::relay::Relay;
use std::path::PathBuf;
use std::process;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

/// Relay that timestamps JSON messages between MQTT topics
#[derive(Parser)]
#[command(name = "mqtt-timestamper")]
#[command(about = "Republish MQTT JSON messages with a guaranteed timestamp")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TIMESTAMPER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and run every configured relay
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: &[&str] = &["timestamper.toml", "config/timestamper.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-timestamper v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_relays(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<TimestamperConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(TimestamperConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(TimestamperConfig::load_from_file(&path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS[0]
    )
    .into())
}

async fn run_relays(config: TimestamperConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.require_credentials()?;

    let connection =
        MqttConnection::new(&config.mqtt, ReconnectConfig::from(&config.reconnect)).await?;

    // Relays subscribe on the first ConnAck, so there is no need to wait for it here
    let mut relays = Vec::with_capacity(config.relays.len());
    for section in &config.relays {
        if section.rewrite.is_identity() {
            warn!(
                source = %section.source_topic,
                "Relay rewrite leaves topics unchanged; republished messages will match the source filter again"
            );
        }
        let relay = Relay::with_subscribe_qos(
            connection.clone(),
            section.source_topic.clone(),
            section.rewrite.clone(),
            Some(section.publish),
            section.subscribe_qos,
        )?;
        relays.push((relay, section.unsubscribe_on_stop));
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(
        relays = relays.len(),
        broker = %config.mqtt.broker_url,
        "Timestamper is running"
    );

    let mut exit_error: Option<Box<dyn std::error::Error>> = None;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&connection) => {
            error!("MQTT connection permanently lost, shutting down...");
            exit_error = Some("MQTT connection permanently lost".into());
        }
    }

    for (relay, unsubscribe_on_stop) in &relays {
        relay.stop();
        if *unsubscribe_on_stop && connection.connection_state().is_usable() {
            // Already logged by the relay
            let _ = relay.unsubscribe();
        }
    }
    drop(relays);

    if let Err(e) = connection.disconnect().await {
        error!("Error during disconnect: {}", e);
    }

    match exit_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_config_command(
    config: &TimestamperConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!(relays = config.relays.len(), "Configuration validation complete");
    Ok(())
}

/// Resolve once the connection has given up reconnecting
async fn monitor_connection_health(connection: &MqttConnection) {
    while !connection.is_permanently_disconnected() {
        sleep(Duration::from_millis(100)).await;
    }
}
