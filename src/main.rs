//! zwavemq - Z-Wave to Qth bridge
//!
//! Usage:
//!   zwavemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>          Configuration file path
//!   -H, --qth-host-uri <URI>     Qth server URI (default: tcp://localhost:1883)
//!   -p, --qth-prefix <PREFIX>    Topic prefix (default: sys/zwave/)
//!   --client-id <ID>             Qth client ID (default: qth_zwave)
//!   -l, --log-level <LEVEL>      Log level (error, warn, info, debug, trace)
//!   -h, --help                   Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use zwavemq::broker::{Broker, MemoryBroker, QthClient};
use zwavemq::config::{BrokerEndpoint, Config};
use zwavemq::device::{Controller, SimNetwork};
use zwavemq::event;
use zwavemq::NetworkBridge;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// zwavemq - Z-Wave to Qth bridge
#[derive(Parser, Debug)]
#[command(name = "zwavemq")]
#[command(version)]
#[command(about = "Bridges a Z-Wave network into a Qth topic namespace")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Qth server URI, e.g. tcp://hostname:port (memory:// keeps everything in process)
    #[arg(short = 'H', long)]
    qth_host_uri: Option<String>,

    /// Qth path prefix for zwave properties
    #[arg(short = 'p', long)]
    qth_prefix: Option<String>,

    /// Qth client ID
    #[arg(long)]
    client_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults and environment
    let loaded = match &args.config {
        Some(config_path) => Config::load(config_path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file config
    if let Some(uri) = args.qth_host_uri {
        config.broker.uri = uri;
    }
    if let Some(prefix) = args.qth_prefix {
        config.broker.prefix = prefix;
    }
    if let Some(client_id) = args.client_id {
        config.broker.client_id = client_id;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(config_path) = &args.config {
        info!("Loaded configuration from {:?}", config_path);
    }

    info!("Starting zwavemq");
    info!("  Broker: {}", config.broker.uri);
    info!("  Prefix: {}", config.broker.prefix);
    info!("  Client ID: {}", config.broker.client_id);
    info!("  Simulated nodes: {}", config.network.nodes.len());

    let (events_tx, events_rx) = event::channel();

    let mut qth_client = None;
    let broker: Arc<dyn Broker> = match config.broker.endpoint()? {
        BrokerEndpoint::Mqtt { host, port } => {
            let client = Arc::new(QthClient::connect(
                &host,
                port,
                &config.broker,
                events_tx.clone(),
            ));
            qth_client = Some(client.clone());
            client
        }
        BrokerEndpoint::Memory => Arc::new(MemoryBroker::with_events(events_tx.clone())),
    };

    let network = SimNetwork::new(&config.network, events_tx);
    let controller: Arc<dyn Controller> = network.clone();

    let mut bridge = NetworkBridge::new(broker, controller, config.broker.prefix.clone());
    network.start();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let result = bridge.run(events_rx, shutdown).await;

    if let Some(client) = qth_client {
        client.shutdown().await;
    }

    result?;
    info!("Stopped");
    Ok(())
}
