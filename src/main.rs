//! vibegate - HTTP to MQTT gateway
//!
//! Usage:
//!   vibegate [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Configuration file path (default: vibegate.toml if present)
//!   -p, --port <PORT>       HTTP port (default: 5000)
//!   -b, --broker <URL>      Broker URL (default: mqtt://localhost:1883)
//!       --commands <FILE>   Command table (default: ./commands.yml)
//!   -l, --log-level         Log level (error, warn, info, debug, trace)
//!   -h, --help              Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vibegate::broker::MqttConnector;
use vibegate::config::Config;
use vibegate::lifecycle::{Gateway, Signals};

/// Default configuration file, used when present
const DEFAULT_CONFIG: &str = "vibegate.toml";

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn parse(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

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

/// vibegate - HTTP to MQTT gateway
#[derive(Parser, Debug)]
#[command(name = "vibegate")]
#[command(author = "VibeMQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Publish, resolve commands and subscribe to MQTT topics over HTTP")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Broker URL (mqtt://host:port)
    #[arg(short, long)]
    broker: Option<String>,

    /// Command table file (.yml, .yaml, .toml or .json)
    #[arg(long)]
    commands: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn load_config(args: &Args) -> Result<Config, vibegate::config::ConfigError> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = Config::load(&path)?;

    // CLI args override everything else
    if let Some(port) = args.port {
        config.http.bind.set_port(port);
    }
    if let Some(broker) = &args.broker {
        config.broker.url = broker.clone();
    }
    if let Some(commands) = &args.commands {
        config.commands.path = commands.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::parse(config.log.effective_level()));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting vibegate");
    info!("  HTTP address: {}", config.http.bind);
    info!("  Broker: {}", config.broker.url);
    info!("  Command table: {}", config.commands.path.display());
    if config.auth.key().is_some() {
        info!("  Authorization: API key required");
    } else {
        info!("  Authorization: disabled");
    }
    if config.metrics.enabled {
        info!("  Metrics: http://{}/metrics", config.metrics.bind);
    }

    let settings = match config.broker.mqtt_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let connector = Arc::new(MqttConnector::new(settings));

    let mut signals = Signals::register()?;

    let gateway = match Gateway::start(&config, connector).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };
    info!("Gateway listening on port {}", gateway.local_addr()?.port());

    let signal = gateway.run(signals.recv()).await?;
    info!("server stopped by {} with value {}", signal.name(), signal.value());
    std::process::exit(signal.exit_code());
}
