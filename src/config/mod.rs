//! Configuration Module
//!
//! TOML-based configuration for vibegate with support for:
//! - Logging (level, request body logging)
//! - Broker connection (URL, credentials, client id, keep alive, reconnect)
//! - HTTP listener (bind address, body limit, timeouts)
//! - Shared-secret API key
//! - Command table location
//! - Metrics endpoint
//! - Environment variable overrides (`VIBEGATE__*` and the flat legacy names)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{Backoff, BrokerAddress, MqttSettings};

#[cfg(test)]
mod tests;

/// Flat environment variables understood for compatibility with existing
/// deployments. Empty values are ignored.
pub const LEGACY_ENV_VARS: &[&str] = &[
    "MQTT_HOST",
    "MQTT_USER",
    "MQTT_PASS",
    "MQTT_CLIENT_ID",
    "DEBUG_MODE",
    "API_KEY",
    "PORT",
];

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env substitution pattern")
    });
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Interpret a loosely written boolean flag (`1`, `true`, `yes`, `on`)
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection configuration
    pub broker: BrokerConfig,
    /// HTTP listener configuration
    pub http: HttpConfig,
    /// Authorization configuration
    pub auth: AuthConfig,
    /// Command table configuration
    pub commands: CommandsConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// Log parsed request bodies and raise the default level to debug
    pub debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: false,
        }
    }
}

impl LogConfig {
    /// Level to use when none was given on the command line
    pub fn effective_level(&self) -> &str {
        if self.debug && self.level == "info" {
            "debug"
        } else {
            &self.level
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `mqtt://host[:port]`, `tcp://host[:port]` or bare `host[:port]`
    pub url: String,
    /// Username, overrides credentials embedded in the URL
    pub username: Option<String>,
    /// Password, overrides credentials embedded in the URL
    pub password: Option<String>,
    /// Client identifier of the shared publisher connection (generated when unset)
    pub client_id: Option<String>,
    /// Keep alive in seconds
    pub keep_alive: u16,
    /// TCP connect + CONNACK timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// First reconnect delay of the shared connection
    #[serde(with = "humantime_serde")]
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling of the shared connection
    #[serde(with = "humantime_serde")]
    pub reconnect_max: Duration,
    /// Largest inbound packet accepted from the broker
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            username: None,
            password: None,
            client_id: None,
            keep_alive: 60,
            connect_timeout: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            max_packet_size: 1024 * 1024,
        }
    }
}

impl BrokerConfig {
    /// Connection settings for [`crate::broker::MqttConnector`]
    pub fn mqtt_settings(&self) -> Result<MqttSettings, ConfigError> {
        let address = BrokerAddress::parse(&self.url)
            .map_err(|e| ConfigError::Validation(format!("broker.url: {}", e)))?;
        let mut settings = MqttSettings::new(address);
        if let Some(username) = self.username.as_ref().filter(|u| !u.is_empty()) {
            settings.username = Some(username.clone());
        }
        if let Some(password) = self.password.as_ref().filter(|p| !p.is_empty()) {
            settings.password = Some(password.clone());
        }
        settings.keep_alive = self.keep_alive;
        settings.connect_timeout = self.connect_timeout;
        settings.max_packet_size = self.max_packet_size;
        Ok(settings)
    }

    /// Reconnect policy of the shared connection
    pub fn reconnect(&self) -> Backoff {
        Backoff {
            initial: self.reconnect_initial,
            max: self.reconnect_max,
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Largest accepted request body in bytes
    pub body_limit: usize,
    /// Reconnect hint sent as the first chunk of a subscription stream
    #[serde(with = "humantime_serde")]
    pub retry_hint: Duration,
    /// How long a catch-all GET waits for a message
    #[serde(with = "humantime_serde")]
    pub single_shot_timeout: Duration,
    /// Grace period for in-flight requests at shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            body_limit: 100 * 1024,
            retry_hint: Duration::from_millis(10_000),
            single_shot_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Authorization configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret; requests are not checked when unset or empty
    pub api_key: Option<String>,
}

impl AuthConfig {
    /// The configured key, if authorization is enabled
    pub fn key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Command table configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Table file, format chosen by extension (`.yml`/`.yaml`, `.toml`, `.json`)
    pub path: PathBuf,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./commands.yml"),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    pub enabled: bool,
    /// HTTP bind address for metrics endpoint
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports three forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBEGATE__` prefix with double underscores for nesting:
    ///    - `VIBEGATE__HTTP__BIND=127.0.0.1:8080` overrides `http.bind`
    ///    - `VIBEGATE__BROKER__URL=mqtt://broker:1883` overrides `broker.url`
    /// 3. The flat names in [`LEGACY_ENV_VARS`], applied last
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_legacy(path, |name| std::env::var(name).ok())
    }

    /// Like [`Config::load`], resolving the legacy names through `lookup`
    pub fn load_with_legacy<P, F>(path: P, lookup: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("log.debug", false)?
            .set_default("broker.url", "mqtt://localhost:1883")?
            .set_default("broker.keep_alive", 60)?
            .set_default("broker.connect_timeout", "30s")?
            .set_default("broker.reconnect_initial", "1s")?
            .set_default("broker.reconnect_max", "30s")?
            .set_default("broker.max_packet_size", 1024 * 1024)?
            .set_default("http.bind", "0.0.0.0:5000")?
            .set_default("http.body_limit", 100 * 1024)?
            .set_default("http.retry_hint", "10s")?
            .set_default("http.single_shot_timeout", "500ms")?
            .set_default("http.shutdown_timeout", "5s")?
            .set_default("commands.path", "./commands.yml")?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9090")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        config.apply_legacy_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the flat legacy variables through `lookup`
    pub fn apply_legacy_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(host) = get("MQTT_HOST") {
            self.broker.url = host;
        }
        if let Some(user) = get("MQTT_USER") {
            self.broker.username = Some(user);
        }
        if let Some(pass) = get("MQTT_PASS") {
            self.broker.password = Some(pass);
        }
        if let Some(client_id) = get("MQTT_CLIENT_ID") {
            self.broker.client_id = Some(client_id);
        }
        if let Some(debug) = get("DEBUG_MODE") {
            self.log.debug = parse_flag(&debug);
        }
        if let Some(key) = get("API_KEY") {
            self.auth.api_key = Some(key);
        }
        if let Some(port) = get("PORT") {
            let port: u16 = port.trim().parse().map_err(|_| {
                ConfigError::Validation(format!("PORT must be a port number, got '{}'", port))
            })?;
            self.http.bind.set_port(port);
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerAddress::parse(&self.broker.url)
            .map_err(|e| ConfigError::Validation(format!("broker.url: {}", e)))?;

        if self.broker.reconnect_initial.is_zero() {
            return Err(ConfigError::Validation(
                "broker.reconnect_initial must be greater than zero".to_string(),
            ));
        }
        if self.broker.reconnect_max < self.broker.reconnect_initial {
            return Err(ConfigError::Validation(
                "broker.reconnect_max must not be less than broker.reconnect_initial".to_string(),
            ));
        }

        if self.http.body_limit == 0 {
            return Err(ConfigError::Validation(
                "http.body_limit must be greater than zero".to_string(),
            ));
        }
        if self.http.single_shot_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "http.single_shot_timeout must be greater than zero".to_string(),
            ));
        }

        if self.metrics.enabled && self.metrics.bind == self.http.bind {
            return Err(ConfigError::Validation(
                "metrics.bind must differ from http.bind".to_string(),
            ));
        }

        Ok(())
    }
}
