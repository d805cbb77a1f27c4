//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Broker subscription settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Ingestion defaults and buffer sizes.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Defaults for the history query surface.
    #[serde(default)]
    pub query: QueryConfig,

    /// Whether `load_config` read a file, as opposed to using defaults.
    #[serde(skip)]
    pub file_loaded: bool,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "speedo_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// MQTT broker connection and subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Set to false to run without a broker (REST and simulator only).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Broker host name.
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier presented to the broker.
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    /// Topic carrying speed telemetry.
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,

    /// MQTT keep-alive interval in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Pause between reconnection attempts after a connection error.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Ingestion defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Unit stored when a producer omits one.
    #[serde(default = "default_unit")]
    pub default_unit: String,

    /// Capacity of the hand-off queue between producers and the ingest worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-observer outbound buffer, in messages. An observer whose buffer
    /// is full when a broadcast arrives is disconnected.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

/// History query defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Window used by `/history` when `hours` is not given.
    #[serde(default = "default_history_hours")]
    pub history_hours: i64,

    /// Row limit used by `/history` when `limit` is not given.
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,

    /// Upper bound applied to any requested `limit`.
    #[serde(default = "default_max_history_limit")]
    pub max_history_limit: i64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> String {
    "speedo.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "speedometer_backend".to_string()
}

fn default_mqtt_topic() -> String {
    "sensors/speed".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_unit() -> String {
    speedo_readings::DEFAULT_UNIT.to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_observer_buffer() -> usize {
    256
}

fn default_history_hours() -> i64 {
    24
}

fn default_history_limit() -> i64 {
    1000
}

fn default_max_history_limit() -> i64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
            topic: default_mqtt_topic(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_unit: default_unit(),
            queue_capacity: default_queue_capacity(),
            observer_buffer: default_observer_buffer(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            history_hours: default_history_hours(),
            history_limit: default_history_limit(),
            max_history_limit: default_max_history_limit(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SPEEDO_HOST` overrides `server.host`
/// - `SPEEDO_PORT` overrides `server.port`
/// - `SPEEDO_DB_PATH` overrides `database.path`
/// - `SPEEDO_LOG_LEVEL` overrides `logging.level`
/// - `SPEEDO_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `SPEEDO_MQTT_ENABLED` overrides `mqtt.enabled`
/// - `SPEEDO_MQTT_HOST` overrides `mqtt.host`
/// - `SPEEDO_MQTT_PORT` overrides `mqtt.port`
/// - `SPEEDO_MQTT_TOPIC` overrides `mqtt.topic`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => Config {
                file_loaded: true,
                ..toml::from_str::<Config>(&contents)?
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("SPEEDO_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("SPEEDO_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("SPEEDO_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("SPEEDO_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("SPEEDO_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(enabled) = std::env::var("SPEEDO_MQTT_ENABLED") {
        config.mqtt.enabled = enabled == "true" || enabled == "1";
    }
    if let Ok(host) = std::env::var("SPEEDO_MQTT_HOST") {
        config.mqtt.host = host;
    }
    if let Ok(port) = std::env::var("SPEEDO_MQTT_PORT") {
        if let Ok(parsed) = port.parse() {
            config.mqtt.port = parsed;
        }
    }
    if let Ok(topic) = std::env::var("SPEEDO_MQTT_TOPIC") {
        config.mqtt.topic = topic;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.mqtt.topic, "sensors/speed");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.ingest.default_unit, "km/h");
        assert_eq!(config.query.history_hours, 24);
        assert_eq!(config.query.history_limit, 1000);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            host = "broker.internal"
            topic = "fleet/speed"

            [ingest]
            default_unit = "mph"
            "#,
        )
        .expect("toml should parse");

        assert_eq!(config.mqtt.host, "broker.internal");
        assert_eq!(config.mqtt.topic, "fleet/speed");
        assert_eq!(config.mqtt.port, 1883);
        assert!(config.mqtt.enabled);
        assert_eq!(config.ingest.default_unit, "mph");
        assert_eq!(config.ingest.observer_buffer, 256);
        assert_eq!(config.database.path, "speedo.db");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Some("/nonexistent/speedo-config.toml"))
            .expect("missing file is not an error");
        assert_eq!(config.query.max_history_limit, 10_000);
        assert!(!config.file_loaded);
    }

    #[test]
    fn existing_file_is_marked_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[query]\nhistory_hours = 6\n").expect("write config");

        let config = load_config(path.to_str()).expect("valid config");
        assert!(config.file_loaded);
        assert_eq!(config.query.history_hours, 6);
        assert!(!Config::default().file_loaded);
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").expect("write config");

        let err = load_config(path.to_str()).expect_err("invalid toml");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
