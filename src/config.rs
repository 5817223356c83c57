//! Configuration module for the gateway.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 8080
//! max_connections = 30000
//! conn_id_header = "x-user-id"
//! conn_group_header = "x-user-group"
//!
//! [worker]
//! pool_size = 5
//! channel_size = 100
//!
//! [publisher]
//! brokers = "${KAFKA_BROKERS}"
//! topic_pattern = "clickstream-%s-log"
//!
//! [publisher.properties]
//! "acks" = "all"
//! ```

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::{PingerConfig, UpgraderConfig};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Server and connection settings
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Registry capacity; also sizes the pinger's work queue
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,

    /// Reject upgrades whose Origin host differs from the Host header
    #[serde(default)]
    pub check_origin: bool,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_pong_wait_interval_ms")]
    pub pong_wait_interval_ms: u64,

    #[serde(default = "default_write_wait_interval_ms")]
    pub write_wait_interval_ms: u64,

    /// Number of ping workers
    #[serde(default = "default_pinger_size")]
    pub pinger_size: usize,

    #[serde(default = "default_conn_id_header")]
    pub conn_id_header: String,

    #[serde(default = "default_conn_group_header")]
    pub conn_group_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_connections: default_max_connections(),
            write_buffer_size: default_buffer_size(),
            check_origin: false,
            ping_interval_ms: default_ping_interval_ms(),
            pong_wait_interval_ms: default_pong_wait_interval_ms(),
            write_wait_interval_ms: default_write_wait_interval_ms(),
            pinger_size: default_pinger_size(),
            conn_id_header: default_conn_id_header(),
            conn_group_header: default_conn_group_header(),
        }
    }
}

impl ServerConfig {
    pub fn upgrader(&self) -> UpgraderConfig {
        UpgraderConfig {
            pong_wait_interval: Duration::from_millis(self.pong_wait_interval_ms),
            write_wait_interval: Duration::from_millis(self.write_wait_interval_ms),
            conn_id_header: self.conn_id_header.clone(),
            conn_group_header: self.conn_group_header.clone(),
        }
    }

    pub fn pinger(&self) -> PingerConfig {
        PingerConfig {
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            write_wait_interval: Duration::from_millis(self.write_wait_interval_ms),
            workers: self.pinger_size,
            queue_size: self.max_connections,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    30000
}

fn default_buffer_size() -> usize {
    10240
}

fn default_ping_interval_ms() -> u64 {
    30000
}

fn default_pong_wait_interval_ms() -> u64 {
    60000
}

fn default_write_wait_interval_ms() -> u64 {
    5000
}

fn default_pinger_size() -> usize {
    1
}

fn default_conn_id_header() -> String {
    "x-user-id".to_string()
}

fn default_conn_group_header() -> String {
    "x-user-group".to_string()
}

/// Worker pool and hand-off channel
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Bound of the hand-off channel
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,

    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Delay between closing the listener and flushing the pool
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            channel_size: default_channel_size(),
            flush_timeout_ms: default_flush_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_pool_size() -> usize {
    5
}

fn default_channel_size() -> usize {
    100
}

fn default_flush_timeout_ms() -> u64 {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    3000
}

/// Broker connection and topic settings
#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    /// Comma-separated bootstrap servers
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Topic name pattern; `%s` is replaced by the connection group
    #[serde(default = "default_topic_pattern")]
    pub topic_pattern: String,

    #[serde(default = "default_topic_partitions")]
    pub topic_partitions: i32,

    #[serde(default = "default_topic_replication_factor")]
    pub topic_replication_factor: i32,

    #[serde(default = "default_admin_timeout_ms")]
    pub admin_timeout_ms: u64,

    /// Producer's local queue bound, in messages
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_queue_full_backoff_ms")]
    pub queue_full_backoff_ms: u64,

    /// Passed to the broker client untouched
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            topic_pattern: default_topic_pattern(),
            topic_partitions: default_topic_partitions(),
            topic_replication_factor: default_topic_replication_factor(),
            admin_timeout_ms: default_admin_timeout_ms(),
            queue_size: default_queue_size(),
            queue_full_backoff_ms: default_queue_full_backoff_ms(),
            properties: HashMap::new(),
        }
    }
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_topic_pattern() -> String {
    "clickstream-%s-log".to_string()
}

fn default_topic_partitions() -> i32 {
    3
}

fn default_topic_replication_factor() -> i32 {
    1
}

fn default_admin_timeout_ms() -> u64 {
    5000
}

fn default_queue_size() -> usize {
    100000
}

fn default_queue_full_backoff_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// How often the per-group connection gauge is refreshed
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

fn default_report_interval_ms() -> u64 {
    10000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from the default path or GATEWAY_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "config/gateway.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: GatewayConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            port = config.server.port,
            max_connections = config.server.max_connections,
            workers = config.worker.pool_size,
            topic_pattern = %config.publisher.topic_pattern,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher.brokers.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "publisher.brokers must not be empty".to_string(),
            ));
        }

        if self.publisher.brokers.contains("${") {
            warn!(
                brokers = %self.publisher.brokers,
                "Broker list contains unsubstituted environment variable"
            );
        }

        if self.publisher.topic_pattern.matches("%s").count() != 1 {
            return Err(ConfigError::ValidationError(format!(
                "publisher.topic_pattern '{}' must contain exactly one %s",
                self.publisher.topic_pattern
            )));
        }

        let sizes = [
            ("server.max_connections", self.server.max_connections),
            ("server.pinger_size", self.server.pinger_size),
            ("worker.pool_size", self.worker.pool_size),
            ("worker.channel_size", self.worker.channel_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        // periodic timers cannot tick on a zero period
        let intervals = [
            ("server.ping_interval_ms", self.server.ping_interval_ms),
            ("metrics.report_interval_ms", self.metrics.report_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.server.conn_id_header.is_empty() || self.server.conn_group_header.is_empty() {
            return Err(ConfigError::ValidationError(
                "connection identity header names must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    });

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
