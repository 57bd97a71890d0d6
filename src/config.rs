//! Configuration for the ingest server and worker.
//!
//! Loaded once at startup from a TOML file with `${VAR}` substitution, then
//! passed by reference into each component.
//!
//! # Example
//!
//! ```toml
//! [broker]
//! url = "${REDIS_URL}"
//! stream_name = "telemetry_stream"
//! dlq_stream_name = "telemetry_dlq"
//!
//! [processor]
//! vibration_threshold = 22.0
//! physical_ceiling = 500.0
//! retry_limit = 3
//!
//! [governance]
//! allowed_types = ["VIBRATION", "TEMPERATURE"]
//! ```

use regex::{Captures, Regex};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dlq::DEFAULT_DLQ_STREAM;
use crate::stream::validate_key;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "TELEMETRY_CONFIG";

/// Environment variable that overrides `broker.url`.
pub const BROKER_URL_ENV: &str = "REDIS_URL";

const DEFAULT_CONFIG_PATH: &str = "config/telemetry.toml";

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
pub struct PipelineConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub governance: GovernanceConfig,
}

/// Broker connection and stream names
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,

    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    #[serde(default = "default_dlq_stream_name")]
    pub dlq_stream_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            stream_name: default_stream_name(),
            dlq_stream_name: default_dlq_stream_name(),
        }
    }
}

fn default_broker_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_stream_name() -> String {
    "telemetry_stream".to_string()
}

fn default_dlq_stream_name() -> String {
    DEFAULT_DLQ_STREAM.to_string()
}

/// Ingest server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on `/ingest` when set
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    8000
}

/// Worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    /// Consumer name within the group; derived from the hostname when unset
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_vibration_threshold")]
    pub vibration_threshold: f64,

    #[serde(default = "default_physical_ceiling")]
    pub physical_ceiling: f64,

    #[serde(default = "default_retry_limit")]
    pub retry_limit: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_read_block_ms")]
    pub read_block_ms: u64,

    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,

    #[serde(default = "default_reclaim_interval_ms")]
    pub reclaim_interval_ms: u64,

    #[serde(default = "default_broker_retry_backoff_ms")]
    pub broker_retry_backoff_ms: u64,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: None,
            consumer_group: default_consumer_group(),
            vibration_threshold: default_vibration_threshold(),
            physical_ceiling: default_physical_ceiling(),
            retry_limit: default_retry_limit(),
            batch_size: default_batch_size(),
            read_block_ms: default_read_block_ms(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
            broker_retry_backoff_ms: default_broker_retry_backoff_ms(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl ProcessorConfig {
    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    pub fn broker_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.broker_retry_backoff_ms)
    }
}

fn default_consumer_group() -> String {
    "telemetry_workers".to_string()
}

fn default_vibration_threshold() -> f64 {
    22.0
}

fn default_physical_ceiling() -> f64 {
    500.0
}

fn default_retry_limit() -> u64 {
    3
}

fn default_batch_size() -> usize {
    10
}

fn default_read_block_ms() -> u64 {
    1000
}

fn default_visibility_timeout_ms() -> u64 {
    30_000
}

fn default_reclaim_interval_ms() -> u64 {
    5000
}

fn default_broker_retry_backoff_ms() -> u64 {
    1000
}

fn default_metrics_port() -> u16 {
    8001
}

/// Schema governance
#[derive(Debug, Deserialize, Clone)]
pub struct GovernanceConfig {
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            allowed_types: default_allowed_types(),
        }
    }
}

fn default_allowed_types() -> Vec<String> {
    vec!["VIBRATION".to_string(), "TEMPERATURE".to_string()]
}

impl PipelineConfig {
    /// Load configuration from `TELEMETRY_CONFIG` or the default path, apply
    /// environment overrides, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let config = Self::read(&config_path)?;
        config.with_overrides(env::var(BROKER_URL_ENV).ok())
    }

    /// Load and validate configuration from a specific path. A missing file
    /// yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config = Self::from_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
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
        let config = Self::from_toml(&content)?;

        info!(
            stream = %config.broker.stream_name,
            dlq_stream = %config.broker.dlq_stream_name,
            consumer_group = %config.processor.consumer_group,
            allowed_types = ?config.governance.allowed_types,
            "Configuration loaded"
        );

        Ok(config)
    }

    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        Ok(toml::from_str(&content)?)
    }

    /// Overrides first, validation once on the result.
    fn with_overrides(mut self, broker_url: Option<String>) -> Result<Self, ConfigError> {
        self.override_broker_url(broker_url);
        self.validate()?;
        Ok(self)
    }

    /// `REDIS_URL` takes precedence over the configured broker URL.
    fn override_broker_url(&mut self, url: Option<String>) {
        if let Some(url) = url.filter(|u| !u.is_empty()) {
            debug!("Broker URL overridden from environment");
            self.broker.url = url;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        for (label, name) in [
            ("broker.stream_name", &self.broker.stream_name),
            ("broker.dlq_stream_name", &self.broker.dlq_stream_name),
            ("processor.consumer_group", &self.processor.consumer_group),
        ] {
            if let Err(reason) = validate_key(name) {
                return invalid(format!("{} is invalid: {}", label, reason));
            }
        }

        if self.broker.stream_name == self.broker.dlq_stream_name {
            return invalid("broker.dlq_stream_name must differ from broker.stream_name".to_string());
        }

        if self.broker.url.contains("${") {
            warn!(
                url = %self.broker.url,
                "Broker URL contains unsubstituted environment variable"
            );
        } else if !self.broker.url.starts_with("redis://") && !self.broker.url.starts_with("rediss://")
        {
            return invalid("broker.url must start with redis:// or rediss://".to_string());
        }

        let p = &self.processor;
        if !p.vibration_threshold.is_finite() || !p.physical_ceiling.is_finite() {
            return invalid("processor thresholds must be finite".to_string());
        }
        if p.physical_ceiling <= p.vibration_threshold {
            return invalid(format!(
                "processor.physical_ceiling ({}) must be above processor.vibration_threshold ({})",
                p.physical_ceiling, p.vibration_threshold
            ));
        }
        if p.batch_size == 0 {
            return invalid("processor.batch_size must be at least 1".to_string());
        }
        if p.read_block_ms == 0 {
            return invalid("processor.read_block_ms must be at least 1".to_string());
        }
        if p.reclaim_interval_ms == 0 {
            return invalid("processor.reclaim_interval_ms must be at least 1".to_string());
        }

        if self.governance.allowed_types.is_empty() {
            return invalid("governance.allowed_types must not be empty".to_string());
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
    else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &Captures| {
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
