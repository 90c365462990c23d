//! Configuration Module
//!
//! Loads the bridge descriptor from a TOML or JSON file with support for:
//! - `${VAR}` / `${VAR:-default}` substitution inside the file
//! - Environment variable overrides (`NOFP__` prefix)
//! - The field names used by older JSON descriptors (`mqtt_broker`, ...)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::protocol::QoS;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex is valid");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// Unsupported file type
    Format(String),
    /// Config crate error (parse or deserialize)
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Format(ext) => write!(f, "Unsupported config format: {}", ext),
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

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// One `(input field, output topic suffix)` conversion entry.
///
/// Accepts either a two-element array (`["voltage", "mv"]`) or a table
/// (`{ field = "voltage", suffix = "mv" }`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ParamConvRepr")]
pub struct ParamConversion {
    /// JSON field to read from inbound payloads
    pub field: String,
    /// Suffix appended to the bridge name to form the output topic
    pub suffix: String,
}

impl ParamConversion {
    pub fn new(field: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            suffix: suffix.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParamConvRepr {
    Pair(String, String),
    Table { field: String, suffix: String },
}

impl From<ParamConvRepr> for ParamConversion {
    fn from(repr: ParamConvRepr) -> Self {
        match repr {
            ParamConvRepr::Pair(field, suffix) | ParamConvRepr::Table { field, suffix } => {
                ParamConversion { field, suffix }
            }
        }
    }
}

/// Bridge configuration, loaded once at startup and read-only afterwards
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Bridge name, also the prefix of every output topic
    pub name: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Broker host name or address
    #[serde(alias = "mqtt_broker")]
    pub broker: String,

    /// Broker port
    #[serde(default = "default_port", alias = "mqtt_port")]
    pub port: u16,

    /// Connect timeout in seconds, also the default keep-alive
    #[serde(default = "default_timeout", alias = "mqtt_timeout", alias = "connect_timeout")]
    pub timeout: u64,

    /// Topic carrying the JSON telemetry
    pub topic: String,

    /// Ordered conversion table
    #[serde(default)]
    pub param_conv: Vec<ParamConversion>,

    /// Ceiling for reconnects after an unexpected disconnect
    #[serde(default = "default_ceiling", alias = "mqtt_max_reconnects")]
    pub max_reconnects: u32,

    /// Ceiling for connection attempts at startup
    #[serde(default = "default_ceiling", alias = "mqtt_max_startup")]
    pub max_startup: u32,

    /// Ceiling for consecutive failed ticks in the steady-state loop
    #[serde(default = "default_ceiling", alias = "mqtt_max_loop_reconnect")]
    pub max_loop_reconnect: u32,

    /// Log level: debug, info, warning, error, critical (any case)
    #[serde(default, alias = "loglevel")]
    pub log_level: Option<String>,

    /// Client ID presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive in seconds (defaults to `timeout`)
    #[serde(default)]
    pub keep_alive: Option<u16>,

    /// Use a clean session on every connect
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// QoS for the subscription and for converted publications (0 or 1)
    #[serde(default)]
    pub qos: u8,

    /// Retain flag on converted publications
    #[serde(default)]
    pub retain: bool,

    /// Fixed wait between failed connection attempts
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Upper bound on the duration of one network tick
    #[serde(default = "default_loop_timeout", with = "humantime_serde")]
    pub loop_timeout: Duration,
}

fn default_port() -> u16 {
    1883
}

fn default_timeout() -> u64 {
    60
}

fn default_ceiling() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_client_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("nofp-bridge-{}-{}", host, std::process::id())
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_loop_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "nofp".to_string(),
            description: String::new(),
            broker: "localhost".to_string(),
            port: default_port(),
            timeout: default_timeout(),
            topic: "nofp".to_string(),
            param_conv: Vec::new(),
            max_reconnects: default_ceiling(),
            max_startup: default_ceiling(),
            max_loop_reconnect: default_ceiling(),
            log_level: None,
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive: None,
            clean_session: true,
            qos: 0,
            retain: false,
            retry_backoff: default_retry_backoff(),
            loop_timeout: default_loop_timeout(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML or JSON file with environment
    /// variable overrides.
    ///
    /// The format follows the file extension (`.json`, anything else is
    /// TOML). Top-level keys can be overridden with `NOFP__<KEY>`, e.g.
    /// `NOFP__BROKER=10.0.0.5` or `NOFP__MAX_STARTUP=3`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => FileFormat::Json,
            Some("toml") | None => FileFormat::Toml,
            Some(other) => return Err(ConfigError::Format(other.to_string())),
        };

        let content = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&content);

        let cfg = config::Config::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(
                Environment::with_prefix("NOFP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BridgeConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_format(content, FileFormat::Toml)
    }

    /// Parse a JSON configuration from a string (no env var support)
    pub fn parse_json(content: &str) -> Result<Self, ConfigError> {
        Self::parse_format(content, FileFormat::Json)
    }

    fn parse_format(content: &str, format: FileFormat) -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(File::from_str(content, format))
            .build()?;
        let config: BridgeConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the structural parts of the configuration.
    ///
    /// Retry ceilings are left to the supervisor, which rejects a zero
    /// ceiling when a run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation("name must not be empty".to_string()));
        }
        if self.broker.is_empty() {
            return Err(ConfigError::Validation(
                "broker must not be empty".to_string(),
            ));
        }
        if self.topic.is_empty() {
            return Err(ConfigError::Validation("topic must not be empty".to_string()));
        }
        if self.qos > 1 {
            return Err(ConfigError::Validation("qos must be 0 or 1".to_string()));
        }
        if self.loop_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "loop_timeout must be greater than zero".to_string(),
            ));
        }
        for conv in &self.param_conv {
            if conv.field.is_empty() || conv.suffix.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "param_conv entry {:?} must have a field and a suffix",
                    conv
                )));
            }
            if conv.suffix.contains(['+', '#']) {
                return Err(ConfigError::Validation(format!(
                    "param_conv suffix '{}' must not contain wildcards",
                    conv.suffix
                )));
            }
        }
        Ok(())
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Keep-alive interval sent in CONNECT
    pub fn keep_alive_secs(&self) -> u16 {
        self.keep_alive
            .unwrap_or_else(|| u16::try_from(self.timeout).unwrap_or(u16::MAX))
    }

    /// QoS used for the subscription and publications
    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or_default()
    }
}
