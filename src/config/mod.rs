//! Service configuration
//!
//! Environment-driven with documented defaults. Values flow through a
//! lookup seam so tests can inject variables without touching process
//! state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::{LogFormat, LoggingConfig};
use crate::relay::{ForwardStrategy, DEFAULT_ACCEPT_TIMEOUT_MS};
use crate::store::DEFAULT_RESULT_TTL_MS;

/// Default listening port
pub const DEFAULT_PORT: u16 = 3001;

/// Default hosted workflow endpoint receiving forwarded submissions
pub const DEFAULT_PROCESSOR_URL: &str =
    "https://wgatech.app.n8n.cloud/webhook/219cc658-bea9-4cb9-b463-9ead6f8cdc21";

/// Default request body cap. Upload clients enforce their own batch limits
/// (10 files of 10 MB each); this bound sits above that ceiling.
pub const DEFAULT_MAX_BODY_BYTES: usize = 110 * 1024 * 1024;

/// Configuration error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("processor URL is not a valid http(s) URL: {0}")]
    ProcessorUrl(String),
}

/// Runtime configuration for the relay service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Listening port
    #[serde(default = "default_port")]
    pub port: u16,
    /// External processor endpoint receiving forwarded submissions
    #[serde(default = "default_processor_url")]
    pub processor_url: String,
    /// Accept window for the processor handshake, in milliseconds
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// How submissions are handed to the processor
    #[serde(default)]
    pub forward_strategy: ForwardStrategy,
    /// Upper bound on accepted request bodies, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Retention TTL for stored results in milliseconds (0 disables
    /// eviction)
    #[serde(default = "default_result_ttl_ms")]
    pub result_ttl_ms: i64,
    /// Interval between eviction sweeps, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Log filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_processor_url() -> String {
    DEFAULT_PROCESSOR_URL.to_string()
}

fn default_accept_timeout_ms() -> u64 {
    DEFAULT_ACCEPT_TIMEOUT_MS
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_result_ttl_ms() -> i64 {
    DEFAULT_RESULT_TTL_MS
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            processor_url: default_processor_url(),
            accept_timeout_ms: default_accept_timeout_ms(),
            forward_strategy: ForwardStrategy::default(),
            max_body_bytes: default_max_body_bytes(),
            result_ttl_ms: default_result_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup. Empty and
    /// whitespace-only values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(value) = get("PORT") {
            config.port = value
                .parse()
                .map_err(|_| ConfigError::Invalid { name: "PORT", value })?;
        }
        if let Some(value) = get("BIND_ADDRESS") {
            config.bind_address = value;
        }
        if let Some(value) = get("N8N_WEBHOOK_INPUT_URL") {
            config.processor_url = value;
        }
        if let Some(value) = get("ACCEPT_TIMEOUT_MS") {
            config.accept_timeout_ms = value.parse().map_err(|_| ConfigError::Invalid {
                name: "ACCEPT_TIMEOUT_MS",
                value,
            })?;
        }
        if let Some(value) = get("FORWARD_STRATEGY") {
            config.forward_strategy =
                ForwardStrategy::parse(&value).ok_or_else(|| ConfigError::Invalid {
                    name: "FORWARD_STRATEGY",
                    value,
                })?;
        }
        if let Some(value) = get("MAX_BODY_BYTES") {
            config.max_body_bytes = value.parse().map_err(|_| ConfigError::Invalid {
                name: "MAX_BODY_BYTES",
                value,
            })?;
        }
        if let Some(value) = get("RESULT_TTL_MS") {
            config.result_ttl_ms = value.parse().map_err(|_| ConfigError::Invalid {
                name: "RESULT_TTL_MS",
                value,
            })?;
        }
        if let Some(value) = get("SWEEP_INTERVAL_MS") {
            config.sweep_interval_ms = value.parse().map_err(|_| ConfigError::Invalid {
                name: "SWEEP_INTERVAL_MS",
                value,
            })?;
        }
        if let Some(value) = get("LOG_LEVEL") {
            config.log_level = value;
        }
        if let Some(value) = get("LOG_FORMAT") {
            config.log_format = LogFormat::parse(&value).ok_or_else(|| ConfigError::Invalid {
                name: "LOG_FORMAT",
                value,
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        match url::Url::parse(&self.processor_url) {
            Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {}
            _ => return Err(ConfigError::ProcessorUrl(self.processor_url.clone())),
        }
        if self.accept_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "ACCEPT_TIMEOUT_MS",
                value: "0".to_string(),
            });
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_BODY_BYTES",
                value: "0".to_string(),
            });
        }
        if self.result_ttl_ms < 0 {
            return Err(ConfigError::Invalid {
                name: "RESULT_TTL_MS",
                value: self.result_ttl_ms.to_string(),
            });
        }
        Ok(())
    }

    /// Logging settings derived from this configuration
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            log_level: self.log_level.clone(),
            format: self.log_format,
        }
    }
}
