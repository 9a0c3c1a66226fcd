// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::buffer::{BufferConfig, DEFAULT_LIMIT_BYTES};
use crate::dispatcher::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::errors::ConfigError;

pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 3000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Configuration for the relay (collector endpoint, batching and retries)
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Collector write key, sent as the Basic auth user name
    pub write_key: String,
    /// Full URL batches are POSTed to
    pub data_plane_url: String,
    /// Buffered bytes that trigger an immediate flush
    pub buffer_limit_bytes: usize,
    pub flush_interval_secs: u64,
    /// Delivery attempts before a batch is abandoned
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// JSON mapping rules replacing the built-in tables
    pub rules_path: Option<PathBuf>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            write_key: String::new(),
            data_plane_url: String::new(),
            buffer_limit_bytes: DEFAULT_LIMIT_BYTES,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            rules_path: None,
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl RelayConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let write_key =
            env::var("RELAY_WRITE_KEY").map_err(|_| ConfigError::Missing("RELAY_WRITE_KEY"))?;
        let data_plane_url = env::var("RELAY_DATA_PLANE_URL")
            .map_err(|_| ConfigError::Missing("RELAY_DATA_PLANE_URL"))?;
        let defaults = Self::default();

        let config = Self {
            write_key,
            data_plane_url,
            buffer_limit_bytes: parse_env("RELAY_BUFFER_LIMIT_BYTES")
                .unwrap_or(defaults.buffer_limit_bytes),
            flush_interval_secs: parse_env("RELAY_FLUSH_INTERVAL_SECS")
                .unwrap_or(defaults.flush_interval_secs),
            max_attempts: parse_env("RELAY_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            retry_base_delay_ms: parse_env("RELAY_RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.retry_base_delay_ms),
            request_timeout_secs: parse_env("RELAY_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout_secs),
            rules_path: env::var_os("RELAY_RULES_PATH").map(PathBuf::from),
            https_proxy: env::var("RELAY_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            log_level: env::var("RELAY_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "RELAY_WRITE_KEY cannot be empty".to_string(),
            ));
        }

        let url = self.data_plane_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "Data plane URL '{}' must start with http:// or https://",
                self.data_plane_url
            )));
        }

        if self.buffer_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "Buffer limit must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "Flush interval must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            limit_bytes: self.buffer_limit_bytes,
            flush_interval: Duration::from_secs(self.flush_interval_secs),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_attempts: self.max_attempts,
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
