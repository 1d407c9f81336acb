//! Configuration for the Portico controller
//!
//! Defaults cover a standard in-cluster deployment; every field can be
//! overridden from `PORTICO_*` environment variables.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Ingress class this instance honors
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Number of reconcile workers (fixed for the process lifetime)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Plaintext listener (redirect only)
    #[serde(default = "default_http_bind_addr")]
    pub http_bind_addr: String,

    /// TLS listener (SNI-routed reverse proxy)
    #[serde(default = "default_https_bind_addr")]
    pub https_bind_addr: String,

    /// Port clients use to reach the TLS listener, used in redirect targets
    #[serde(default = "default_https_public_port")]
    pub https_public_port: u16,

    /// Addresses written to `status.loadBalancer.ingress` (IPs or hostnames)
    #[serde(default = "default_status_addresses")]
    pub status_addresses: Vec<String>,

    /// Optional Prometheus listener (disabled when unset)
    #[serde(default)]
    pub metrics_bind_addr: Option<String>,

    /// Rewrite the Host header to the backend address when forwarding
    #[serde(default)]
    pub rewrite_host: bool,

    /// Backend address cache TTL in seconds (0 disables caching)
    #[serde(default = "default_service_cache_ttl")]
    pub service_cache_ttl_secs: u64,

    /// Reconcile retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Timeout configuration
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Backoff policy for failed reconciliations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Delay before the first retry in milliseconds (default: 5ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in seconds (default: 1000s)
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Consecutive failures after which a key is dropped (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Randomize each delay by up to +/-50%
    #[serde(default)]
    pub jitter: bool,
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: default_max_attempts(),
            jitter: false,
        }
    }
}

/// Timeout configuration for reliability
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Deadline for each cluster API call in seconds (default: 10s)
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    /// TCP connection timeout to backends in seconds (default: 5s)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Backend response timeout in seconds (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long open connections may finish after shutdown (default: 30s)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_api_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            api_timeout_secs: default_api_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl TimeoutConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_ingress_class() -> String {
    "portico".to_string()
}

fn default_workers() -> usize {
    5
}

fn default_http_bind_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_https_bind_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_https_public_port() -> u16 {
    443
}

fn default_status_addresses() -> Vec<String> {
    vec!["0.0.0.0".to_string()]
}

fn default_service_cache_ttl() -> u64 {
    5
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ingress_class: default_ingress_class(),
            workers: default_workers(),
            http_bind_addr: default_http_bind_addr(),
            https_bind_addr: default_https_bind_addr(),
            https_public_port: default_https_public_port(),
            status_addresses: default_status_addresses(),
            metrics_bind_addr: None,
            rewrite_host: false,
            service_cache_ttl_secs: default_service_cache_ttl(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from `PORTICO_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Overlay values from `lookup` onto the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("PORTICO_INGRESS_CLASS") {
            config.ingress_class = val;
        }
        if let Some(val) = lookup("PORTICO_WORKERS") {
            config.workers = parse_var("PORTICO_WORKERS", &val)?;
        }
        if let Some(val) = lookup("PORTICO_HTTP_ADDR") {
            config.http_bind_addr = val;
        }
        if let Some(val) = lookup("PORTICO_HTTPS_ADDR") {
            config.https_bind_addr = val;
        }
        if let Some(val) = lookup("PORTICO_HTTPS_PUBLIC_PORT") {
            config.https_public_port = parse_var("PORTICO_HTTPS_PUBLIC_PORT", &val)?;
        }
        if let Some(val) = lookup("PORTICO_STATUS_ADDRESSES") {
            config.status_addresses = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(val) = lookup("PORTICO_METRICS_ADDR") {
            config.metrics_bind_addr = Some(val).filter(|v| !v.is_empty());
        }
        if let Some(val) = lookup("PORTICO_REWRITE_HOST") {
            config.rewrite_host = parse_var("PORTICO_REWRITE_HOST", &val)?;
        }
        if let Some(val) = lookup("PORTICO_SERVICE_CACHE_TTL_SECS") {
            config.service_cache_ttl_secs = parse_var("PORTICO_SERVICE_CACHE_TTL_SECS", &val)?;
        }
        if let Some(val) = lookup("PORTICO_RETRY_BASE_DELAY_MS") {
            config.retry.base_delay_ms = parse_var("PORTICO_RETRY_BASE_DELAY_MS", &val)?;
        }
        if let Some(val) = lookup("PORTICO_RETRY_MAX_DELAY_SECS") {
            config.retry.max_delay_secs = parse_var("PORTICO_RETRY_MAX_DELAY_SECS", &val)?;
        }
        if let Some(val) = lookup("PORTICO_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_var("PORTICO_RETRY_MAX_ATTEMPTS", &val)?;
        }
        if let Some(val) = lookup("PORTICO_RETRY_JITTER") {
            config.retry.jitter = parse_var("PORTICO_RETRY_JITTER", &val)?;
        }
        if let Some(val) = lookup("PORTICO_API_TIMEOUT_SECS") {
            config.timeouts.api_timeout_secs = parse_var("PORTICO_API_TIMEOUT_SECS", &val)?;
        }
        if let Some(val) = lookup("PORTICO_REQUEST_TIMEOUT_SECS") {
            config.timeouts.request_timeout_secs =
                parse_var("PORTICO_REQUEST_TIMEOUT_SECS", &val)?;
        }
        if let Some(val) = lookup("PORTICO_SHUTDOWN_GRACE_SECS") {
            config.timeouts.shutdown_grace_secs = parse_var("PORTICO_SHUTDOWN_GRACE_SECS", &val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the controller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                var: "PORTICO_WORKERS",
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                var: "PORTICO_RETRY_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.ingress_class.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "PORTICO_INGRESS_CLASS",
                reason: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn service_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.service_cache_ttl_secs)
    }
}

fn parse_var<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            var,
            reason: format!("'{}': {}", value, e),
        })
}
