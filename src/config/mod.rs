//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - JSON loading with per-field defaults
//! - Validation before any collaborator is built
//! - Duration helpers so call sites never juggle raw seconds

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Remote identity pool endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub vpn_api_url: String,
    pub proxy_status_url: String,
    pub http_timeout_secs: u64,
    pub release_timeout_secs: u64,
    pub list_cache_ttl_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            vpn_api_url: "http://127.0.0.1/vpn_api".into(),
            proxy_status_url: "http://127.0.0.1:3001/api/proxy/status".into(),
            http_timeout_secs: 10,
            release_timeout_secs: 5,
            list_cache_ttl_secs: 5,
        }
    }
}

impl PoolConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }

    pub fn list_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.list_cache_ttl_secs)
    }
}

/// Tunnel control utility and bring-up timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub control_program: String,
    pub use_sudo: bool,
    /// Fed to `sudo -S` on stdin when set.
    pub sudo_password: Option<String>,
    pub settle_delay_ms: u64,
    /// Maximum characters of utility output kept in errors.
    pub diagnostic_limit: usize,
    /// Directory for transient connection profiles; system temp dir when unset.
    pub profile_dir: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            control_program: "wg-quick".into(),
            use_sudo: true,
            sudo_password: None,
            settle_delay_ms: 2000,
            diagnostic_limit: 100,
            profile_dir: None,
        }
    }
}

impl TunnelConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySelectionConfig {
    pub min_remaining_secs: u64,
}

impl Default for ProxySelectionConfig {
    fn default() -> Self {
        Self {
            min_remaining_secs: 120,
        }
    }
}

/// Probe target and request behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub target_url: String,
    pub append_trace_id: bool,
    pub request_timeout_secs: u64,
    pub ip_echo_url: String,
    pub ip_echo_timeout_secs: u64,
    pub resolve_source_ip: bool,
    /// Characters of the error message kept on a failed result.
    pub error_message_limit: usize,
    pub preview_chars: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            target_url: "https://www.coupang.com/np/search?q=%EB%85%B8%ED%8A%B8%EB%B6%81".into(),
            append_trace_id: false,
            request_timeout_secs: 30,
            ip_echo_url: "https://api.ipify.org?format=json".into(),
            ip_echo_timeout_secs: 5,
            resolve_source_ip: true,
            error_message_limit: 200,
            preview_chars: 500,
        }
    }
}

impl ProbeSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ip_echo_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_echo_timeout_secs)
    }
}

/// Block-detection heuristic parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub min_body_bytes: usize,
    pub listing_markers: Vec<String>,
    pub product_link_pattern: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_body_bytes: 2000,
            listing_markers: vec![r#"id="product-list""#.into(), r#"id="productList""#.into()],
            product_link_pattern: "/vp/products/".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub interval_secs: u64,
    pub max_concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_concurrency: 2,
        }
    }
}

impl RunnerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub pool: PoolConfig,
    pub tunnel: TunnelConfig,
    pub proxy: ProxySelectionConfig,
    pub probe: ProbeSettings,
    pub classifier: ClassifierConfig,
    pub runner: RunnerConfig,
}

impl ProbeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ProbeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("pool.vpn_api_url", &self.pool.vpn_api_url),
            ("pool.proxy_status_url", &self.pool.proxy_status_url),
            ("probe.target_url", &self.probe.target_url),
            ("probe.ip_echo_url", &self.probe.ip_echo_url),
        ] {
            Url::parse(value).map_err(|err| invalid(field, err.to_string()))?;
        }

        if self.tunnel.control_program.trim().is_empty() {
            return Err(invalid("tunnel.control_program", "must not be empty"));
        }
        if self.probe.request_timeout_secs == 0 {
            return Err(invalid("probe.request_timeout_secs", "must be positive"));
        }
        if self.classifier.listing_markers.iter().all(|m| m.is_empty()) {
            return Err(invalid("classifier.listing_markers", "at least one marker required"));
        }
        if self.classifier.product_link_pattern.is_empty() {
            return Err(invalid("classifier.product_link_pattern", "must not be empty"));
        }
        if self.runner.max_concurrency == 0 {
            return Err(invalid("runner.max_concurrency", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProbeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.classifier.min_body_bytes, 2000);
        assert_eq!(config.proxy.min_remaining_secs, 120);
        assert_eq!(config.tunnel.settle_delay(), Duration::from_secs(2));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ProbeConfig::from_json_str(
            r#"{"pool": {"vpn_api_url": "http://10.1.1.1/vpn_api"}, "runner": {"interval_secs": 0}}"#,
        )
        .unwrap();
        assert_eq!(config.pool.vpn_api_url, "http://10.1.1.1/vpn_api");
        assert_eq!(config.pool.http_timeout_secs, 10);
        assert_eq!(config.runner.interval(), Duration::ZERO);
        assert_eq!(config.tunnel.control_program, "wg-quick");
    }

    #[test]
    fn rejects_bad_urls() {
        let err = ProbeConfig::from_json_str(r#"{"probe": {"target_url": "::nope"}}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "probe.target_url",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = ProbeConfig::default();
        config.runner.max_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
