//! Remote identity pool client.
//!
//! Talks to the VPN slot allocator (`/allocate`, `/release`, `/list`) and the
//! rotating SOCKS5 status endpoint (`/status?remain=`). Besides a short-lived
//! cache of the server list the client keeps no state.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::proxy::ProxyEndpoint;
use crate::config::PoolConfig;

/// Use count assumed for endpoints that do not report one; sorts them last.
pub const UNKNOWN_USE_COUNT: u64 = 999;

/// Errors surfaced by the pool transport.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool request failed: {0}")]
    Transport(String),
    #[error("pool response could not be decoded: {0}")]
    Decode(String),
    #[error("pool reported failure")]
    Rejected,
    #[error("pool response missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid pool url: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for PoolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PoolError::Decode(err.to_string())
        } else {
            PoolError::Transport(err.to_string())
        }
    }
}

/// One slot as handed out by the pool, before any local bring-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGrant {
    pub public_key: String,
    pub config: String,
    pub server_ip: String,
    pub internal_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapacity {
    pub server_ip: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub available_slots: u64,
    #[serde(default)]
    pub location: Option<String>,
}

/// Coarse view of remaining VPN capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLevel {
    Exhausted,
    Low,
    Healthy,
}

const LOW_CAPACITY_THRESHOLD: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub servers: Vec<ServerCapacity>,
    pub total_available: u64,
}

impl PoolStatus {
    pub fn capacity_level(&self) -> CapacityLevel {
        match self.total_available {
            0 => CapacityLevel::Exhausted,
            n if n < LOW_CAPACITY_THRESHOLD => CapacityLevel::Low,
            _ => CapacityLevel::Healthy,
        }
    }
}

/// VPN slot allocator.
#[async_trait]
pub trait IdentityPool: Send + Sync {
    /// Requests one slot. `Err(PoolError::Rejected)` means the pool had none.
    async fn allocate(&self) -> Result<SlotGrant, PoolError>;
    async fn release(&self, public_key: &str) -> Result<(), PoolError>;
    async fn list_servers(&self) -> Result<PoolStatus, PoolError>;
}

/// Source of rotating SOCKS5 endpoints.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn proxy_status(&self, min_remaining_secs: u64) -> Result<Vec<ProxyEndpoint>, PoolError>;
}

#[derive(Debug, Deserialize)]
struct AllocateBody {
    #[serde(default)]
    success: bool,
    public_key: Option<String>,
    config: Option<String>,
    server_ip: Option<String>,
    #[serde(default)]
    internal_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    available_servers: Vec<ServerCapacity>,
    #[serde(default, deserialize_with = "lenient_u64")]
    total_available: u64,
}

#[derive(Debug, Deserialize)]
struct ProxyStatusBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    proxies: Vec<RawProxy>,
}

#[derive(Debug, Deserialize)]
struct RawProxy {
    proxy: String,
    #[serde(default)]
    external_ip: Option<String>,
    #[serde(default)]
    use_count: Option<Value>,
    #[serde(default)]
    remaining_work_seconds: Option<Value>,
}

impl RawProxy {
    fn into_endpoint(self) -> ProxyEndpoint {
        ProxyEndpoint {
            address: self.proxy,
            external_ip: self.external_ip.unwrap_or_default(),
            use_count: self
                .use_count
                .as_ref()
                .and_then(value_as_u64)
                .unwrap_or(UNKNOWN_USE_COUNT),
            remaining_secs: self
                .remaining_work_seconds
                .as_ref()
                .and_then(value_as_u64)
                .unwrap_or(0),
        }
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts either a JSON number or a numeric string.
fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_as_u64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected unsigned integer, got {value}")))
}

/// Reqwest-backed client for both pool endpoints.
pub struct HttpIdentityPool {
    client: Client,
    vpn_api: String,
    proxy_status_url: String,
    release_timeout: Duration,
    list_cache_ttl: Duration,
    list_cache: Mutex<Option<(Instant, PoolStatus)>>,
}

impl HttpIdentityPool {
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        url::Url::parse(&config.vpn_api_url)
            .map_err(|err| PoolError::InvalidUrl(format!("{}: {err}", config.vpn_api_url)))?;
        url::Url::parse(&config.proxy_status_url)
            .map_err(|err| PoolError::InvalidUrl(format!("{}: {err}", config.proxy_status_url)))?;

        let client = Client::builder()
            .timeout(config.http_timeout())
            .build()?;

        Ok(Self {
            client,
            vpn_api: config.vpn_api_url.trim_end_matches('/').to_string(),
            proxy_status_url: config.proxy_status_url.clone(),
            release_timeout: config.release_timeout(),
            list_cache_ttl: config.list_cache_ttl(),
            list_cache: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.vpn_api, path)
    }

    fn cached_status(&self) -> Option<PoolStatus> {
        let guard = self.list_cache.lock().ok()?;
        guard
            .as_ref()
            .filter(|(fetched, _)| fetched.elapsed() < self.list_cache_ttl)
            .map(|(_, status)| status.clone())
    }

    fn store_status(&self, status: &PoolStatus) {
        if let Ok(mut guard) = self.list_cache.lock() {
            *guard = Some((Instant::now(), status.clone()));
        }
    }

    fn invalidate_status(&self) {
        if let Ok(mut guard) = self.list_cache.lock() {
            guard.take();
        }
    }
}

#[async_trait]
impl IdentityPool for HttpIdentityPool {
    async fn allocate(&self) -> Result<SlotGrant, PoolError> {
        let body: AllocateBody = self
            .client
            .get(self.endpoint("allocate"))
            .send()
            .await?
            .json()
            .await?;
        self.invalidate_status();

        if !body.success {
            return Err(PoolError::Rejected);
        }

        Ok(SlotGrant {
            public_key: body.public_key.ok_or(PoolError::MissingField("public_key"))?,
            config: body.config.ok_or(PoolError::MissingField("config"))?,
            server_ip: body.server_ip.ok_or(PoolError::MissingField("server_ip"))?,
            internal_ip: body.internal_ip.unwrap_or_default(),
        })
    }

    async fn release(&self, public_key: &str) -> Result<(), PoolError> {
        self.client
            .get(self.endpoint("release"))
            .query(&[("key", public_key)])
            .timeout(self.release_timeout)
            .send()
            .await?
            .error_for_status()?;
        self.invalidate_status();
        Ok(())
    }

    async fn list_servers(&self) -> Result<PoolStatus, PoolError> {
        if let Some(status) = self.cached_status() {
            return Ok(status);
        }

        let body: ListBody = self
            .client
            .get(self.endpoint("list"))
            .send()
            .await?
            .json()
            .await?;
        if !body.success {
            return Err(PoolError::Rejected);
        }

        let status = PoolStatus {
            servers: body.available_servers,
            total_available: body.total_available,
        };
        self.store_status(&status);
        Ok(status)
    }
}

#[async_trait]
impl ProxySource for HttpIdentityPool {
    async fn proxy_status(&self, min_remaining_secs: u64) -> Result<Vec<ProxyEndpoint>, PoolError> {
        let body: ProxyStatusBody = self
            .client
            .get(&self.proxy_status_url)
            .query(&[("remain", min_remaining_secs)])
            .send()
            .await?
            .json()
            .await?;

        if !body.success {
            return Err(PoolError::Rejected);
        }

        Ok(body.proxies.into_iter().map(RawProxy::into_endpoint).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_status_with_string_counters() {
        let raw = r#"{
            "success": true,
            "proxies": [
                {"proxy": "14.37.117.98:10025", "external_ip": "110.70.26.78", "use_count": 1, "remaining_work_seconds": "176"},
                {"proxy": "14.37.117.98:10026", "use_count": "3", "remaining_work_seconds": 140},
                {"proxy": "14.37.117.98:10027"}
            ]
        }"#;
        let body: ProxyStatusBody = serde_json::from_str(raw).unwrap();
        let endpoints: Vec<ProxyEndpoint> =
            body.proxies.into_iter().map(RawProxy::into_endpoint).collect();

        assert_eq!(endpoints[0].use_count, 1);
        assert_eq!(endpoints[0].remaining_secs, 176);
        assert_eq!(endpoints[0].external_ip, "110.70.26.78");
        assert_eq!(endpoints[1].use_count, 3);
        assert_eq!(endpoints[1].remaining_secs, 140);
        assert_eq!(endpoints[2].use_count, UNKNOWN_USE_COUNT);
        assert!(endpoints[2].external_ip.is_empty());
    }

    #[test]
    fn parses_server_list() {
        let raw = r#"{
            "success": true,
            "available_servers": [
                {"server_ip": "10.0.0.1", "available_slots": 3, "location": "KR"},
                {"server_ip": "10.0.0.2", "available_slots": "1"}
            ],
            "total_available": 4
        }"#;
        let body: ListBody = serde_json::from_str(raw).unwrap();
        assert!(body.success);
        assert_eq!(body.available_servers.len(), 2);
        assert_eq!(body.available_servers[1].available_slots, 1);
        assert_eq!(body.available_servers[1].location, None);

        let status = PoolStatus {
            servers: body.available_servers,
            total_available: body.total_available,
        };
        assert_eq!(status.capacity_level(), CapacityLevel::Low);
    }

    #[test]
    fn capacity_levels() {
        let status = |total| PoolStatus {
            servers: Vec::new(),
            total_available: total,
        };
        assert_eq!(status(0).capacity_level(), CapacityLevel::Exhausted);
        assert_eq!(status(4).capacity_level(), CapacityLevel::Low);
        assert_eq!(status(5).capacity_level(), CapacityLevel::Healthy);
    }

    #[test]
    fn failed_allocation_body_decodes() {
        let body: AllocateBody = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!body.success);
        assert!(body.public_key.is_none());
    }

    #[test]
    fn rejects_invalid_base_url() {
        let config = PoolConfig {
            vpn_api_url: "not a url".into(),
            ..PoolConfig::default()
        };
        assert!(matches!(
            HttpIdentityPool::new(&config),
            Err(PoolError::InvalidUrl(_))
        ));
    }
}
