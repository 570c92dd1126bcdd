//! Rotating SOCKS5 endpoint selection.
//!
//! Endpoints are shared: several callers may pick the same one at once and the
//! use count is informational only, so the selector never locks anything. It
//! biases towards lightly used exits by picking at random from the less-used
//! half of the fetched set.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;

use super::ip_check::IpEcho;
use super::pool::ProxySource;

/// One rotating SOCKS5 exit as reported by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// `host:port` of the SOCKS5 listener.
    pub address: String,
    pub external_ip: String,
    pub use_count: u64,
    pub remaining_secs: u64,
}

impl ProxyEndpoint {
    pub fn socks5_uri(&self) -> String {
        format!("socks5://{}", self.address)
    }
}

/// Result of routing an IP lookup through an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyVerification {
    pub proxy: String,
    pub expected_ip: String,
    pub actual_ip: Option<String>,
    pub working: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct ProxySnapshot {
    fetched_at: DateTime<Utc>,
    endpoints: Vec<ProxyEndpoint>,
}

/// Picks SOCKS5 endpoints from a [`ProxySource`].
pub struct ProxySelector {
    source: Arc<dyn ProxySource>,
    last_fetch: Mutex<Option<ProxySnapshot>>,
}

impl ProxySelector {
    pub fn new(source: Arc<dyn ProxySource>) -> Self {
        Self {
            source,
            last_fetch: Mutex::new(None),
        }
    }

    /// Endpoints with at least `min_remaining_secs` of validity left. Transport
    /// failures are logged and yield an empty list.
    pub async fn fetch(&self, min_remaining_secs: u64) -> Vec<ProxyEndpoint> {
        match self.source.proxy_status(min_remaining_secs).await {
            Ok(mut endpoints) => {
                // Sources that omit the remaining time report 0 and must not slip through.
                endpoints.retain(|endpoint| endpoint.remaining_secs >= min_remaining_secs);
                if let Ok(mut guard) = self.last_fetch.lock() {
                    *guard = Some(ProxySnapshot {
                        fetched_at: Utc::now(),
                        endpoints: endpoints.clone(),
                    });
                }
                endpoints
            }
            Err(err) => {
                log::warn!("proxy status lookup failed: {err}");
                Vec::new()
            }
        }
    }

    pub async fn pick_random_least_used(&self, min_remaining_secs: u64) -> Option<ProxyEndpoint> {
        let endpoints = self.fetch(min_remaining_secs).await;
        select_random_least_used(endpoints, &mut rand::thread_rng())
    }

    pub async fn pick_least_used(&self, min_remaining_secs: u64) -> Option<ProxyEndpoint> {
        let endpoints = self.fetch(min_remaining_secs).await;
        select_least_used(endpoints)
    }

    /// Endpoints whose remaining validity lies in `[min, max]`.
    pub async fn within_remaining(
        &self,
        min_remaining_secs: u64,
        max_remaining_secs: Option<u64>,
    ) -> Vec<ProxyEndpoint> {
        let mut endpoints = self.fetch(min_remaining_secs).await;
        if let Some(max) = max_remaining_secs {
            endpoints.retain(|endpoint| endpoint.remaining_secs <= max);
        }
        endpoints
    }

    /// Number of endpoints per use count.
    pub async fn usage_distribution(&self, min_remaining_secs: u64) -> BTreeMap<u64, usize> {
        let mut buckets = BTreeMap::new();
        for endpoint in self.fetch(min_remaining_secs).await {
            *buckets.entry(endpoint.use_count).or_insert(0) += 1;
        }
        buckets
    }

    /// Endpoints from the most recent successful fetch and when it happened.
    pub fn last_fetch(&self) -> Option<(DateTime<Utc>, Vec<ProxyEndpoint>)> {
        let guard = self.last_fetch.lock().ok()?;
        guard
            .as_ref()
            .map(|snapshot| (snapshot.fetched_at, snapshot.endpoints.clone()))
    }

    pub async fn verify(&self, endpoint: &ProxyEndpoint, echo: &dyn IpEcho) -> ProxyVerification {
        let lookup = echo.external_ip(Some(&endpoint.socks5_uri())).await;
        match lookup {
            Ok(actual) => ProxyVerification {
                proxy: endpoint.address.clone(),
                expected_ip: endpoint.external_ip.clone(),
                working: actual == endpoint.external_ip,
                actual_ip: Some(actual),
                error: None,
            },
            Err(err) => ProxyVerification {
                proxy: endpoint.address.clone(),
                expected_ip: endpoint.external_ip.clone(),
                actual_ip: None,
                working: false,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Stable ascending sort by use count, truncated to the lower half (never
/// fewer than one element when the input is non-empty).
pub fn less_used_half(mut endpoints: Vec<ProxyEndpoint>) -> Vec<ProxyEndpoint> {
    endpoints.sort_by_key(|endpoint| endpoint.use_count);
    let keep = (endpoints.len() / 2).max(1);
    endpoints.truncate(keep);
    endpoints
}

pub fn select_random_least_used<R: Rng + ?Sized>(
    endpoints: Vec<ProxyEndpoint>,
    rng: &mut R,
) -> Option<ProxyEndpoint> {
    if endpoints.is_empty() {
        return None;
    }
    less_used_half(endpoints).choose(rng).cloned()
}

/// Strict minimum by use count; ties go to the first endpoint encountered.
pub fn select_least_used(endpoints: Vec<ProxyEndpoint>) -> Option<ProxyEndpoint> {
    endpoints
        .into_iter()
        .enumerate()
        .min_by_key(|(index, endpoint)| (endpoint.use_count, *index))
        .map(|(_, endpoint)| endpoint)
}
