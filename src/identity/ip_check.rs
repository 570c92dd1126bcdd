//! External IP lookups used to confirm which network identity is in effect.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpEchoError {
    #[error("ip echo request failed: {0}")]
    Transport(String),
    #[error("ip echo returned no address")]
    Empty,
}

/// Reports the public address the outside world sees for this host, optionally
/// through a proxy.
#[async_trait]
pub trait IpEcho: Send + Sync {
    async fn external_ip(&self, proxy: Option<&str>) -> Result<String, IpEchoError>;
}

/// Outcome of checking a tunnel's observed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub observed_ip: Option<String>,
    pub error: Option<String>,
    pub expected_ip: Option<String>,
    pub matches: bool,
}

impl VerificationResult {
    pub fn from_lookup(lookup: Result<String, IpEchoError>, expected_ip: Option<&str>) -> Self {
        match lookup {
            Ok(ip) => Self {
                matches: expected_ip.is_some_and(|expected| expected == ip),
                observed_ip: Some(ip),
                error: None,
                expected_ip: expected_ip.map(str::to_string),
            },
            Err(err) => Self {
                observed_ip: None,
                error: Some(err.to_string()),
                expected_ip: expected_ip.map(str::to_string),
                matches: false,
            },
        }
    }

    /// The lookup produced an address rather than an error.
    pub fn is_reachable(&self) -> bool {
        self.observed_ip.is_some()
    }
}

#[derive(Deserialize)]
struct EchoBody {
    ip: String,
}

/// Queries an echo service such as `api.ipify.org?format=json` or
/// `ifconfig.me`; both JSON `{"ip": ..}` and plain-text bodies are accepted.
pub struct ReqwestIpEcho {
    endpoint: String,
    timeout: Duration,
}

impl ReqwestIpEcho {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl IpEcho for ReqwestIpEcho {
    async fn external_ip(&self, proxy: Option<&str>) -> Result<String, IpEchoError> {
        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(proxy) = proxy {
            builder = builder
                .proxy(reqwest::Proxy::all(proxy).map_err(|err| IpEchoError::Transport(err.to_string()))?);
        }
        let client = builder
            .build()
            .map_err(|err| IpEchoError::Transport(err.to_string()))?;

        let body = client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|err| IpEchoError::Transport(err.to_string()))?
            .text()
            .await
            .map_err(|err| IpEchoError::Transport(err.to_string()))?;

        parse_echo_body(&body)
    }
}

fn parse_echo_body(body: &str) -> Result<String, IpEchoError> {
    let ip = match serde_json::from_str::<EchoBody>(body) {
        Ok(parsed) => parsed.ip,
        Err(_) => body.trim().to_string(),
    };
    if ip.is_empty() {
        Err(IpEchoError::Empty)
    } else {
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_and_plain_bodies() {
        assert_eq!(parse_echo_body(r#"{"ip":"1.2.3.4"}"#).unwrap(), "1.2.3.4");
        assert_eq!(parse_echo_body("5.6.7.8\n").unwrap(), "5.6.7.8");
        assert!(matches!(parse_echo_body("  "), Err(IpEchoError::Empty)));
    }

    #[test]
    fn verification_matches_expected() {
        let result = VerificationResult::from_lookup(Ok("1.2.3.4".into()), Some("1.2.3.4"));
        assert!(result.is_reachable());
        assert!(result.matches);

        let result = VerificationResult::from_lookup(Ok("1.2.3.4".into()), None);
        assert!(result.is_reachable());
        assert!(!result.matches);

        let result = VerificationResult::from_lookup(Err(IpEchoError::Empty), Some("1.2.3.4"));
        assert!(!result.is_reachable());
        assert!(result.error.is_some());
        assert!(!result.matches);
    }
}
