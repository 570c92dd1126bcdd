//! Fingerprint emulation client seam.
//!
//! The orchestrator issues exactly one request per scenario through a
//! [`FingerprintClient`]. Implementations that actually impersonate a TLS
//! stack live outside this crate; [`ReqwestFingerprintClient`] sends the
//! profile's headers, cookies and proxy over a stock reqwest transport.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use reqwest::{Client, Proxy};
use thiserror::Error;
use url::Url;

use super::fingerprint::{CookieSet, FingerprintProfile};

#[derive(Debug, Error)]
pub enum ProbeTransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("proxy rejected: {0}")]
    Proxy(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProbeTransportError {
    /// Short name of the failure class, stored alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeTransportError::Timeout(_) => "Timeout",
            ProbeTransportError::Connect(_) => "ConnectError",
            ProbeTransportError::Proxy(_) => "ProxyError",
            ProbeTransportError::Request(_) => "RequestError",
            ProbeTransportError::InvalidRequest(_) => "InvalidRequest",
        }
    }
}

impl From<reqwest::Error> for ProbeTransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeTransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProbeTransportError::Connect(err.to_string())
        } else if err.is_builder() {
            ProbeTransportError::InvalidRequest(err.to_string())
        } else {
            ProbeTransportError::Request(err.to_string())
        }
    }
}

/// Everything needed to issue one probe.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub url: Url,
    pub profile: FingerprintProfile,
    pub cookies: CookieSet,
    /// `socks5://host:port` when routing through a proxy.
    pub proxy: Option<String>,
    pub timeout: Duration,
}

impl ProbeRequest {
    /// Profile headers plus the cookie header, as an `http::HeaderMap`.
    /// Entries that are not valid header names or values are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in self.profile.request_headers() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => log::warn!("skipping invalid header `{name}` on profile {}", self.profile.id),
            }
        }
        if let Some(cookie) = self.cookies.header_value() {
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    headers.insert(http::header::COOKIE, value);
                }
                Err(_) => log::warn!("cookie set {} is not a valid header value", self.cookies.id),
            }
        }
        headers
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProbeResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait FingerprintClient: Send + Sync {
    async fn execute(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeTransportError>;
}

/// Plain reqwest transport. TLS parameters of the profile are not applied;
/// only headers, user agent, cookies and proxy are honoured.
#[derive(Debug, Default, Clone)]
pub struct ReqwestFingerprintClient;

impl ReqwestFingerprintClient {
    pub fn new() -> Self {
        Self
    }

    fn build_client(&self, request: &ProbeRequest) -> Result<Client, ProbeTransportError> {
        let mut builder = Client::builder()
            .timeout(request.timeout)
            .gzip(true)
            .brotli(true)
            .user_agent(request.profile.user_agent.as_str());
        if let Some(proxy) = &request.proxy {
            let proxy = Proxy::all(proxy).map_err(|err| ProbeTransportError::Proxy(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|err| ProbeTransportError::InvalidRequest(err.to_string()))
    }
}

#[async_trait]
impl FingerprintClient for ReqwestFingerprintClient {
    async fn execute(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeTransportError> {
        log::debug!(
            "probing {} as {} (ja3 {} chars)",
            request.url,
            request.profile.device_name,
            request.profile.ja3_text.len()
        );
        let client = self.build_client(request)?;
        let response = client
            .get(request.url.as_str())
            .headers(convert_headers(&request.header_map()))
            .send()
            .await?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|err| ProbeTransportError::Request(err.to_string()))?;
        let headers = convert_back_headers(response.headers());
        let body = response.bytes().await?;

        Ok(ProbeResponse {
            status,
            headers,
            body,
        })
    }
}

fn convert_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            map.insert(name, value);
        }
    }
    map
}

fn convert_back_headers(map: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in map.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    headers
}
