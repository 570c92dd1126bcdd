//! Client identity inputs: fingerprint profiles and stored cookie sets.
//!
//! Both are read-only for the orchestrator. They are loaded once per scenario
//! before any network identity is acquired.

use serde::{Deserialize, Serialize};

/// Signature algorithms offered when a profile does not record its own.
pub const DEFAULT_SIGNATURE_ALGORITHMS: [&str; 10] = [
    "ecdsa_secp256r1_sha256",
    "rsa_pss_rsae_sha256",
    "rsa_pkcs1_sha256",
    "ecdsa_secp384r1_sha384",
    "ecdsa_sha1",
    "rsa_pss_rsae_sha384",
    "rsa_pkcs1_sha384",
    "rsa_pss_rsae_sha512",
    "rsa_pkcs1_sha512",
    "rsa_pkcs1_sha1",
];

const DEFAULT_HEADERS: [(&str, &str); 7] = [
    ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    ("Sec-Fetch-Site", "same-origin"),
    ("Sec-Fetch-Dest", "document"),
    ("Accept-Language", "ko-KR,ko;q=0.9"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Referer", "https://www.coupang.com/"),
    ("Accept-Encoding", "gzip, deflate, br"),
];

/// TLS and HTTP client-identity parameters captured from a real device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintProfile {
    pub id: u64,
    pub device_name: String,
    pub ja3_text: String,
    #[serde(default)]
    pub akamai_text: Option<String>,
    pub user_agent: String,
    #[serde(default)]
    pub signature_algorithms: Vec<String>,
    /// Ordered request headers; empty means the default navigation set.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl FingerprintProfile {
    pub fn new(
        id: u64,
        device_name: impl Into<String>,
        ja3_text: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            id,
            device_name: device_name.into(),
            ja3_text: ja3_text.into(),
            akamai_text: None,
            user_agent: user_agent.into(),
            signature_algorithms: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_akamai(mut self, akamai_text: impl Into<String>) -> Self {
        self.akamai_text = Some(akamai_text.into());
        self
    }

    pub fn with_signature_algorithms(mut self, algorithms: Vec<String>) -> Self {
        self.signature_algorithms = algorithms;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn effective_signature_algorithms(&self) -> Vec<String> {
        if self.signature_algorithms.is_empty() {
            DEFAULT_SIGNATURE_ALGORITHMS
                .iter()
                .map(|alg| alg.to_string())
                .collect()
        } else {
            self.signature_algorithms.clone()
        }
    }

    /// Headers to send, in order. The profile's user agent always wins over a
    /// stored `User-Agent` header.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = if self.headers.is_empty() {
            DEFAULT_HEADERS
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect()
        } else {
            self.headers.clone()
        };

        if self.user_agent.is_empty() {
            return headers;
        }
        match headers
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
        {
            Some(entry) => entry.1 = self.user_agent.clone(),
            None => headers.push(("User-Agent".to_string(), self.user_agent.clone())),
        }
        headers
    }
}

/// Parses the stored JSON array form of a signature algorithm list. Anything
/// unparseable yields an empty list, which later falls back to the defaults.
pub fn signature_algorithms_from_json(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    serde_json::from_str(raw).unwrap_or_else(|err| {
        log::debug!("ignoring malformed signature algorithm list: {err}");
        Vec::new()
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Named cookie jar captured from a browser session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieSet {
    pub id: u64,
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub usage_count: u64,
}

impl CookieSet {
    pub fn new(id: u64, cookies: Vec<Cookie>) -> Self {
        Self {
            id,
            cookies,
            usage_count: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    /// Parses the stored `[{"name": .., "value": ..}, ..]` form.
    pub fn from_json_list(id: u64, raw: &str) -> Result<Self, serde_json::Error> {
        let cookies: Vec<Cookie> = serde_json::from_str(raw)?;
        Ok(Self::new(id, cookies))
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// `Cookie` header value, or `None` when there are no cookies.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_empty_profile() {
        let profile = FingerprintProfile::new(1, "Galaxy S23", "771,4865-4866", "Mozilla/5.0 test");
        assert_eq!(profile.effective_signature_algorithms().len(), 10);

        let headers = profile.request_headers();
        assert!(headers.iter().any(|(n, v)| n == "Accept-Language" && v == "ko-KR,ko;q=0.9"));
        assert_eq!(
            headers.iter().find(|(n, _)| n == "User-Agent").map(|(_, v)| v.as_str()),
            Some("Mozilla/5.0 test")
        );
    }

    #[test]
    fn user_agent_overrides_stored_header() {
        let profile = FingerprintProfile::new(2, "iPhone", "771", "UA-real")
            .with_header("user-agent", "UA-stale")
            .with_header("Accept", "*/*");
        let headers = profile.request_headers();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("user-agent".to_string(), "UA-real".to_string()));
    }

    #[test]
    fn stored_algorithms_are_lenient() {
        assert_eq!(
            signature_algorithms_from_json(r#"["rsa_pkcs1_sha256"]"#),
            vec!["rsa_pkcs1_sha256".to_string()]
        );
        assert!(signature_algorithms_from_json("not json").is_empty());
        assert!(signature_algorithms_from_json("  ").is_empty());
    }

    #[test]
    fn cookie_list_round_trips_to_header() {
        let set = CookieSet::from_json_list(
            7,
            r#"[{"name": "PCID", "value": "123"}, {"name": "sid", "value": "abc"}]"#,
        )
        .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.header_value().as_deref(), Some("PCID=123; sid=abc"));
        assert_eq!(CookieSet::empty().header_value(), None);
        assert!(CookieSet::from_json_list(1, "{}").is_err());
    }
}
