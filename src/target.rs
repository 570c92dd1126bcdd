//! Probe target URL and trace id stamping.
//!
//! Trace ids are the current Unix time in milliseconds rendered in lowercase
//! base36, which is eight characters for any date between 1973 and 2059.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::config::ProbeSettings;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

static TRACE_ID_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-z]{1,13}$").expect("valid trace id regex"));

#[derive(Debug, Clone, Copy, Default)]
pub struct TraceIdGenerator;

impl TraceIdGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self) -> String {
        self.generate_at(Utc::now())
    }

    pub fn generate_at(&self, at: DateTime<Utc>) -> String {
        encode_base36(at.timestamp_millis().max(0) as u64)
    }

    /// Millisecond timestamp encoded in `trace_id`, if it is well formed.
    pub fn decode(&self, trace_id: &str) -> Option<u64> {
        if !TRACE_ID_SHAPE.is_match(trace_id) {
            return None;
        }
        trace_id.chars().try_fold(0u64, |acc, ch| {
            let digit = ch.to_digit(36)? as u64;
            acc.checked_mul(36)?.checked_add(digit)
        })
    }

    /// Time the id was generated, if it decodes to a representable instant.
    pub fn verify(&self, trace_id: &str) -> Option<DateTime<Utc>> {
        let millis = i64::try_from(self.decode(trace_id)?).ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}

fn encode_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// URL a scenario probes, optionally stamped with a fresh trace id.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    base: Url,
    append_trace_id: bool,
    generator: TraceIdGenerator,
}

impl ProbeTarget {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            append_trace_id: false,
            generator: TraceIdGenerator::new(),
        }
    }

    pub fn from_settings(settings: &ProbeSettings) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(&settings.target_url)?).with_trace_id(settings.append_trace_id))
    }

    pub fn with_trace_id(mut self, enabled: bool) -> Self {
        self.append_trace_id = enabled;
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// URL for one run and the trace id appended to it, if any.
    pub fn resolve(&self) -> (Url, Option<String>) {
        if !self.append_trace_id {
            return (self.base.clone(), None);
        }
        let trace_id = self.generator.generate();
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("traceId", &trace_id)
            .append_pair("channel", "user");
        (url, Some(trace_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_timestamp() {
        let generator = TraceIdGenerator::new();
        let at = Utc.timestamp_millis_opt(1_731_337_200_000).single().unwrap();
        assert_eq!(generator.generate_at(at), "m3d5gtc0");
        assert_eq!(generator.decode("m3d5gtc0"), Some(1_731_337_200_000));
        assert_eq!(generator.verify("m3d5gtc0"), Some(at));
    }

    #[test]
    fn small_values() {
        assert_eq!(encode_base36(0), "0");
        assert_eq!(encode_base36(35), "z");
        assert_eq!(encode_base36(36), "10");
    }

    #[test]
    fn rejects_malformed_ids() {
        let generator = TraceIdGenerator::new();
        assert_eq!(generator.decode("ABC"), None);
        assert_eq!(generator.decode(""), None);
        assert_eq!(generator.decode("m3d5-tc0"), None);
        assert_eq!(generator.verify("zzzzzzzzzzzzz"), None);
    }

    #[test]
    fn generated_ids_are_eight_chars_and_fresh() {
        let generator = TraceIdGenerator::new();
        let id = generator.generate();
        assert_eq!(id.len(), 8);
        let decoded = generator.verify(&id).unwrap();
        assert!((Utc::now() - decoded).num_seconds().abs() < 5);
    }

    #[test]
    fn target_appends_trace_parameters() {
        let base = Url::parse("https://www.coupang.com/np/search?q=%EB%85%B8%ED%8A%B8%EB%B6%81").unwrap();
        let (plain, none) = ProbeTarget::new(base.clone()).resolve();
        assert_eq!(plain, base);
        assert!(none.is_none());

        let (stamped, trace_id) = ProbeTarget::new(base).with_trace_id(true).resolve();
        let trace_id = trace_id.unwrap();
        let pairs: Vec<(String, String)> = stamped.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("q".to_string(), "노트북".to_string()));
        assert_eq!(pairs[1], ("traceId".to_string(), trace_id));
        assert_eq!(pairs[2], ("channel".to_string(), "user".to_string()));
    }
}
