//! Response classification.
//!
//! Turns a raw probe response into a verdict with deterministic rules:
//!
//! 1. bodies shorter than the configured minimum are treated as blocked
//!    (anti-bot interstitials are small; this is an empirical cutoff and can
//!    misfire on legitimately small pages),
//! 2. a body carrying a listing marker is a success, with the product count
//!    taken from occurrences of the product link pattern,
//! 3. anything else is partial.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Success,
    Blocked,
    Partial,
    /// No response to classify; assigned by the orchestrator on failure.
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Success => "success",
            Verdict::Blocked => "blocked",
            Verdict::Partial => "partial",
            Verdict::Error => "error",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    pub status: StatusCode,
    pub response_size: usize,
    pub has_products: bool,
    pub product_count: usize,
}

impl Classification {
    pub fn is_blocked(&self) -> bool {
        self.verdict == Verdict::Blocked
    }
}

#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    min_body_bytes: usize,
    listing_markers: Vec<String>,
    product_link_pattern: String,
}

impl Default for ResponseClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

impl ResponseClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            min_body_bytes: config.min_body_bytes,
            listing_markers: config
                .listing_markers
                .iter()
                .filter(|marker| !marker.is_empty())
                .cloned()
                .collect(),
            product_link_pattern: config.product_link_pattern.clone(),
        }
    }

    pub fn min_body_bytes(&self) -> usize {
        self.min_body_bytes
    }

    /// Classifies a response. `size` is the byte length of the raw body,
    /// which may differ from `body.len()` when the body was decoded lossily.
    pub fn classify(&self, status: StatusCode, size: usize, body: &str) -> Classification {
        if size < self.min_body_bytes {
            return Classification {
                verdict: Verdict::Blocked,
                status,
                response_size: size,
                has_products: false,
                product_count: 0,
            };
        }

        let has_products = self
            .listing_markers
            .iter()
            .any(|marker| body.contains(marker.as_str()));

        if !has_products {
            return Classification {
                verdict: Verdict::Partial,
                status,
                response_size: size,
                has_products: false,
                product_count: 0,
            };
        }

        let product_count = if self.product_link_pattern.is_empty() {
            0
        } else {
            body.matches(self.product_link_pattern.as_str()).count()
        };

        Classification {
            verdict: Verdict::Success,
            status,
            response_size: size,
            has_products,
            product_count,
        }
    }

    pub fn classify_bytes(&self, status: StatusCode, body: &[u8]) -> Classification {
        self.classify(status, body.len(), &String::from_utf8_lossy(body))
    }
}
