//! Credential deduplication registry.
//!
//! A mutex-guarded set of VPN credentials currently held by this process.
//! One registry is created at start-up and cloned into every
//! [`TunnelBroker`](super::tunnel::TunnelBroker); clones share the same set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-safe set of credentials that are allocated and not yet released.
#[derive(Clone, Debug, Default)]
pub struct IdentityRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the set half-updated, so a
    // poisoned mutex is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically inserts the credential. Returns `false` when it was already
    /// present, in which case the registry is left untouched.
    pub fn try_claim(&self, credential: &str) -> bool {
        self.lock().insert(credential.to_string())
    }

    pub fn contains(&self, credential: &str) -> bool {
        self.lock().contains(credential)
    }

    /// Removes the credential, returning whether it was present.
    pub fn remove(&self, credential: &str) -> bool {
        self.lock().remove(credential)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().iter().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_until_removed() {
        let registry = IdentityRegistry::new();
        assert!(registry.try_claim("key-a"));
        assert!(!registry.try_claim("key-a"));
        assert!(registry.contains("key-a"));

        assert!(registry.remove("key-a"));
        assert!(!registry.remove("key-a"));
        assert!(registry.try_claim("key-a"));
    }

    #[test]
    fn clones_share_membership() {
        let registry = IdentityRegistry::new();
        let other = registry.clone();
        registry.try_claim("shared");
        assert!(other.contains("shared"));
        assert_eq!(other.len(), 1);
        other.remove("shared");
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_claims_admit_exactly_one_winner() {
        let registry = IdentityRegistry::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.try_claim("contended"))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
