//! Collaborators that live outside the orchestration core.
//!
//! This module groups the fingerprint emulation client, the client identity
//! inputs it consumes, and the persistence store.

pub mod client;
pub mod fingerprint;
pub mod store;

pub use client::{
    FingerprintClient, ProbeRequest, ProbeResponse, ProbeTransportError, ReqwestFingerprintClient,
};
pub use fingerprint::{
    Cookie, CookieSet, DEFAULT_SIGNATURE_ALGORITHMS, FingerprintProfile,
    signature_algorithms_from_json,
};
pub use store::{MemoryStore, RedbStore, ResultStore, StoreError, StoredResult};
