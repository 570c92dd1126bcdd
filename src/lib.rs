//! # probe-orchestrator
//!
//! Probes an anti-bot protected target under varying network identities
//! (direct, VPN tunnel, rotating SOCKS5 proxy, or both) while holding a
//! client fingerprint and cookie set fixed, and records how each combination
//! is treated.
//!
//! The crate owns the identity lifecycle, the per-scenario state machine and
//! response classification. The fingerprint emulation client and the result
//! store are collaborators behind traits.
//!
//! ## Features
//!
//! - Exclusive VPN slot allocation with a process-wide credential registry
//! - Guaranteed tunnel release on every exit path, cancellation included
//! - Least-used biased SOCKS5 endpoint selection
//! - Fixed load, acquire, request, release, persist ordering per scenario
//! - Heuristic block/partial/success classification
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use probe_orchestrator::{
//!     IdentityRegistry, MemoryStore, ProbeConfig, ReqwestFingerprintClient, TestScenario,
//!     TestType, wire,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProbeConfig::from_json_file("probe.json")?;
//!     let registry = IdentityRegistry::new();
//!     let builder = wire(
//!         &config,
//!         registry,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(ReqwestFingerprintClient::new()),
//!     )?;
//!
//!     let scenario = TestScenario::new("vpn-baseline", TestType::Vpn, 1).with_cookie_set(1);
//!     let report = builder.build(scenario).run().await;
//!     println!("{:?} -> {}", report.final_state, report.result.verdict);
//!     Ok(())
//! }
//! ```

mod orchestrator;
mod util;

pub mod classify;
pub mod config;
pub mod external_deps;
pub mod identity;
pub mod modules;
pub mod runner;
pub mod target;

pub use crate::orchestrator::{
    OrchestratorBuilder,
    ProbeErrorKind,
    ProbeFailure,
    RunReport,
    RunState,
    StateTransition,
    TestOrchestrator,
    TestResult,
    TestScenario,
    TestType,
};

pub use crate::classify::{Classification, ResponseClassifier, Verdict};

pub use crate::config::{
    ClassifierConfig,
    ConfigError,
    PoolConfig,
    ProbeConfig,
    ProbeSettings,
    ProxySelectionConfig,
    RunnerConfig,
    TunnelConfig,
};

pub use crate::identity::{
    AllocationError,
    CapacityLevel,
    HttpIdentityPool,
    IdentityPool,
    IdentityRegistry,
    IdentitySlot,
    IpEcho,
    IpEchoError,
    PoolError,
    PoolStatus,
    ProxyEndpoint,
    ProxySelector,
    ProxySource,
    ProxyVerification,
    ReqwestIpEcho,
    ServerCapacity,
    SlotDescriptor,
    SlotGrant,
    TunnelBroker,
    TunnelControl,
    TunnelControlError,
    TunnelLease,
    VerificationResult,
    WgQuickControl,
};

pub use crate::external_deps::{
    Cookie,
    CookieSet,
    FingerprintClient,
    FingerprintProfile,
    MemoryStore,
    ProbeRequest,
    ProbeResponse,
    ProbeTransportError,
    RedbStore,
    ReqwestFingerprintClient,
    ResultStore,
    StoreError,
    StoredResult,
};

pub use crate::modules::{
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    MetricsHandler,
    MetricsSnapshot,
    OrchestratorEvent,
    RunMetrics,
};

pub use crate::runner::{RunSummary, ScenarioRunner, SetupError, scenarios_from_json, wire};
pub use crate::target::{ProbeTarget, TraceIdGenerator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
