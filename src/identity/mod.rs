//! Network identity acquisition.
//!
//! Two kinds of identity are handed out here: exclusive VPN slots managed by
//! the [`TunnelBroker`], and shared SOCKS5 exits chosen by the
//! [`ProxySelector`]. The pool client and IP echo sit underneath both.

pub mod ip_check;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod tunnel;

pub use ip_check::{IpEcho, IpEchoError, ReqwestIpEcho, VerificationResult};
pub use pool::{
    CapacityLevel, HttpIdentityPool, IdentityPool, PoolError, PoolStatus, ProxySource,
    ServerCapacity, SlotGrant, UNKNOWN_USE_COUNT,
};
pub use proxy::{ProxyEndpoint, ProxySelector, ProxyVerification};
pub use registry::IdentityRegistry;
pub use tunnel::{
    AllocationError, IdentitySlot, SlotDescriptor, TunnelBroker, TunnelControl,
    TunnelControlError, TunnelLease, WgQuickControl,
};
