//! Cross-cutting services module
//!
//! Observes orchestration runs through events and aggregates their metrics.

pub mod events;
pub mod metrics;

// Re-export commonly used types
pub use events::{
    EventDispatcher, EventHandler, IdentityEvent, IdentityKind, LoggingHandler, MetricsHandler,
    OrchestratorEvent, ProbeEvent, ReleaseEvent, StateChangeEvent, WarningEvent,
};
pub use metrics::{MetricsSnapshot, RunMetrics, TestTypeStats};
