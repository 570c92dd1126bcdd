//! Event system for orchestration runs.
//!
//! Provides hooks for metrics, logging, and custom reactions around state
//! transitions and identity lifecycle.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::RunMetrics;
use crate::classify::Verdict;
use crate::orchestrator::{ProbeFailure, RunState, TestType};

#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub scenario: String,
    pub state: RunState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Tunnel,
    Proxy,
}

#[derive(Debug, Clone)]
pub struct IdentityEvent {
    pub scenario: String,
    pub kind: IdentityKind,
    /// Server IP for tunnels, `host:port` for proxies.
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReleaseEvent {
    pub scenario: String,
    pub clean: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProbeEvent {
    pub scenario: String,
    pub test_type: TestType,
    pub verdict: Verdict,
    pub status: Option<u16>,
    pub latency: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WarningEvent {
    pub scenario: String,
    pub failure: ProbeFailure,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged(StateChangeEvent),
    IdentityAcquired(IdentityEvent),
    IdentityReleased(ReleaseEvent),
    ProbeCompleted(ProbeEvent),
    Warning(WarningEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &OrchestratorEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Dispatcher with a [`LoggingHandler`] already registered.
    pub fn with_logging() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: OrchestratorEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::StateChanged(change) => {
                log::debug!("[{}] -> {:?}", change.scenario, change.state);
            }
            OrchestratorEvent::IdentityAcquired(identity) => {
                log::info!("[{}] acquired {:?} {}", identity.scenario, identity.kind, identity.detail);
            }
            OrchestratorEvent::IdentityReleased(release) => {
                if release.clean {
                    log::info!("[{}] identity released", release.scenario);
                } else {
                    log::warn!("[{}] identity released with errors", release.scenario);
                }
            }
            OrchestratorEvent::ProbeCompleted(probe) => {
                log::info!(
                    "[{}] {} verdict={} status={:?} ({:.2}s)",
                    probe.scenario,
                    probe.test_type,
                    probe.verdict,
                    probe.status,
                    probe.latency.map(|l| l.as_secs_f64()).unwrap_or_default()
                );
            }
            OrchestratorEvent::Warning(warning) => {
                log::warn!("[{}] {}", warning.scenario, warning.failure);
            }
        }
    }
}

/// Metrics handler that feeds the run metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: RunMetrics,
}

impl MetricsHandler {
    pub fn new(metrics: RunMetrics) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::ProbeCompleted(probe) => {
                self.metrics
                    .record_probe(probe.test_type, probe.verdict, probe.latency);
            }
            OrchestratorEvent::IdentityReleased(release) => {
                self.metrics.record_release(release.clean);
            }
            OrchestratorEvent::Warning(warning) => {
                self.metrics.record_warning(warning.failure.kind);
            }
            _ => {}
        }
    }
}
