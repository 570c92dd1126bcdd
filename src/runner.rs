//! Batch execution of scenarios.
//!
//! Every scenario gets a fresh [`TestOrchestrator`](crate::TestOrchestrator)
//! and a fresh identity acquisition; nothing is retried. Concurrent batches
//! still share the process-wide credential registry, so two runs never hold
//! the same VPN slot.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::classify::Verdict;
use crate::config::{ConfigError, ProbeConfig, RunnerConfig};
use crate::external_deps::client::FingerprintClient;
use crate::external_deps::store::ResultStore;
use crate::identity::ip_check::ReqwestIpEcho;
use crate::identity::pool::{HttpIdentityPool, PoolError};
use crate::identity::proxy::ProxySelector;
use crate::identity::registry::IdentityRegistry;
use crate::identity::tunnel::{TunnelBroker, WgQuickControl};
use crate::orchestrator::{OrchestratorBuilder, RunReport, TestResult, TestScenario};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("invalid target url: {0}")]
    Target(#[from] url::ParseError),
}

/// Builds the production collaborators described by `config`: HTTP pool
/// client, `wg-quick` control, IP echo, tunnel broker and proxy selector.
/// `registry` must be the one process-wide credential registry.
pub fn wire(
    config: &ProbeConfig,
    registry: IdentityRegistry,
    store: Arc<dyn ResultStore>,
    client: Arc<dyn FingerprintClient>,
) -> Result<OrchestratorBuilder, SetupError> {
    config.validate()?;
    let pool = Arc::new(HttpIdentityPool::new(&config.pool)?);
    let echo = Arc::new(ReqwestIpEcho::new(
        config.probe.ip_echo_url.clone(),
        config.probe.ip_echo_timeout(),
    ));
    let broker = TunnelBroker::new(
        pool.clone(),
        Arc::new(WgQuickControl::new(&config.tunnel)),
        echo.clone(),
        registry,
        &config.tunnel,
    );
    let selector = Arc::new(ProxySelector::new(pool));

    Ok(OrchestratorBuilder::from_config(config, store, client)?
        .with_tunnel_broker(broker)
        .with_proxy_selector(selector)
        .with_source_ip_echo(echo))
}

/// Parses a JSON array of scenarios.
pub fn scenarios_from_json(raw: &str) -> Result<Vec<TestScenario>, ConfigError> {
    Ok(serde_json::from_str(raw)?)
}

/// Verdict tally of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub successful: usize,
    pub partial: usize,
    pub blocked: usize,
    pub errors: usize,
}

impl RunSummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a TestResult>) -> Self {
        let mut summary = Self::default();
        for result in results {
            summary.total += 1;
            match result.verdict {
                Verdict::Success => summary.successful += 1,
                Verdict::Partial => summary.partial += 1,
                Verdict::Blocked => summary.blocked += 1,
                Verdict::Error => summary.errors += 1,
            }
        }
        summary
    }

    pub fn from_reports(reports: &[RunReport]) -> Self {
        Self::from_results(reports.iter().map(|report| &report.result))
    }

    pub fn success_rate(&self) -> f64 {
        self.rate(self.successful)
    }

    pub fn block_rate(&self) -> f64 {
        self.rate(self.blocked)
    }

    fn rate(&self, count: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            count as f64 / self.total as f64
        }
    }
}

pub struct ScenarioRunner {
    builder: OrchestratorBuilder,
    interval: Duration,
    max_concurrency: usize,
}

impl ScenarioRunner {
    pub fn new(builder: OrchestratorBuilder) -> Self {
        Self::from_config(builder, &RunnerConfig::default())
    }

    pub fn from_config(builder: OrchestratorBuilder, config: &RunnerConfig) -> Self {
        Self {
            builder,
            interval: config.interval(),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// Runs scenarios one after another, pausing between them.
    pub async fn run_sequential(&self, scenarios: Vec<TestScenario>) -> Vec<RunReport> {
        let total = scenarios.len();
        let mut reports = Vec::with_capacity(total);
        for (index, scenario) in scenarios.into_iter().enumerate() {
            log::info!("running scenario {}/{}: {}", index + 1, total, scenario.name());
            reports.push(self.builder.build(scenario).run().await);
            if index + 1 < total && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
        }
        self.log_summary(&reports);
        reports
    }

    /// Runs scenarios with at most `max_concurrency` in flight. Reports come
    /// back in input order; a scenario whose task panicked is logged and
    /// omitted.
    pub async fn run_concurrent(&self, scenarios: Vec<TestScenario>) -> Vec<RunReport> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for (index, scenario) in scenarios.into_iter().enumerate() {
            let orchestrator = self.builder.build(scenario);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                (index, orchestrator.run().await)
            });
        }

        let mut indexed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => indexed.push(entry),
                Err(err) => log::error!("scenario task failed: {err}"),
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        let reports: Vec<RunReport> = indexed.into_iter().map(|(_, report)| report).collect();
        self.log_summary(&reports);
        reports
    }

    fn log_summary(&self, reports: &[RunReport]) {
        let summary = RunSummary::from_reports(reports);
        log::info!(
            "batch finished: {} total, {} successful, {} partial, {} blocked, {} errors ({:.1}% success)",
            summary.total,
            summary.successful,
            summary.partial,
            summary.blocked,
            summary.errors,
            summary.success_rate() * 100.0
        );
    }
}
