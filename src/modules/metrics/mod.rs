//! Metrics collection utilities.
//!
//! Aggregates verdict counts per test type with probe latency percentiles,
//! plus release and warning tallies.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::classify::Verdict;
use crate::orchestrator::{ProbeErrorKind, TestType};

/// Per test type snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TestTypeStats {
    pub test_type: TestType,
    pub probes: u64,
    pub successes: u64,
    pub blocked: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub total_probes: u64,
    pub verdicts: BTreeMap<Verdict, u64>,
    pub warnings: BTreeMap<ProbeErrorKind, u64>,
    pub clean_releases: u64,
    pub unclean_releases: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub test_types: Vec<TestTypeStats>,
}

#[derive(Debug)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    max_window: usize,
}

impl LatencyWindow {
    fn new(max_window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn push(&mut self, latency: Duration) {
        if self.samples.len() == self.max_window {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    fn stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.samples.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.samples.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }
}

#[derive(Debug)]
struct TypeAccumulator {
    probes: u64,
    successes: u64,
    blocked: u64,
    latencies: LatencyWindow,
}

impl TypeAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            probes: 0,
            successes: 0,
            blocked: 0,
            latencies: LatencyWindow::new(max_window),
        }
    }
}

#[derive(Debug)]
struct MetricsState {
    started_at: DateTime<Utc>,
    max_window: usize,
    total_probes: u64,
    verdicts: BTreeMap<Verdict, u64>,
    warnings: BTreeMap<ProbeErrorKind, u64>,
    clean_releases: u64,
    unclean_releases: u64,
    latencies: LatencyWindow,
    types: BTreeMap<TestType, TypeAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            started_at: Utc::now(),
            max_window,
            total_probes: 0,
            verdicts: BTreeMap::new(),
            warnings: BTreeMap::new(),
            clean_releases: 0,
            unclean_releases: 0,
            latencies: LatencyWindow::new(max_window),
            types: BTreeMap::new(),
        }
    }
}

/// Thread-safe collector shared by every orchestrator of a batch.
#[derive(Clone, Debug)]
pub struct RunMetrics {
    inner: Arc<Mutex<MetricsState>>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_probe(&self, test_type: TestType, verdict: Verdict, latency: Option<Duration>) {
        let mut guard = self.state();
        guard.total_probes += 1;
        *guard.verdicts.entry(verdict).or_insert(0) += 1;
        if let Some(latency) = latency {
            guard.latencies.push(latency);
        }

        let window = guard.max_window;
        let acc = guard
            .types
            .entry(test_type)
            .or_insert_with(|| TypeAccumulator::new(window));
        acc.probes += 1;
        match verdict {
            Verdict::Success | Verdict::Partial => acc.successes += 1,
            Verdict::Blocked => acc.blocked += 1,
            Verdict::Error => {}
        }
        if let Some(latency) = latency {
            acc.latencies.push(latency);
        }
    }

    pub fn record_release(&self, clean: bool) {
        let mut guard = self.state();
        if clean {
            guard.clean_releases += 1;
        } else {
            guard.unclean_releases += 1;
        }
    }

    pub fn record_warning(&self, kind: ProbeErrorKind) {
        *self.state().warnings.entry(kind).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state();
        let (average_latency, p95_latency) = guard.latencies.stats();
        let test_types = guard
            .types
            .iter()
            .map(|(test_type, acc)| {
                let (avg, p95) = acc.latencies.stats();
                TestTypeStats {
                    test_type: *test_type,
                    probes: acc.probes,
                    successes: acc.successes,
                    blocked: acc.blocked,
                    average_latency: avg,
                    p95_latency: p95,
                }
            })
            .collect();
        MetricsSnapshot {
            started_at: guard.started_at,
            total_probes: guard.total_probes,
            verdicts: guard.verdicts.clone(),
            warnings: guard.warnings.clone(),
            clean_releases: guard.clean_releases,
            unclean_releases: guard.unclean_releases,
            average_latency,
            p95_latency,
            test_types,
        }
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_by_type_and_verdict() {
        let metrics = RunMetrics::new();
        metrics.record_probe(TestType::Vpn, Verdict::Success, Some(Duration::from_millis(150)));
        metrics.record_probe(TestType::Vpn, Verdict::Blocked, Some(Duration::from_millis(850)));
        metrics.record_probe(TestType::Direct, Verdict::Error, None);
        metrics.record_release(true);
        metrics.record_release(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_probes, 3);
        assert_eq!(snapshot.verdicts.get(&Verdict::Error), Some(&1));
        assert_eq!(snapshot.clean_releases, 1);
        assert_eq!(snapshot.unclean_releases, 1);
        assert_eq!(snapshot.p95_latency, Some(Duration::from_millis(850)));

        let vpn = snapshot
            .test_types
            .iter()
            .find(|stats| stats.test_type == TestType::Vpn)
            .unwrap();
        assert_eq!(vpn.probes, 2);
        assert_eq!(vpn.successes, 1);
        assert_eq!(vpn.blocked, 1);
        let average = vpn.average_latency.unwrap().as_millis() as i64;
        assert!((average - 500).abs() <= 1);
    }
}
