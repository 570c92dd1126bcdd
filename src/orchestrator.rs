//! Per-scenario orchestration.
//!
//! A [`TestOrchestrator`] runs exactly one [`TestScenario`] through a fixed
//! sequence of states:
//!
//! `DataLoading -> IdentityAcquiring -> Requesting -> Classifying ->
//! IdentityReleasing -> Persisted`
//!
//! `Failed` may be entered from any state. Release and persistence still run
//! afterwards, so every run yields exactly one persisted [`TestResult`]. Data is
//! loaded before any identity is acquired and the result is stored only after
//! the identity is released; a tunnel is never open during store I/O.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::{ResponseClassifier, Verdict};
use crate::config::{ProbeConfig, ProbeSettings};
use crate::external_deps::client::{FingerprintClient, ProbeRequest, ProbeResponse};
use crate::external_deps::fingerprint::{CookieSet, FingerprintProfile};
use crate::external_deps::store::ResultStore;
use crate::identity::ip_check::IpEcho;
use crate::identity::proxy::{ProxyEndpoint, ProxySelector};
use crate::identity::tunnel::{AllocationError, TunnelBroker, TunnelLease};
use crate::modules::events::{
	EventDispatcher, IdentityEvent, IdentityKind, OrchestratorEvent, ProbeEvent, ReleaseEvent,
	StateChangeEvent, WarningEvent,
};
use crate::target::ProbeTarget;
use crate::util::truncate_chars;

/// Network identity combination a scenario exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestType {
	Direct,
	Vpn,
	Proxy,
	VpnProxy,
}

impl TestType {
	pub fn as_str(&self) -> &'static str {
		match self {
			TestType::Direct => "DIRECT",
			TestType::Vpn => "VPN",
			TestType::Proxy => "PROXY",
			TestType::VpnProxy => "VPN_PROXY",
		}
	}

	pub fn uses_vpn(&self) -> bool {
		matches!(self, TestType::Vpn | TestType::VpnProxy)
	}

	pub fn uses_proxy(&self) -> bool {
		matches!(self, TestType::Proxy | TestType::VpnProxy)
	}
}

impl std::fmt::Display for TestType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Immutable description of one probe.
///
/// Identity flags default to what the test type implies but may be set
/// independently to run deliberately mismatched combinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestScenario {
	name: String,
	test_type: TestType,
	fingerprint_id: u64,
	#[serde(default)]
	cookie_set_id: Option<u64>,
	use_vpn: bool,
	use_proxy: bool,
	#[serde(default)]
	description: Option<String>,
}

impl TestScenario {
	pub fn new(name: impl Into<String>, test_type: TestType, fingerprint_id: u64) -> Self {
		Self {
			name: name.into(),
			test_type,
			fingerprint_id,
			cookie_set_id: None,
			use_vpn: test_type.uses_vpn(),
			use_proxy: test_type.uses_proxy(),
			description: None,
		}
	}

	pub fn with_cookie_set(mut self, cookie_set_id: u64) -> Self {
		self.cookie_set_id = Some(cookie_set_id);
		self
	}

	pub fn with_identity_flags(mut self, use_vpn: bool, use_proxy: bool) -> Self {
		self.use_vpn = use_vpn;
		self.use_proxy = use_proxy;
		self
	}

	pub fn with_description(mut self, description: impl Into<String>) -> Self {
		self.description = Some(description.into());
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn test_type(&self) -> TestType {
		self.test_type
	}

	pub fn fingerprint_id(&self) -> u64 {
		self.fingerprint_id
	}

	pub fn cookie_set_id(&self) -> Option<u64> {
		self.cookie_set_id
	}

	pub fn use_vpn(&self) -> bool {
		self.use_vpn
	}

	pub fn use_proxy(&self) -> bool {
		self.use_proxy
	}

	pub fn description(&self) -> Option<&str> {
		self.description.as_deref()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
	DataLoading,
	IdentityAcquiring,
	Requesting,
	Classifying,
	IdentityReleasing,
	Persisted,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
	pub state: RunState,
	pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProbeErrorKind {
	DataLoadFailed,
	PoolExhausted,
	DuplicateCredential,
	TunnelUpFailed,
	TunnelAcquisitionFailed,
	/// Non-fatal: the run continues without a proxy.
	ProxyUnavailable,
	RequestTransportError,
	/// Non-fatal: release did not complete cleanly.
	ReleaseWarning,
}

impl ProbeErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProbeErrorKind::DataLoadFailed => "DataLoadFailed",
			ProbeErrorKind::PoolExhausted => "PoolExhausted",
			ProbeErrorKind::DuplicateCredential => "DuplicateCredential",
			ProbeErrorKind::TunnelUpFailed => "TunnelUpFailed",
			ProbeErrorKind::TunnelAcquisitionFailed => "TunnelAcquisitionFailed",
			ProbeErrorKind::ProxyUnavailable => "ProxyUnavailable",
			ProbeErrorKind::RequestTransportError => "RequestTransportError",
			ProbeErrorKind::ReleaseWarning => "ReleaseWarning",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeFailure {
	pub kind: ProbeErrorKind,
	pub message: String,
}

impl ProbeFailure {
	pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}
}

impl std::fmt::Display for ProbeFailure {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}: {}", self.kind.as_str(), self.message)
	}
}

/// Outcome of one scenario. Handed to the store once and never changed after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
	pub scenario_name: String,
	pub test_type: TestType,
	pub fingerprint_id: u64,
	pub cookie_set_id: Option<u64>,
	pub url: String,
	pub trace_id: Option<String>,
	pub started_at: DateTime<Utc>,
	pub finished_at: Option<DateTime<Utc>>,
	pub elapsed_ms: Option<u64>,
	pub status_code: Option<u16>,
	pub response_size: Option<usize>,
	pub verdict: Verdict,
	pub success: bool,
	pub blocked: bool,
	pub has_products: bool,
	pub product_count: usize,
	pub source_ip: Option<String>,
	pub vpn_server_ip: Option<String>,
	pub vpn_internal_ip: Option<String>,
	pub proxy_address: Option<String>,
	pub proxy_external_ip: Option<String>,
	pub response_preview: Option<String>,
	pub error: Option<ProbeFailure>,
	#[serde(default)]
	pub warnings: Vec<ProbeFailure>,
}

impl TestResult {
	/// Empty result for `scenario`, verdict `Error` until classified.
	pub fn pending(scenario: &TestScenario, url: impl Into<String>) -> Self {
		Self {
			scenario_name: scenario.name.clone(),
			test_type: scenario.test_type,
			fingerprint_id: scenario.fingerprint_id,
			cookie_set_id: scenario.cookie_set_id,
			url: url.into(),
			trace_id: None,
			started_at: Utc::now(),
			finished_at: None,
			elapsed_ms: None,
			status_code: None,
			response_size: None,
			verdict: Verdict::Error,
			success: false,
			blocked: false,
			has_products: false,
			product_count: 0,
			source_ip: None,
			vpn_server_ip: None,
			vpn_internal_ip: None,
			proxy_address: None,
			proxy_external_ip: None,
			response_preview: None,
			error: None,
			warnings: Vec::new(),
		}
	}

	/// `kind: message` of the recorded failure, if any.
	pub fn error_message(&self) -> Option<String> {
		self.error.as_ref().map(ToString::to_string)
	}

	fn finish(&mut self) {
		self.finished_at = Some(Utc::now());
		if self.error.is_some() {
			self.verdict = Verdict::Error;
		}
		self.blocked = self.verdict == Verdict::Blocked;
		self.success = self.error.is_none() && matches!(self.verdict, Verdict::Success | Verdict::Partial);
	}
}

/// Everything a caller can observe about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
	pub result: TestResult,
	pub trace: Vec<StateTransition>,
	pub final_state: RunState,
	pub record_id: Option<u64>,
	pub persist_error: Option<String>,
}

impl RunReport {
	pub fn states(&self) -> Vec<RunState> {
		self.trace.iter().map(|transition| transition.state).collect()
	}

	pub fn entered_at(&self, state: RunState) -> Option<DateTime<Utc>> {
		self.trace
			.iter()
			.find(|transition| transition.state == state)
			.map(|transition| transition.at)
	}
}

/// Shared collaborators from which one orchestrator per scenario is built.
#[derive(Clone)]
pub struct OrchestratorBuilder {
	store: Arc<dyn ResultStore>,
	client: Arc<dyn FingerprintClient>,
	target: ProbeTarget,
	broker: Option<TunnelBroker>,
	proxies: Option<Arc<ProxySelector>>,
	source_ip: Option<Arc<dyn IpEcho>>,
	classifier: ResponseClassifier,
	settings: ProbeSettings,
	min_remaining_secs: u64,
	events: Arc<EventDispatcher>,
}

impl OrchestratorBuilder {
	pub fn new(store: Arc<dyn ResultStore>, client: Arc<dyn FingerprintClient>, target: ProbeTarget) -> Self {
		Self {
			store,
			client,
			target,
			broker: None,
			proxies: None,
			source_ip: None,
			classifier: ResponseClassifier::default(),
			settings: ProbeSettings::default(),
			min_remaining_secs: 120,
			events: Arc::new(EventDispatcher::with_logging()),
		}
	}

	/// Builder with target, classifier and probe settings taken from `config`.
	pub fn from_config(
		config: &ProbeConfig,
		store: Arc<dyn ResultStore>,
		client: Arc<dyn FingerprintClient>,
	) -> Result<Self, url::ParseError> {
		let target = ProbeTarget::from_settings(&config.probe)?;
		Ok(Self::new(store, client, target)
			.with_classifier(ResponseClassifier::new(&config.classifier))
			.with_settings(config.probe.clone())
			.with_min_remaining_secs(config.proxy.min_remaining_secs))
	}

	pub fn with_tunnel_broker(mut self, broker: TunnelBroker) -> Self {
		self.broker = Some(broker);
		self
	}

	pub fn with_proxy_selector(mut self, selector: Arc<ProxySelector>) -> Self {
		self.proxies = Some(selector);
		self
	}

	/// Echo service used to record the source IP of each run.
	pub fn with_source_ip_echo(mut self, echo: Arc<dyn IpEcho>) -> Self {
		self.source_ip = Some(echo);
		self
	}

	pub fn with_classifier(mut self, classifier: ResponseClassifier) -> Self {
		self.classifier = classifier;
		self
	}

	pub fn with_settings(mut self, settings: ProbeSettings) -> Self {
		self.settings = settings;
		self
	}

	pub fn with_min_remaining_secs(mut self, secs: u64) -> Self {
		self.min_remaining_secs = secs;
		self
	}

	pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
		self.events = events;
		self
	}

	pub fn build(&self, scenario: TestScenario) -> TestOrchestrator {
		TestOrchestrator {
			scenario,
			ctx: self.clone(),
			trace: Vec::new(),
		}
	}
}

/// Runs a single scenario; consumed by [`run`](Self::run).
pub struct TestOrchestrator {
	scenario: TestScenario,
	ctx: OrchestratorBuilder,
	trace: Vec<StateTransition>,
}

impl TestOrchestrator {
	pub fn scenario(&self) -> &TestScenario {
		&self.scenario
	}

	/// Executes the scenario. Never fails: every problem ends up on the
	/// returned result. Dropping the future mid-run still releases any tunnel
	/// that was acquired.
	pub async fn run(mut self) -> RunReport {
		let (url, trace_id) = self.ctx.target.resolve();
		let mut result = TestResult::pending(&self.scenario, url.as_str());
		result.trace_id = trace_id;
		let mut lease: Option<TunnelLease> = None;

		self.enter(RunState::DataLoading);
		match self.load_inputs().await {
			Ok((profile, cookies)) => {
				self.enter(RunState::IdentityAcquiring);
				let proxy = self.select_proxy(&mut result).await;

				let acquired = if self.scenario.use_vpn {
					match self.acquire_tunnel(&mut result).await {
						Ok(held) => {
							lease = Some(held);
							true
						}
						Err(failure) => {
							self.fail(&mut result, failure);
							false
						}
					}
				} else {
					true
				};

				if acquired {
					self.record_source_ip(&mut result, proxy.as_ref()).await;
					self.enter(RunState::Requesting);
					let request = ProbeRequest {
						url,
						profile,
						cookies,
						proxy: proxy.as_ref().map(ProxyEndpoint::socks5_uri),
						timeout: self.ctx.settings.request_timeout(),
					};
					match self.request(&request, &mut result).await {
						Ok(response) => {
							self.enter(RunState::Classifying);
							self.classify(&response, &mut result);
						}
						Err(failure) => self.fail(&mut result, failure),
					}
				}
			}
			Err(failure) => self.fail(&mut result, failure),
		}

		self.enter(RunState::IdentityReleasing);
		if let Some(held) = lease.take() {
			let clean = held.release().await;
			self.emit(OrchestratorEvent::IdentityReleased(ReleaseEvent {
				scenario: self.scenario.name.clone(),
				clean,
				timestamp: Utc::now(),
			}));
			if !clean {
				self.warn(
					&mut result,
					ProbeFailure::new(ProbeErrorKind::ReleaseWarning, "tunnel release did not complete cleanly"),
				);
			}
		}

		result.finish();
		self.emit(OrchestratorEvent::ProbeCompleted(ProbeEvent {
			scenario: self.scenario.name.clone(),
			test_type: self.scenario.test_type,
			verdict: result.verdict,
			status: result.status_code,
			latency: result.elapsed_ms.map(Duration::from_millis),
			timestamp: Utc::now(),
		}));

		let (record_id, persist_error) = match self.ctx.store.save_result(&result).await {
			Ok(id) => {
				self.enter(RunState::Persisted);
				(Some(id), None)
			}
			Err(err) => {
				log::error!("[{}] failed to persist result: {err}", self.scenario.name);
				self.enter(RunState::Failed);
				(None, Some(err.to_string()))
			}
		};

		let final_state = if result.error.is_some() || persist_error.is_some() {
			RunState::Failed
		} else {
			RunState::Persisted
		};

		RunReport {
			result,
			trace: self.trace,
			final_state,
			record_id,
			persist_error,
		}
	}

	async fn load_inputs(&self) -> Result<(FingerprintProfile, CookieSet), ProbeFailure> {
		let fingerprint_id = self.scenario.fingerprint_id;
		let profile = match self.ctx.store.load_fingerprint(fingerprint_id).await {
			Ok(Some(profile)) => profile,
			Ok(None) => {
				return Err(ProbeFailure::new(
					ProbeErrorKind::DataLoadFailed,
					format!("fingerprint {fingerprint_id} not found"),
				));
			}
			Err(err) => {
				return Err(ProbeFailure::new(
					ProbeErrorKind::DataLoadFailed,
					format!("fingerprint {fingerprint_id}: {err}"),
				));
			}
		};

		let cookies = match self.scenario.cookie_set_id {
			None => CookieSet::empty(),
			Some(cookie_id) => match self.ctx.store.load_cookie_set(cookie_id).await {
				Ok(Some(cookies)) => cookies,
				Ok(None) => {
					return Err(ProbeFailure::new(
						ProbeErrorKind::DataLoadFailed,
						format!("cookie set {cookie_id} not found"),
					));
				}
				Err(err) => {
					return Err(ProbeFailure::new(
						ProbeErrorKind::DataLoadFailed,
						format!("cookie set {cookie_id}: {err}"),
					));
				}
			},
		};

		log::debug!(
			"[{}] loaded fingerprint {} ({}) and {} cookies",
			self.scenario.name,
			profile.id,
			profile.device_name,
			cookies.len()
		);
		Ok((profile, cookies))
	}

	async fn select_proxy(&self, result: &mut TestResult) -> Option<ProxyEndpoint> {
		if !self.scenario.use_proxy {
			return None;
		}
		let Some(selector) = &self.ctx.proxies else {
			self.warn(
				result,
				ProbeFailure::new(ProbeErrorKind::ProxyUnavailable, "no proxy selector configured"),
			);
			return None;
		};

		match selector.pick_random_least_used(self.ctx.min_remaining_secs).await {
			Some(endpoint) => {
				result.proxy_address = Some(endpoint.address.clone());
				result.proxy_external_ip = Some(endpoint.external_ip.clone());
				self.emit(OrchestratorEvent::IdentityAcquired(IdentityEvent {
					scenario: self.scenario.name.clone(),
					kind: IdentityKind::Proxy,
					detail: endpoint.address.clone(),
					timestamp: Utc::now(),
				}));
				Some(endpoint)
			}
			None => {
				self.warn(
					result,
					ProbeFailure::new(
						ProbeErrorKind::ProxyUnavailable,
						format!(
							"no endpoint with at least {}s remaining; continuing without proxy",
							self.ctx.min_remaining_secs
						),
					),
				);
				None
			}
		}
	}

	async fn acquire_tunnel(&self, result: &mut TestResult) -> Result<TunnelLease, ProbeFailure> {
		let Some(broker) = &self.ctx.broker else {
			return Err(ProbeFailure::new(
				ProbeErrorKind::TunnelAcquisitionFailed,
				"no tunnel broker configured",
			));
		};

		let lease = broker.lease().await.map_err(allocation_failure)?;
		let descriptor = lease.descriptor();
		result.vpn_server_ip = Some(descriptor.server_ip.clone());
		result.vpn_internal_ip = Some(descriptor.internal_ip.clone());
		self.emit(OrchestratorEvent::IdentityAcquired(IdentityEvent {
			scenario: self.scenario.name.clone(),
			kind: IdentityKind::Tunnel,
			detail: descriptor.server_ip.clone(),
			timestamp: Utc::now(),
		}));
		Ok(lease)
	}

	/// Best effort; a failed lookup leaves the source IP empty.
	async fn record_source_ip(&self, result: &mut TestResult, proxy: Option<&ProxyEndpoint>) {
		if !self.ctx.settings.resolve_source_ip {
			return;
		}
		let Some(echo) = &self.ctx.source_ip else {
			return;
		};
		let proxy_uri = proxy.map(ProxyEndpoint::socks5_uri);
		match echo.external_ip(proxy_uri.as_deref()).await {
			Ok(ip) => {
				if let Some(server_ip) = &result.vpn_server_ip
					&& proxy.is_none()
					&& server_ip != &ip
				{
					log::debug!("[{}] source ip {ip} differs from vpn server {server_ip}", self.scenario.name);
				}
				result.source_ip = Some(ip);
			}
			Err(err) => log::debug!("[{}] source ip lookup failed: {err}", self.scenario.name),
		}
	}

	async fn request(&self, request: &ProbeRequest, result: &mut TestResult) -> Result<ProbeResponse, ProbeFailure> {
		let limit = self.ctx.settings.error_message_limit;
		let started = Instant::now();
		let outcome = tokio::time::timeout(request.timeout, self.ctx.client.execute(request)).await;
		result.elapsed_ms = Some(started.elapsed().as_millis() as u64);

		match outcome {
			Ok(Ok(response)) => Ok(response),
			Ok(Err(err)) => Err(ProbeFailure::new(
				ProbeErrorKind::RequestTransportError,
				format!("{}: {}", err.kind(), truncate_chars(&err.to_string(), limit)),
			)),
			Err(_) => Err(ProbeFailure::new(
				ProbeErrorKind::RequestTransportError,
				format!("Timeout: no response within {}s", request.timeout.as_secs()),
			)),
		}
	}

	fn classify(&self, response: &ProbeResponse, result: &mut TestResult) {
		let classification = self.ctx.classifier.classify_bytes(response.status, &response.body);
		result.status_code = Some(classification.status.as_u16());
		result.response_size = Some(classification.response_size);
		result.verdict = classification.verdict;
		result.has_products = classification.has_products;
		result.product_count = classification.product_count;
		result.response_preview = Some(truncate_chars(
			&response.text_lossy(),
			self.ctx.settings.preview_chars,
		));
		log::info!(
			"[{}] {} bytes, status {}, verdict {}, {} products",
			self.scenario.name,
			classification.response_size,
			classification.status,
			classification.verdict,
			classification.product_count
		);
	}

	fn enter(&mut self, state: RunState) {
		self.trace.push(StateTransition { state, at: Utc::now() });
		self.emit(OrchestratorEvent::StateChanged(StateChangeEvent {
			scenario: self.scenario.name.clone(),
			state,
			timestamp: Utc::now(),
		}));
	}

	fn fail(&mut self, result: &mut TestResult, failure: ProbeFailure) {
		log::warn!("[{}] {failure}", self.scenario.name);
		if result.error.is_none() {
			result.error = Some(failure);
		}
		self.enter(RunState::Failed);
	}

	fn warn(&self, result: &mut TestResult, failure: ProbeFailure) {
		self.emit(OrchestratorEvent::Warning(WarningEvent {
			scenario: self.scenario.name.clone(),
			failure: failure.clone(),
			timestamp: Utc::now(),
		}));
		result.warnings.push(failure);
	}

	fn emit(&self, event: OrchestratorEvent) {
		self.ctx.events.dispatch(event);
	}
}

fn allocation_failure(err: AllocationError) -> ProbeFailure {
	let kind = match &err {
		AllocationError::PoolExhausted => ProbeErrorKind::PoolExhausted,
		AllocationError::DuplicateCredential(_) => ProbeErrorKind::DuplicateCredential,
		AllocationError::TunnelUpFailed(_) => ProbeErrorKind::TunnelUpFailed,
		AllocationError::Profile(_) | AllocationError::Pool(_) => ProbeErrorKind::TunnelAcquisitionFailed,
	};
	ProbeFailure::new(kind, err.to_string())
}
