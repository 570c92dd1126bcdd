#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use probe_orchestrator::{
    Cookie, CookieSet, FingerprintClient, FingerprintProfile, IdentityPool, IdentityRegistry,
    IpEcho, IpEchoError, MemoryStore, OrchestratorBuilder, PoolError, PoolStatus, ProbeRequest,
    ProbeResponse, ProbeTarget, ProbeTransportError, ProxyEndpoint, ProxySelector, ProxySource,
    ResultStore, SlotGrant, StoreError, StoredResult, TestResult, TunnelBroker, TunnelConfig,
    TunnelControl, TunnelControlError,
};
use url::Url;

pub type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

pub struct FakePool {
    keys: Mutex<VecDeque<String>>,
    released: Mutex<Vec<String>>,
    log: Log,
    pub allocate_delay: Duration,
}

impl FakePool {
    pub fn new(keys: &[&str], log: Log) -> Self {
        Self {
            keys: Mutex::new(keys.iter().map(|key| key.to_string()).collect()),
            released: Mutex::new(Vec::new()),
            log,
            allocate_delay: Duration::ZERO,
        }
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityPool for FakePool {
    async fn allocate(&self) -> Result<SlotGrant, PoolError> {
        if !self.allocate_delay.is_zero() {
            tokio::time::sleep(self.allocate_delay).await;
        }
        push(&self.log, "allocate");
        let key = self.keys.lock().unwrap().pop_front().ok_or(PoolError::Rejected)?;
        Ok(SlotGrant {
            config: format!("[Interface]\nPrivateKey = private-{key}\n"),
            public_key: key,
            server_ip: "203.0.113.7".into(),
            internal_ip: "10.8.0.2".into(),
        })
    }

    async fn release(&self, public_key: &str) -> Result<(), PoolError> {
        push(&self.log, "pool_release");
        self.released.lock().unwrap().push(public_key.to_string());
        Ok(())
    }

    async fn list_servers(&self) -> Result<PoolStatus, PoolError> {
        Ok(PoolStatus {
            servers: Vec::new(),
            total_available: self.keys.lock().unwrap().len() as u64,
        })
    }
}

pub struct FakeProxySource {
    pub endpoints: Mutex<Vec<ProxyEndpoint>>,
    log: Log,
}

#[async_trait]
impl ProxySource for FakeProxySource {
    async fn proxy_status(&self, min_remaining_secs: u64) -> Result<Vec<ProxyEndpoint>, PoolError> {
        push(&self.log, "proxy_fetch");
        Ok(self
            .endpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|endpoint| endpoint.remaining_secs >= min_remaining_secs)
            .cloned()
            .collect())
    }
}

pub struct FakeControl {
    pub fail_up: AtomicBool,
    pub fail_down: AtomicBool,
    log: Log,
}

#[async_trait]
impl TunnelControl for FakeControl {
    async fn up(&self, profile: &Path) -> Result<(), TunnelControlError> {
        assert!(profile.exists());
        push(&self.log, "up");
        if self.fail_up.load(Ordering::SeqCst) {
            return Err(TunnelControlError::Failed {
                program: "wg-quick".into(),
                status: "exit status: 1".into(),
                diagnostic: "RTNETLINK answers: File exists".into(),
            });
        }
        Ok(())
    }

    async fn down(&self, _profile: &Path) -> Result<(), TunnelControlError> {
        push(&self.log, "down");
        if self.fail_down.load(Ordering::SeqCst) {
            return Err(TunnelControlError::Failed {
                program: "wg-quick".into(),
                status: "exit status: 1".into(),
                diagnostic: "interface not found".into(),
            });
        }
        Ok(())
    }
}

pub struct FakeEcho(pub &'static str);

#[async_trait]
impl IpEcho for FakeEcho {
    async fn external_ip(&self, _proxy: Option<&str>) -> Result<String, IpEchoError> {
        Ok(self.0.to_string())
    }
}

#[derive(Clone)]
pub enum ClientBehaviour {
    Respond(StatusCode, String),
    Fail(String),
    Hang,
    Sleep(Duration),
}

pub struct FakeClient {
    pub behaviour: Mutex<ClientBehaviour>,
    pub requests: Mutex<Vec<ProbeRequest>>,
    log: Log,
}

#[async_trait]
impl FingerprintClient for FakeClient {
    async fn execute(&self, request: &ProbeRequest) -> Result<ProbeResponse, ProbeTransportError> {
        push(&self.log, "request");
        self.requests.lock().unwrap().push(request.clone());
        let behaviour = self.behaviour.lock().unwrap().clone();
        match behaviour {
            ClientBehaviour::Respond(status, body) => Ok(ProbeResponse {
                status,
                headers: HeaderMap::new(),
                body: Bytes::from(body),
            }),
            ClientBehaviour::Fail(message) => Err(ProbeTransportError::Connect(message)),
            ClientBehaviour::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            ClientBehaviour::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Err(ProbeTransportError::Request("woke up".into()))
            }
        }
    }
}

/// Memory store that logs calls and whether a credential was still
/// registered when a result was saved.
pub struct RecordingStore {
    pub inner: MemoryStore,
    registry: IdentityRegistry,
    pub registry_empty_at_save: Mutex<Vec<bool>>,
    log: Log,
}

#[async_trait]
impl ResultStore for RecordingStore {
    async fn load_fingerprint(&self, id: u64) -> Result<Option<FingerprintProfile>, StoreError> {
        push(&self.log, "load_fingerprint");
        self.inner.load_fingerprint(id).await
    }

    async fn load_cookie_set(&self, id: u64) -> Result<Option<CookieSet>, StoreError> {
        push(&self.log, "load_cookie_set");
        self.inner.load_cookie_set(id).await
    }

    async fn save_result(&self, result: &TestResult) -> Result<u64, StoreError> {
        push(&self.log, "save");
        self.registry_empty_at_save
            .lock()
            .unwrap()
            .push(self.registry.is_empty());
        self.inner.save_result(result).await
    }

    async fn list_results(&self) -> Result<Vec<StoredResult>, StoreError> {
        self.inner.list_results().await
    }
}

pub fn listing_body(products: usize, len: usize) -> String {
    let mut body = String::from(r#"<html><ul id="product-list">"#);
    for i in 0..products {
        body.push_str(&format!(r#"<li><a href="/vp/products/{i}">item</a></li>"#));
    }
    body.push_str("</ul></html>");
    while body.len() < len {
        body.push(' ');
    }
    body
}

pub fn endpoint(address: &str, use_count: u64) -> ProxyEndpoint {
    ProxyEndpoint {
        address: address.to_string(),
        external_ip: "198.51.100.20".into(),
        use_count,
        remaining_secs: 300,
    }
}

pub struct Harness {
    pub log: Log,
    pub registry: IdentityRegistry,
    pub pool: Arc<FakePool>,
    pub proxies: Arc<FakeProxySource>,
    pub control: Arc<FakeControl>,
    pub client: Arc<FakeClient>,
    pub store: Arc<RecordingStore>,
}

impl Harness {
    pub fn new(keys: &[&str], behaviour: ClientBehaviour) -> Self {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let registry = IdentityRegistry::new();

        let inner = MemoryStore::new();
        inner.insert_fingerprint(FingerprintProfile::new(1, "Galaxy S23", "771,4865-4866-4867", "Mozilla/5.0 (Linux; Android 14)"));
        inner.insert_cookie_set(CookieSet::new(
            1,
            vec![Cookie {
                name: "PCID".into(),
                value: "1731337200".into(),
            }],
        ));

        Self {
            pool: Arc::new(FakePool::new(keys, log.clone())),
            proxies: Arc::new(FakeProxySource {
                endpoints: Mutex::new(Vec::new()),
                log: log.clone(),
            }),
            control: Arc::new(FakeControl {
                fail_up: AtomicBool::new(false),
                fail_down: AtomicBool::new(false),
                log: log.clone(),
            }),
            client: Arc::new(FakeClient {
                behaviour: Mutex::new(behaviour),
                requests: Mutex::new(Vec::new()),
                log: log.clone(),
            }),
            store: Arc::new(RecordingStore {
                inner,
                registry: registry.clone(),
                registry_empty_at_save: Mutex::new(Vec::new()),
                log: log.clone(),
            }),
            registry,
            log,
        }
    }

    pub fn broker(&self) -> TunnelBroker {
        TunnelBroker::new(
            self.pool.clone(),
            self.control.clone(),
            Arc::new(FakeEcho("203.0.113.7")),
            self.registry.clone(),
            &TunnelConfig::default(),
        )
        .with_settle_delay(Duration::ZERO)
    }

    pub fn builder(&self) -> OrchestratorBuilder {
        let target = ProbeTarget::new(Url::parse("https://www.coupang.com/np/search?q=test").unwrap());
        OrchestratorBuilder::new(self.store.clone(), self.client.clone(), target)
            .with_tunnel_broker(self.broker())
            .with_proxy_selector(Arc::new(ProxySelector::new(self.proxies.clone())))
            .with_source_ip_echo(Arc::new(FakeEcho("203.0.113.7")))
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }

    /// Index of the first occurrence of `entry`; panics when absent.
    pub fn position(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("`{entry}` never happened: {:?}", self.entries()))
    }
}
