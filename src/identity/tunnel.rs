//! Exclusive VPN slot lifecycle.
//!
//! [`TunnelBroker`] takes a slot from the remote pool, writes its connection
//! profile to a transient file, brings the interface up through the control
//! utility and hands back an [`IdentitySlot`]. Release walks every teardown
//! step even when earlier ones fail, so the registries are always cleaned.
//!
//! [`TunnelLease`] is the scoped form: dropping a lease that was not released
//! explicitly (early return, panic, cancelled future) schedules the release on
//! the current runtime. Release itself and the pool hand-back after a failed
//! bring-up run as spawned tasks, so cancelling the caller mid-teardown does
//! not abandon the remaining steps.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::ip_check::{IpEcho, VerificationResult};
use super::pool::{IdentityPool, PoolError, PoolStatus, SlotGrant};
use super::registry::IdentityRegistry;
use crate::config::TunnelConfig;
use crate::util::{short_key, truncate_chars};

/// Failures reported by the tunnel control utility.
#[derive(Debug, Error)]
pub enum TunnelControlError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {diagnostic}")]
    Failed {
        program: String,
        status: String,
        diagnostic: String,
    },
}

/// Brings tunnel interfaces up and down from a profile file.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn up(&self, profile: &Path) -> Result<(), TunnelControlError>;
    async fn down(&self, profile: &Path) -> Result<(), TunnelControlError>;
}

/// `wg-quick` driver, optionally behind `sudo`.
pub struct WgQuickControl {
    program: String,
    use_sudo: bool,
    sudo_password: Option<String>,
    diagnostic_limit: usize,
}

impl WgQuickControl {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            program: config.control_program.clone(),
            use_sudo: config.use_sudo,
            sudo_password: config.sudo_password.clone(),
            diagnostic_limit: config.diagnostic_limit,
        }
    }

    fn command(&self, action: &str, profile: &Path) -> Command {
        let mut command = if self.use_sudo {
            let mut sudo = Command::new("sudo");
            // -S reads the password from stdin, -n fails instead of prompting.
            sudo.arg(if self.sudo_password.is_some() { "-S" } else { "-n" });
            sudo.arg(&self.program);
            sudo
        } else {
            Command::new(&self.program)
        };
        command
            .arg(action)
            .arg(profile)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    async fn run(&self, action: &str, profile: &Path) -> Result<(), TunnelControlError> {
        let mut child = self
            .command(action, profile)
            .spawn()
            .map_err(|source| TunnelControlError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            if self.use_sudo
                && let Some(password) = &self.sudo_password
                && let Err(err) = stdin.write_all(format!("{password}\n").as_bytes()).await
            {
                log::debug!("could not feed sudo password: {err}");
            }
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| TunnelControlError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = if stderr.trim().is_empty() { stdout } else { stderr };
        Err(TunnelControlError::Failed {
            program: self.program.clone(),
            status: output.status.to_string(),
            diagnostic: truncate_chars(text.trim(), self.diagnostic_limit),
        })
    }
}

#[async_trait]
impl TunnelControl for WgQuickControl {
    async fn up(&self, profile: &Path) -> Result<(), TunnelControlError> {
        self.run("up", profile).await
    }

    async fn down(&self, profile: &Path) -> Result<(), TunnelControlError> {
        self.run("down", profile).await
    }
}

/// Why an allocation did not produce a slot.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("identity pool has no free slot")]
    PoolExhausted,
    #[error("credential {0} is already allocated in this process")]
    DuplicateCredential(String),
    #[error("tunnel bring-up failed: {0}")]
    TunnelUpFailed(String),
    #[error("could not write connection profile: {0}")]
    Profile(#[from] std::io::Error),
    #[error("identity pool unavailable: {0}")]
    Pool(PoolError),
}

/// Identifying data of an established slot; cheap to clone into request scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub public_key: String,
    pub server_ip: String,
    pub internal_ip: String,
}

/// One VPN slot held exclusively by this process until released.
#[derive(Debug)]
pub struct IdentitySlot {
    descriptor: SlotDescriptor,
    profile: NamedTempFile,
}

impl IdentitySlot {
    pub fn descriptor(&self) -> &SlotDescriptor {
        &self.descriptor
    }

    pub fn public_key(&self) -> &str {
        &self.descriptor.public_key
    }

    pub fn server_ip(&self) -> &str {
        &self.descriptor.server_ip
    }

    pub fn internal_ip(&self) -> &str {
        &self.descriptor.internal_ip
    }

    /// Path of the transient connection profile handed to the control utility.
    pub fn profile_path(&self) -> &Path {
        self.profile.path()
    }
}

/// Allocates, verifies and releases VPN slots.
///
/// Clones share the same local registry and collaborators. The shared
/// registry must be the process-wide one, created once and passed to every
/// broker.
#[derive(Clone)]
pub struct TunnelBroker {
    pool: Arc<dyn IdentityPool>,
    control: Arc<dyn TunnelControl>,
    ip_echo: Arc<dyn IpEcho>,
    shared: IdentityRegistry,
    local: IdentityRegistry,
    settle_delay: Duration,
    diagnostic_limit: usize,
    profile_dir: Option<PathBuf>,
}

impl TunnelBroker {
    pub fn new(
        pool: Arc<dyn IdentityPool>,
        control: Arc<dyn TunnelControl>,
        ip_echo: Arc<dyn IpEcho>,
        shared: IdentityRegistry,
        config: &TunnelConfig,
    ) -> Self {
        Self {
            pool,
            control,
            ip_echo,
            shared,
            local: IdentityRegistry::new(),
            settle_delay: config.settle_delay(),
            diagnostic_limit: config.diagnostic_limit,
            profile_dir: config.profile_dir.as_ref().map(PathBuf::from),
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Credentials this broker currently holds.
    pub fn held_credentials(&self) -> Vec<String> {
        self.local.snapshot()
    }

    pub fn shared_registry(&self) -> &IdentityRegistry {
        &self.shared
    }

    pub async fn pool_status(&self) -> Result<PoolStatus, PoolError> {
        self.pool.list_servers().await
    }

    /// Allocates a slot and brings its tunnel up. The caller owns the slot and
    /// must pass it to [`release`](Self::release) exactly once.
    pub async fn allocate(&self) -> Result<IdentitySlot, AllocationError> {
        let mut lease = self.bring_up().await?;
        Ok(lease.take_slot())
    }

    /// Like [`allocate`](Self::allocate) but returns a guard that releases the
    /// slot when dropped, after waiting the configured settle delay.
    pub async fn lease(&self) -> Result<TunnelLease, AllocationError> {
        let lease = self.bring_up().await?;
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(lease)
    }

    /// Runs `body` while a tunnel is held and releases it afterwards, returning
    /// the body's output and whether every release step succeeded.
    pub async fn scoped<F, Fut, T>(&self, body: F) -> Result<(T, bool), AllocationError>
    where
        F: FnOnce(SlotDescriptor) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.lease().await?;
        let output = body(lease.descriptor().clone()).await;
        let clean = lease.release().await;
        Ok((output, clean))
    }

    async fn bring_up(&self) -> Result<TunnelLease, AllocationError> {
        let grant = match self.pool.allocate().await {
            Ok(grant) => grant,
            Err(PoolError::Rejected) => {
                log::warn!("vpn pool rejected allocation request");
                return Err(AllocationError::PoolExhausted);
            }
            Err(err) => {
                log::warn!("vpn pool allocation failed: {err}");
                return Err(AllocationError::Pool(err));
            }
        };
        let SlotGrant {
            public_key,
            config,
            server_ip,
            internal_ip,
        } = grant;

        // Claimed before bring-up so two concurrent allocations of the same
        // credential cannot both pass the check.
        if !self.reserve(&public_key) {
            log::warn!("credential {} is already held", short_key(&public_key));
            return Err(AllocationError::DuplicateCredential(short_key(&public_key)));
        }

        let profile = match self.write_profile(&config) {
            Ok(profile) => profile,
            Err(err) => {
                self.forget(&public_key);
                self.return_to_pool(&public_key).await;
                return Err(AllocationError::Profile(err));
            }
        };

        // From here on a dropped future still tears the slot down.
        let mut lease = TunnelLease::new(
            self.clone(),
            IdentitySlot {
                descriptor: SlotDescriptor {
                    public_key,
                    server_ip,
                    internal_ip,
                },
                profile,
            },
        );

        let up = self.control.up(lease.slot().profile_path()).await;
        if let Err(err) = up {
            let slot = lease.take_slot();
            let diagnostic = match &err {
                TunnelControlError::Failed { diagnostic, .. } => {
                    truncate_chars(diagnostic, self.diagnostic_limit)
                }
                other => truncate_chars(&other.to_string(), self.diagnostic_limit),
            };
            log::error!(
                "tunnel up failed for {}: {diagnostic}",
                short_key(slot.public_key())
            );
            let key = slot.descriptor.public_key.clone();
            if let Err(err) = slot.profile.close() {
                log::warn!("could not delete connection profile: {err}");
            }
            self.forget(&key);
            self.return_to_pool(&key).await;
            return Err(AllocationError::TunnelUpFailed(diagnostic));
        }

        log::info!(
            "tunnel up via {} ({})",
            lease.descriptor().server_ip,
            short_key(&lease.descriptor().public_key)
        );
        Ok(lease)
    }

    /// Tears the tunnel down, deletes its profile, returns the slot to the
    /// pool and drops the credential from both registries. Every step runs
    /// regardless of earlier failures; returns `true` only if all succeeded.
    ///
    /// The steps run on a spawned task: dropping this future part way through
    /// still lets the release finish.
    pub async fn release(&self, slot: IdentitySlot) -> bool {
        let public_key = slot.descriptor.public_key.clone();
        let broker = self.clone();
        match tokio::spawn(async move { broker.release_steps(slot).await }).await {
            Ok(clean) => clean,
            Err(err) => {
                log::error!("release task for {} failed: {err}", short_key(&public_key));
                self.forget(&public_key);
                false
            }
        }
    }

    async fn release_steps(&self, slot: IdentitySlot) -> bool {
        let IdentitySlot {
            descriptor,
            profile,
        } = slot;
        let key = short_key(&descriptor.public_key);
        let mut clean = true;

        if let Err(err) = self.control.down(profile.path()).await {
            log::warn!("tunnel down failed for {key}: {err}");
            clean = false;
        }

        if let Err(err) = profile.close() {
            log::warn!("could not delete connection profile for {key}: {err}");
            clean = false;
        }

        if let Err(err) = self.pool.release(&descriptor.public_key).await {
            log::warn!("pool release failed for {key}: {err}");
            clean = false;
        }

        self.forget(&descriptor.public_key);
        log::info!("released tunnel {key} (clean={clean})");
        clean
    }

    /// Looks up the external IP through the established tunnel.
    pub async fn verify(&self, slot: &IdentitySlot, expected_ip: Option<&str>) -> VerificationResult {
        let result = VerificationResult::from_lookup(self.ip_echo.external_ip(None).await, expected_ip);
        log::debug!(
            "verified tunnel {}: observed={:?} matches={}",
            short_key(slot.public_key()),
            result.observed_ip,
            result.matches
        );
        result
    }

    fn reserve(&self, key: &str) -> bool {
        if !self.local.try_claim(key) {
            return false;
        }
        if !self.shared.try_claim(key) {
            self.local.remove(key);
            return false;
        }
        true
    }

    fn forget(&self, key: &str) {
        self.local.remove(key);
        self.shared.remove(key);
    }

    async fn return_to_pool(&self, key: &str) {
        let pool = self.pool.clone();
        let key = key.to_string();
        let task = tokio::spawn(async move {
            if let Err(err) = pool.release(&key).await {
                log::warn!("could not return slot {} to pool: {err}", short_key(&key));
            }
        });
        if let Err(err) = task.await {
            log::error!("pool hand-back task failed: {err}");
        }
    }

    fn write_profile(&self, contents: &str) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("wg").suffix(".conf").rand_bytes(6);
        let mut file = match &self.profile_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

/// Scoped ownership of an [`IdentitySlot`].
pub struct TunnelLease {
    broker: TunnelBroker,
    descriptor: SlotDescriptor,
    slot: Option<IdentitySlot>,
}

impl TunnelLease {
    fn new(broker: TunnelBroker, slot: IdentitySlot) -> Self {
        Self {
            broker,
            descriptor: slot.descriptor.clone(),
            slot: Some(slot),
        }
    }

    pub fn descriptor(&self) -> &SlotDescriptor {
        &self.descriptor
    }

    pub fn slot(&self) -> &IdentitySlot {
        self.slot
            .as_ref()
            .expect("lease holds its slot until consumed")
    }

    pub async fn verify(&self, expected_ip: Option<&str>) -> VerificationResult {
        self.broker.verify(self.slot(), expected_ip).await
    }

    /// Releases now and reports whether every step succeeded.
    pub async fn release(mut self) -> bool {
        match self.slot.take() {
            Some(slot) => self.broker.release(slot).await,
            None => true,
        }
    }

    fn take_slot(&mut self) -> IdentitySlot {
        self.slot
            .take()
            .expect("lease holds its slot until consumed")
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let key = short_key(slot.public_key());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("tunnel lease {key} dropped before release; releasing in background");
                let broker = self.broker.clone();
                handle.spawn(async move {
                    broker.release_steps(slot).await;
                });
            }
            Err(_) => {
                log::error!("tunnel lease {key} dropped outside a runtime; interface may still be up");
                self.broker.forget(&slot.descriptor.public_key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ip_check::IpEchoError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubPool {
        keys: Mutex<Vec<String>>,
        exhausted: bool,
        release_delay: Duration,
        released: Mutex<Vec<String>>,
    }

    impl StubPool {
        fn with_keys(keys: &[&str]) -> Self {
            Self {
                keys: Mutex::new(keys.iter().rev().map(|k| k.to_string()).collect()),
                ..Default::default()
            }
        }

        fn released(&self) -> Vec<String> {
            self.released.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IdentityPool for StubPool {
        async fn allocate(&self) -> Result<SlotGrant, PoolError> {
            if self.exhausted {
                return Err(PoolError::Rejected);
            }
            let key = self.keys.lock().unwrap().pop().ok_or(PoolError::Rejected)?;
            Ok(SlotGrant {
                config: format!("[Interface]\nPrivateKey = secret-{key}\n"),
                public_key: key,
                server_ip: "203.0.113.7".into(),
                internal_ip: "10.8.0.2".into(),
            })
        }

        async fn release(&self, public_key: &str) -> Result<(), PoolError> {
            if !self.release_delay.is_zero() {
                tokio::time::sleep(self.release_delay).await;
            }
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

    #[derive(Default)]
    struct StubControl {
        fail_up: bool,
        fail_down: bool,
        down_delay: Duration,
        ups: AtomicUsize,
        downs: AtomicUsize,
        profile_seen: AtomicBool,
    }

    #[async_trait]
    impl TunnelControl for StubControl {
        async fn up(&self, profile: &Path) -> Result<(), TunnelControlError> {
            self.ups.fetch_add(1, Ordering::SeqCst);
            let contents = std::fs::read_to_string(profile).unwrap();
            self.profile_seen
                .store(contents.contains("[Interface]"), Ordering::SeqCst);
            if self.fail_up {
                return Err(TunnelControlError::Failed {
                    program: "wg-quick".into(),
                    status: "exit status: 1".into(),
                    diagnostic: format!("RTNETLINK answers: {}", "x".repeat(500)),
                });
            }
            Ok(())
        }

        async fn down(&self, _profile: &Path) -> Result<(), TunnelControlError> {
            if !self.down_delay.is_zero() {
                tokio::time::sleep(self.down_delay).await;
            }
            self.downs.fetch_add(1, Ordering::SeqCst);
            if self.fail_down {
                return Err(TunnelControlError::Failed {
                    program: "wg-quick".into(),
                    status: "exit status: 1".into(),
                    diagnostic: "no such interface".into(),
                });
            }
            Ok(())
        }
    }

    struct StubEcho;

    #[async_trait]
    impl IpEcho for StubEcho {
        async fn external_ip(&self, _proxy: Option<&str>) -> Result<String, IpEchoError> {
            Ok("203.0.113.7".into())
        }
    }

    fn broker(pool: Arc<StubPool>, control: Arc<StubControl>, shared: IdentityRegistry) -> TunnelBroker {
        TunnelBroker::new(pool, control, Arc::new(StubEcho), shared, &TunnelConfig::default())
            .with_settle_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn allocate_registers_and_release_cleans_up() {
        let pool = Arc::new(StubPool::with_keys(&["key-1"]));
        let control = Arc::new(StubControl::default());
        let shared = IdentityRegistry::new();
        let broker = broker(pool.clone(), control.clone(), shared.clone());

        let slot = broker.allocate().await.unwrap();
        let path = slot.profile_path().to_path_buf();
        assert!(path.exists());
        assert!(control.profile_seen.load(Ordering::SeqCst));
        assert!(shared.contains("key-1"));
        assert_eq!(broker.held_credentials(), vec!["key-1".to_string()]);
        assert_eq!(slot.server_ip(), "203.0.113.7");

        assert!(broker.release(slot).await);
        assert!(!path.exists());
        assert!(shared.is_empty());
        assert!(broker.held_credentials().is_empty());
        assert_eq!(pool.released(), vec!["key-1".to_string()]);
    }

    #[tokio::test]
    async fn release_cleans_registries_when_teardown_fails() {
        let pool = Arc::new(StubPool::with_keys(&["key-1"]));
        let control = Arc::new(StubControl {
            fail_down: true,
            ..Default::default()
        });
        let shared = IdentityRegistry::new();
        let broker = broker(pool.clone(), control.clone(), shared.clone());

        let slot = broker.allocate().await.unwrap();
        let path = slot.profile_path().to_path_buf();
        assert!(!broker.release(slot).await);

        assert_eq!(control.downs.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
        assert!(shared.is_empty());
        assert!(broker.held_credentials().is_empty());
        assert_eq!(pool.released(), vec!["key-1".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_credential_is_refused() {
        let pool = Arc::new(StubPool::with_keys(&["dup", "dup"]));
        let control = Arc::new(StubControl::default());
        let shared = IdentityRegistry::new();
        let broker = broker(pool.clone(), control.clone(), shared.clone());

        let held = broker.allocate().await.unwrap();
        let err = broker.allocate().await.unwrap_err();
        assert!(matches!(err, AllocationError::DuplicateCredential(_)));
        assert_eq!(control.ups.load(Ordering::SeqCst), 1);
        assert!(pool.released().is_empty());
        assert!(shared.contains("dup"));

        broker.release(held).await;
    }

    #[tokio::test]
    async fn shared_registry_spans_brokers() {
        let pool = Arc::new(StubPool::with_keys(&["dup", "dup"]));
        let shared = IdentityRegistry::new();
        let first = broker(pool.clone(), Arc::new(StubControl::default()), shared.clone());
        let second = broker(pool.clone(), Arc::new(StubControl::default()), shared.clone());

        let held = first.allocate().await.unwrap();
        assert!(matches!(
            second.allocate().await,
            Err(AllocationError::DuplicateCredential(_))
        ));
        assert!(second.held_credentials().is_empty());
        first.release(held).await;
        assert!(shared.is_empty());
    }

    #[tokio::test]
    async fn exhausted_pool_maps_to_pool_exhausted() {
        let pool = Arc::new(StubPool {
            exhausted: true,
            ..Default::default()
        });
        let broker = broker(pool, Arc::new(StubControl::default()), IdentityRegistry::new());
        assert!(matches!(
            broker.allocate().await,
            Err(AllocationError::PoolExhausted)
        ));
    }

    #[tokio::test]
    async fn failed_bring_up_leaves_no_trace() {
        let pool = Arc::new(StubPool::with_keys(&["key-1"]));
        let control = Arc::new(StubControl {
            fail_up: true,
            ..Default::default()
        });
        let shared = IdentityRegistry::new();
        let broker = broker(pool.clone(), control.clone(), shared.clone());

        let err = broker.allocate().await.unwrap_err();
        match err {
            AllocationError::TunnelUpFailed(diagnostic) => {
                assert_eq!(diagnostic.chars().count(), TunnelConfig::default().diagnostic_limit);
                assert!(diagnostic.starts_with("RTNETLINK answers: "));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(shared.is_empty());
        assert!(broker.held_credentials().is_empty());
        assert_eq!(control.downs.load(Ordering::SeqCst), 0);
        assert_eq!(pool.released(), vec!["key-1".to_string()]);
    }

    #[tokio::test]
    async fn dropped_lease_releases_in_background() {
        let pool = Arc::new(StubPool::with_keys(&["key-1"]));
        let control = Arc::new(StubControl::default());
        let shared = IdentityRegistry::new();
        let broker = broker(pool.clone(), control.clone(), shared.clone());

        let lease = broker.lease().await.unwrap();
        assert_eq!(lease.descriptor().public_key, "key-1");
        drop(lease);

        for _ in 0..50 {
            if shared.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(shared.is_empty());
        assert_eq!(control.downs.load(Ordering::SeqCst), 1);
        assert_eq!(pool.released(), vec!["key-1".to_string()]);
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn cancelled_release_still_completes() {
        let pool = Arc::new(StubPool::with_keys(&["key-1"]));
        let control = Arc::new(StubControl {
            down_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let shared = IdentityRegistry::new();
        let broker = broker(pool.clone(), control.clone(), shared.clone());

        let lease = broker.lease().await.unwrap();
        let path = lease.slot().profile_path().to_path_buf();
        let cut = tokio::time::timeout(Duration::from_millis(20), lease.release()).await;
        assert!(cut.is_err());

        wait_until(|| shared.is_empty() && !pool.released().is_empty()).await;
        assert!(shared.is_empty());
        assert!(broker.held_credentials().is_empty());
        assert_eq!(control.downs.load(Ordering::SeqCst), 1);
        assert_eq!(pool.released(), vec!["key-1".to_string()]);
        assert!(!path.exists());

        let pool_again = Arc::new(StubPool::with_keys(&["key-1"]));
        let again = TunnelBroker::new(
            pool_again,
            Arc::new(StubControl::default()),
            Arc::new(StubEcho),
            shared.clone(),
            &TunnelConfig::default(),
        )
        .with_settle_delay(Duration::ZERO);
        let slot = again.allocate().await.unwrap();
        assert!(again.release(slot).await);
    }

    #[tokio::test]
    async fn cancelled_failed_bring_up_still_returns_slot() {
        let pool = Arc::new(StubPool {
            keys: Mutex::new(vec!["key-1".to_string()]),
            release_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let control = Arc::new(StubControl {
            fail_up: true,
            ..Default::default()
        });
        let shared = IdentityRegistry::new();
        let broker = broker(pool.clone(), control, shared.clone());

        let cut = tokio::time::timeout(Duration::from_millis(20), broker.allocate()).await;
        assert!(cut.is_err());
        assert!(shared.is_empty());

        wait_until(|| !pool.released().is_empty()).await;
        assert_eq!(pool.released(), vec!["key-1".to_string()]);
    }

    #[tokio::test]
    async fn scoped_releases_after_body() {
        let pool = Arc::new(StubPool::with_keys(&["key-1"]));
        let shared = IdentityRegistry::new();
        let broker = broker(pool.clone(), Arc::new(StubControl::default()), shared.clone());

        let probe_registry = shared.clone();
        let (seen, clean) = broker
            .scoped(|descriptor| async move {
                assert!(probe_registry.contains(&descriptor.public_key));
                descriptor.server_ip
            })
            .await
            .unwrap();

        assert_eq!(seen, "203.0.113.7");
        assert!(clean);
        assert!(shared.is_empty());
    }

    #[tokio::test]
    async fn verify_reports_match() {
        let pool = Arc::new(StubPool::with_keys(&["key-1"]));
        let broker = broker(pool, Arc::new(StubControl::default()), IdentityRegistry::new());
        let lease = broker.lease().await.unwrap();

        let result = lease.verify(Some("203.0.113.7")).await;
        assert!(result.is_reachable());
        assert!(result.matches);
        let result = lease.verify(Some("198.51.100.1")).await;
        assert!(!result.matches);

        assert!(lease.release().await);
    }

    #[tokio::test]
    async fn pool_status_passes_through() {
        let pool = Arc::new(StubPool::with_keys(&["a", "b"]));
        let broker = broker(pool, Arc::new(StubControl::default()), IdentityRegistry::new());
        assert_eq!(broker.pool_status().await.unwrap().total_available, 2);
    }
}
