//! Shared fakes for unit and integration tests.
//!
//! Not part of the agent's public API; compiled into the lib so the
//! `tests/` directory can reuse the same fakes as `#[cfg(test)]` modules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use vigil_common::envelope::TaskDescriptor;
use vigil_common::types::{
    AgentInfo, DiskInfo, EventLogEntry, ProcessInfo, ServiceStatus, SoftwareItem,
};

use crate::config::AgentConfig;
use crate::dispatch::AgentCtx;
use crate::exclusion::ExclusionGuard;
use crate::ports::{
    Collectors, IdentityProvider, LaunchAs, PowerOps, ServiceOps, TaskOps, UpdateOps,
};
use crate::script::ScriptExecutor;
use crate::sink::ResultSink;
use crate::transport::Transport;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory transport that records every publish.
#[derive(Default)]
pub struct RecordingTransport {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    flushes: AtomicUsize,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        locked(&self.published).clone()
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        locked(&self.published).push((subject.to_string(), payload));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Deterministic collectors. `public_ip` fails on purpose so cadence
/// error paths stay covered.
pub struct FakeCollectors;

#[async_trait]
impl Collectors for FakeCollectors {
    async fn agent_info(&self) -> Result<AgentInfo> {
        Ok(AgentInfo {
            agent_id: "agent-test".to_string(),
            hostname: "test-host".to_string(),
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            version: "0.0.0-test".to_string(),
        })
    }

    async fn processes(&self) -> Result<Vec<ProcessInfo>> {
        Ok(vec![ProcessInfo {
            pid: 1,
            name: "init".to_string(),
        }])
    }

    async fn services(&self) -> Result<Vec<ServiceStatus>> {
        Ok(vec![ServiceStatus {
            name: "sshd".to_string(),
            display_name: "OpenSSH server".to_string(),
            status: "running".to_string(),
            start_type: "automatic".to_string(),
        }])
    }

    async fn disks(&self) -> Result<Vec<DiskInfo>> {
        Ok(Vec::new())
    }

    async fn software(&self) -> Result<Vec<SoftwareItem>> {
        Ok(Vec::new())
    }

    async fn wmi(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn event_log(&self, _log_name: &str, _days: u32) -> Result<Vec<EventLogEntry>> {
        Ok(Vec::new())
    }

    async fn public_ip(&self) -> Result<String> {
        bail!("public ip lookup disabled in tests")
    }
}

/// Records service operations instead of performing them.
#[derive(Default)]
pub struct FakeServiceOps {
    calls: Mutex<Vec<String>>,
}

impl FakeServiceOps {
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl ServiceOps for FakeServiceOps {
    async fn control(&self, name: &str, action: &str) -> Result<()> {
        locked(&self.calls).push(format!("control:{name}:{action}"));
        Ok(())
    }

    async fn edit(&self, name: &str, start_type: &str) -> Result<()> {
        locked(&self.calls).push(format!("edit:{name}:{start_type}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTaskOps {
    calls: Mutex<Vec<String>>,
}

impl FakeTaskOps {
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl TaskOps for FakeTaskOps {
    async fn create(&self, task: &TaskDescriptor) -> Result<()> {
        locked(&self.calls).push(format!("create:{}", task.name));
        Ok(())
    }

    async fn delete(&self, task_pk: i64) -> Result<()> {
        locked(&self.calls).push(format!("delete:{task_pk}"));
        Ok(())
    }
}

/// Power actions that only count invocations. `exit_process` records
/// instead of exiting so tests survive it.
#[derive(Default)]
pub struct FakePower {
    reboots: AtomicUsize,
    uninstalls: AtomicUsize,
    exits: AtomicUsize,
}

impl FakePower {
    #[must_use]
    pub fn reboots(&self) -> usize {
        self.reboots.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn uninstalls(&self) -> usize {
        self.uninstalls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn exits(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PowerOps for FakePower {
    async fn reboot(&self) -> Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exit_process(&self) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Update operations that count invocations, with an optional artificial
/// delay to widen concurrency windows in tests.
#[derive(Default)]
pub struct FakeUpdates {
    scans: AtomicUsize,
    installs: AtomicUsize,
    self_updates: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeUpdates {
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn scan_calls(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn install_calls(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn self_update_calls(&self) -> usize {
        self.self_updates.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl UpdateOps for FakeUpdates {
    async fn check_for_updates(&self) -> Result<()> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(())
    }

    async fn install_updates(&self) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(())
    }

    async fn self_update(&self, _version: &str, _url: &str) -> Result<()> {
        self.self_updates.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(())
    }
}

struct NoIdentity;

impl IdentityProvider for NoIdentity {
    fn interactive_user(&self) -> Option<LaunchAs> {
        None
    }
}

/// A fully wired test context plus handles to every fake for assertions.
pub struct TestCtx {
    pub ctx: Arc<AgentCtx>,
    pub transport: Arc<RecordingTransport>,
    pub services: Arc<FakeServiceOps>,
    pub tasks: Arc<FakeTaskOps>,
    pub power: Arc<FakePower>,
    pub updates: Arc<FakeUpdates>,
    /// Keeps the scratch dir alive for the test's duration.
    pub scratch: tempfile::TempDir,
}

/// Build a context on all-default fakes.
#[must_use]
pub fn test_ctx() -> TestCtx {
    test_ctx_with_updates(Arc::new(FakeUpdates::default()))
}

/// Build a context whose controller API base points at `api_url`.
#[must_use]
pub fn test_ctx_with_api_url(api_url: &str) -> TestCtx {
    let mut fixture = test_ctx();
    let mut config = fixture.ctx.config.clone();
    config.api_url = api_url.to_string();
    match Arc::get_mut(&mut fixture.ctx) {
        Some(ctx) => ctx.config = config,
        None => panic!("test context must be uniquely owned here"),
    }
    fixture
}

/// Build a context around a caller-supplied update fake.
#[must_use]
pub fn test_ctx_with_updates(updates: Arc<FakeUpdates>) -> TestCtx {
    let scratch = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("failed to create scratch dir: {e}"),
    };
    let config = AgentConfig::for_tests("agent-test", scratch.path().to_path_buf());

    let transport = RecordingTransport::new();
    let services = Arc::new(FakeServiceOps::default());
    let tasks = Arc::new(FakeTaskOps::default());
    let power = Arc::new(FakePower::default());

    let ctx = Arc::new(AgentCtx {
        version: "0.0.0-test".to_string(),
        transport: Arc::clone(&transport) as Arc<dyn Transport>,
        collectors: Arc::new(FakeCollectors),
        services: Arc::clone(&services) as Arc<dyn ServiceOps>,
        tasks: Arc::clone(&tasks) as Arc<dyn TaskOps>,
        power: Arc::clone(&power) as Arc<dyn PowerOps>,
        updates: Arc::clone(&updates) as Arc<dyn UpdateOps>,
        exclusion: Arc::new(ExclusionGuard::new()),
        script: ScriptExecutor::new(&config, Arc::new(NoIdentity)),
        sink: ResultSink::new(&config),
        config,
    });

    TestCtx {
        ctx,
        transport,
        services,
        tasks,
        power,
        updates,
        scratch,
    }
}
