//! Port trait definitions for the agent core.
//!
//! The dispatch/execution core calls its OS collaborators through these
//! narrow contracts; their internals (WMI, COM, systemd, package managers)
//! are irrelevant to the core and swapped freely in tests.

use anyhow::Result;
use async_trait::async_trait;

use vigil_common::envelope::TaskDescriptor;
use vigil_common::types::{
    AgentInfo, DiskInfo, EventLogEntry, ProcessInfo, ServiceStatus, SoftwareItem,
};

/// Telemetry collectors: each is "collect → typed result, or error".
#[async_trait]
pub trait Collectors: Send + Sync {
    async fn agent_info(&self) -> Result<AgentInfo>;
    async fn processes(&self) -> Result<Vec<ProcessInfo>>;
    async fn services(&self) -> Result<Vec<ServiceStatus>>;
    async fn disks(&self) -> Result<Vec<DiskInfo>>;
    async fn software(&self) -> Result<Vec<SoftwareItem>>;
    async fn wmi(&self) -> Result<serde_json::Value>;
    async fn event_log(&self, log_name: &str, days: u32) -> Result<Vec<EventLogEntry>>;
    async fn public_ip(&self) -> Result<String>;
}

/// OS service management.
#[async_trait]
pub trait ServiceOps: Send + Sync {
    /// Start/stop/restart a service.
    async fn control(&self, name: &str, action: &str) -> Result<()>;
    /// Change a service's startup type.
    async fn edit(&self, name: &str, start_type: &str) -> Result<()>;
}

/// Scheduled-task management.
#[async_trait]
pub trait TaskOps: Send + Sync {
    async fn create(&self, task: &TaskDescriptor) -> Result<()>;
    async fn delete(&self, task_pk: i64) -> Result<()>;
}

/// Actions that may terminate the agent process itself.
#[async_trait]
pub trait PowerOps: Send + Sync {
    async fn reboot(&self) -> Result<()>;
    async fn uninstall(&self) -> Result<()>;
    /// Deliberate self-termination after a successful self-update; the
    /// supervised restart picks up the replaced binary.
    fn exit_process(&self);
}

/// Update flows. All three are serialized by the exclusion guard at the
/// handler layer; implementations may assume single flight per method.
#[async_trait]
pub trait UpdateOps: Send + Sync {
    async fn check_for_updates(&self) -> Result<()>;
    async fn install_updates(&self) -> Result<()>;
    async fn self_update(&self, version: &str, url: &str) -> Result<()>;
}

/// Launch context for running a child as the interactive desktop user:
/// the resolved account, optional POSIX ids, and that identity's
/// environment block. The block sits under the job's own env overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchAs {
    pub user: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub env: Vec<(String, String)>,
}

/// Resolves the interactive desktop user for run-as-user script jobs.
/// Returning `None` degrades gracefully to the current identity.
pub trait IdentityProvider: Send + Sync {
    fn interactive_user(&self) -> Option<LaunchAs>;
}
