//! Default telemetry collectors.
//!
//! The dispatch core only depends on the `Collectors` port; this module
//! provides the production implementation for what is portable. Inventory
//! collectors with platform-specific backends (WMI, event log, installed
//! software, service enumeration) return empty sets here — their real
//! implementations are pluggable collaborators wired in per platform
//! build, and the core's behavior does not depend on their internals.

use anyhow::{Context, Result};
use async_trait::async_trait;

use vigil_common::types::{
    AgentInfo, DiskInfo, EventLogEntry, ProcessInfo, ServiceStatus, SoftwareItem,
};

use crate::ports::Collectors;

/// Where the public IP is looked up. Plain-text body containing the address.
const PUBLIC_IP_URL: &str = "https://icanhazip.com";

pub struct SystemCollectors {
    agent_id: String,
    version: String,
    http: reqwest::Client,
}

impl SystemCollectors {
    #[must_use]
    pub fn new(agent_id: &str, version: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            version: version.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Collectors for SystemCollectors {
    async fn agent_info(&self) -> Result<AgentInfo> {
        let host = hostname::get()
            .context("failed to read hostname")?
            .to_string_lossy()
            .into_owned();
        Ok(AgentInfo {
            agent_id: self.agent_id.clone(),
            hostname: host,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: self.version.clone(),
        })
    }

    #[cfg(target_os = "linux")]
    async fn processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut procs = Vec::new();
        for entry in std::fs::read_dir("/proc").context("failed to read /proc")? {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
                continue;
            };
            procs.push(ProcessInfo {
                pid,
                name: comm.trim_end().to_string(),
            });
        }
        Ok(procs)
    }

    #[cfg(not(target_os = "linux"))]
    async fn processes(&self) -> Result<Vec<ProcessInfo>> {
        tracing::debug!("process collector not implemented on this platform");
        Ok(Vec::new())
    }

    async fn services(&self) -> Result<Vec<ServiceStatus>> {
        tracing::debug!("service collector not implemented on this platform");
        Ok(Vec::new())
    }

    async fn disks(&self) -> Result<Vec<DiskInfo>> {
        tracing::debug!("disk collector not implemented on this platform");
        Ok(Vec::new())
    }

    async fn software(&self) -> Result<Vec<SoftwareItem>> {
        tracing::debug!("software collector not implemented on this platform");
        Ok(Vec::new())
    }

    async fn wmi(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn event_log(&self, log_name: &str, _days: u32) -> Result<Vec<EventLogEntry>> {
        tracing::debug!(log_name, "event log collector not implemented on this platform");
        Ok(Vec::new())
    }

    async fn public_ip(&self) -> Result<String> {
        let body = self
            .http
            .get(PUBLIC_IP_URL)
            .send()
            .await
            .context("public IP lookup failed")?
            .text()
            .await
            .context("public IP body read failed")?;
        Ok(body.trim().to_string())
    }
}
