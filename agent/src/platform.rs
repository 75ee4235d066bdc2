//! Production implementations of the OS-action ports.
//!
//! Everything here is a thin wrapper over platform tooling, routed through
//! the process runner so the same timeout/kill guarantees apply.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use vigil_common::envelope::TaskDescriptor;

use crate::config::AgentConfig;
use crate::ports::{IdentityProvider, LaunchAs, PowerOps, TaskOps, UpdateOps};
use crate::runner::{self, CmdMode, CmdSpec};

const SERVICE_OP_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Service management via the platform service manager.
pub struct SystemServices;

#[async_trait]
impl crate::ports::ServiceOps for SystemServices {
    async fn control(&self, name: &str, action: &str) -> Result<()> {
        if !matches!(action, "start" | "stop" | "restart") {
            bail!("unsupported service action: {action}");
        }
        let spec = CmdSpec::new(
            CmdMode::Raw {
                program: service_manager().to_string(),
                args: vec![action.to_string(), name.to_string()],
            },
            SERVICE_OP_TIMEOUT,
        );
        let result = runner::run(&spec).await;
        if result.exit_code != 0 {
            bail!(
                "service {action} {name} failed (exit {}): {}",
                result.exit_code,
                result.combined_output().trim()
            );
        }
        Ok(())
    }

    async fn edit(&self, name: &str, start_type: &str) -> Result<()> {
        let action = match start_type {
            "automatic" => "enable",
            "manual" | "disabled" => "disable",
            other => bail!("unsupported startup type: {other}"),
        };
        let spec = CmdSpec::new(
            CmdMode::Raw {
                program: service_manager().to_string(),
                args: vec![action.to_string(), name.to_string()],
            },
            SERVICE_OP_TIMEOUT,
        );
        let result = runner::run(&spec).await;
        if result.exit_code != 0 {
            bail!(
                "service edit {name} failed (exit {}): {}",
                result.exit_code,
                result.combined_output().trim()
            );
        }
        Ok(())
    }
}

fn service_manager() -> &'static str {
    if cfg!(windows) {
        "sc.exe"
    } else {
        "systemctl"
    }
}

/// Scheduled tasks. The base agent carries the port; the platform task
/// scheduler backend ships separately, so creates/deletes fail with a
/// clear message rather than pretending to succeed.
pub struct SystemTasks;

#[async_trait]
impl TaskOps for SystemTasks {
    async fn create(&self, task: &TaskDescriptor) -> Result<()> {
        bail!(
            "scheduled task '{}' not created: task scheduler backend not available on this build",
            task.name
        );
    }

    async fn delete(&self, task_pk: i64) -> Result<()> {
        bail!("scheduled task {task_pk} not deleted: task scheduler backend not available on this build");
    }
}

/// Reboot/uninstall and deliberate self-termination.
pub struct SystemPower;

#[async_trait]
impl PowerOps for SystemPower {
    async fn reboot(&self) -> Result<()> {
        let (program, args) = if cfg!(windows) {
            ("shutdown.exe", vec!["/r", "/t", "5"])
        } else {
            ("shutdown", vec!["-r", "now"])
        };
        let spec = CmdSpec::new(
            CmdMode::Raw {
                program: program.to_string(),
                args: args.into_iter().map(str::to_string).collect(),
            },
            Duration::from_secs(30),
        );
        let result = runner::run(&spec).await;
        if let Some(err) = result.error {
            bail!("reboot failed: {err}");
        }
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        // The uninstaller has to outlive this process, so it is detached.
        let mut spec = CmdSpec::shell_line(
            default_shell(),
            uninstall_command(),
            Duration::from_secs(30),
        );
        spec.detached = true;
        let result = runner::run(&spec).await;
        if let Some(err) = result.error {
            bail!("uninstall failed: {err}");
        }
        Ok(())
    }

    fn exit_process(&self) {
        tracing::info!("agent exiting for supervised restart");
        std::process::exit(0);
    }
}

fn default_shell() -> &'static str {
    if cfg!(windows) {
        "cmd.exe"
    } else {
        "/bin/sh"
    }
}

fn uninstall_command() -> &'static str {
    if cfg!(windows) {
        r"C:\Program Files\Vigil\uninstall.exe /S"
    } else {
        "/opt/vigil/uninstall.sh"
    }
}

/// Update flows driven by the controller.
pub struct ControllerUpdates {
    http: reqwest::Client,
    scratch_dir: std::path::PathBuf,
}

impl ControllerUpdates {
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            scratch_dir: config.scratch_dir.clone(),
        }
    }
}

#[async_trait]
impl UpdateOps for ControllerUpdates {
    async fn check_for_updates(&self) -> Result<()> {
        // Patch scanning is a platform collaborator (COM on Windows); the
        // base build has nothing to scan.
        tracing::info!("update scan requested, no patch backend on this build");
        Ok(())
    }

    async fn install_updates(&self) -> Result<()> {
        tracing::info!("update install requested, no patch backend on this build");
        Ok(())
    }

    /// Download the replacement binary and hand off to a detached
    /// installer process. The caller terminates this process afterwards.
    async fn self_update(&self, version: &str, url: &str) -> Result<()> {
        tracing::info!(version, url, "starting agent self-update");

        let bytes = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("failed to download update from {url}"))?
            .error_for_status()
            .context("update download returned an error status")?
            .bytes()
            .await
            .context("failed to read update body")?;

        let installer = self
            .scratch_dir
            .join(format!("vigil-update-{version}{}", installer_ext()));
        tokio::fs::write(&installer, &bytes)
            .await
            .with_context(|| format!("failed to write {}", installer.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&installer, std::fs::Permissions::from_mode(0o700))
                .context("failed to mark installer executable")?;
        }

        let mut spec = CmdSpec::new(
            CmdMode::SingleArgString {
                program: installer.to_string_lossy().into_owned(),
                arg: "-silent -upgrade".to_string(),
            },
            Duration::from_secs(30),
        );
        spec.detached = true;
        let result = runner::run(&spec).await;
        if let Some(err) = result.error {
            bail!("failed to launch installer: {err}");
        }

        tracing::info!(version, "installer launched, agent will exit");
        Ok(())
    }
}

fn installer_ext() -> &'static str {
    if cfg!(windows) {
        ".exe"
    } else {
        ""
    }
}

/// Base identity provider: no interactive desktop session is tracked, so
/// run-as-user jobs degrade to the current identity.
pub struct ServiceIdentity;

impl IdentityProvider for ServiceIdentity {
    fn interactive_user(&self) -> Option<LaunchAs> {
        None
    }
}
