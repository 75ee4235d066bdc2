//! The built-in handler set, one type per wire function name.
//!
//! Handlers fold their own failures into the reply payload instead of
//! propagating them — from the dispatcher's point of view a handler always
//! produces exactly one reply (or has already sent it).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use vigil_common::checkin::Signal;
use vigil_common::envelope::Envelope;
use vigil_common::types::{ActionOutcome, ShellKind};

use crate::dispatch::{AgentCtx, Handler, Reply};
use crate::exclusion::classes;
use crate::proc_tree;
use crate::runner::{self, CmdSpec};
use crate::script::ScriptJob;

/// Default timeout for `rawcmd` envelopes that carry none.
const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for script envelopes that carry none.
const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Busy sentinel for update-class collisions, preserved verbatim for wire
/// compatibility.
const UPDATE_BUSY: &str = "updaterunning";

/// Build the full function-name → handler table.
#[must_use]
pub fn registry() -> HashMap<&'static str, Arc<dyn Handler>> {
    let mut map: HashMap<&'static str, Arc<dyn Handler>> = HashMap::new();
    map.insert("ping", Arc::new(Ping));
    map.insert("procs", Arc::new(Procs));
    map.insert("killproc", Arc::new(KillProc));
    map.insert("rawcmd", Arc::new(RawCmd));
    map.insert("runscript", Arc::new(RunScript { full: false }));
    map.insert("runscriptfull", Arc::new(RunScript { full: true }));
    map.insert("svcs", Arc::new(ListServices));
    map.insert("svcaction", Arc::new(ServiceAction));
    map.insert("editsvc", Arc::new(EditService));
    map.insert("eventlog", Arc::new(EventLog));
    map.insert("schedtask", Arc::new(CreateTask));
    map.insert("delschedtask", Arc::new(DeleteTask));
    map.insert("agentupdate", Arc::new(AgentUpdate));
    map.insert("updatescan", Arc::new(UpdateScan));
    map.insert("installupdates", Arc::new(InstallUpdates));
    map.insert("rebootnow", Arc::new(RebootNow));
    map.insert("uninstall", Arc::new(Uninstall));
    map.insert("sync", Arc::new(SyncNow));
    map.insert("wmi", Arc::new(WmiNow));
    map
}

fn outcome_of(result: anyhow::Result<()>) -> Reply {
    match result {
        Ok(()) => Reply::Outcome(ActionOutcome::ok()),
        Err(e) => Reply::Outcome(ActionOutcome::failed(format!("{e:#}"))),
    }
}

/// Liveness probe.
pub struct Ping;

#[async_trait]
impl Handler for Ping {
    async fn handle(&self, _ctx: &AgentCtx, _envelope: &Envelope) -> Reply {
        Reply::Raw("pong".to_string())
    }
}

/// Running-process snapshot.
pub struct Procs;

#[async_trait]
impl Handler for Procs {
    async fn handle(&self, ctx: &AgentCtx, _envelope: &Envelope) -> Reply {
        match ctx.collectors.processes().await {
            Ok(procs) => Reply::Procs(procs),
            Err(e) => Reply::Raw(format!("{e:#}")),
        }
    }
}

/// Kill a process and all of its descendants.
pub struct KillProc;

#[async_trait]
impl Handler for KillProc {
    async fn handle(&self, _ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let Some(pid) = envelope.proc_pid else {
            return Reply::Outcome(ActionOutcome::failed(
                "killproc envelope missing procpid".to_string(),
            ));
        };
        proc_tree::kill_tree(pid).await;
        Reply::Outcome(ActionOutcome::ok())
    }
}

/// One shell command line, combined output back as a single string.
pub struct RawCmd;

#[async_trait]
impl Handler for RawCmd {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let Some(line) = envelope.payload.get("command") else {
            return Reply::Raw("no command provided".to_string());
        };
        let shell = envelope
            .payload
            .get("shell")
            .cloned()
            .unwrap_or_else(|| default_shell().to_string());
        let timeout = envelope
            .timeout
            .map_or(DEFAULT_CMD_TIMEOUT, Duration::from_secs);

        let mut spec = CmdSpec::shell_line(&shell, line, timeout);
        spec.env = envelope.env_pairs();
        let result = runner::run(&spec).await;

        ctx.post_correlated_result(envelope, &result).await;
        Reply::Raw(result.combined_output())
    }
}

/// Script execution. `full: false` replies with combined output only;
/// `full: true` replies with the structured result.
pub struct RunScript {
    pub full: bool,
}

#[async_trait]
impl Handler for RunScript {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let Some(body) = envelope.code.as_deref() else {
            return Reply::Raw("no script body provided".to_string());
        };
        let shell = match envelope.payload.get("shell").map(String::as_str) {
            None => ShellKind::Shell,
            Some(name) => match ShellKind::parse(name) {
                Some(kind) => kind,
                None => return Reply::Raw(format!("unsupported shell: {name}")),
            },
        };
        let timeout = envelope
            .timeout
            .map_or(DEFAULT_SCRIPT_TIMEOUT, Duration::from_secs);

        let mut job = ScriptJob::new(shell, body, timeout);
        job.args = envelope.script_args.clone();
        job.env = envelope.env_pairs();
        job.run_as_user = payload_flag(envelope, "run_as_user");
        job.nushell_enable_config = payload_flag(envelope, "nushell_enable_config");
        job.deno_default_permissions = envelope.payload.get("deno_default_permissions").cloned();

        let result = ctx.script.run(&job).await;
        ctx.post_correlated_result(envelope, &result).await;

        if self.full {
            Reply::Cmd(result)
        } else {
            Reply::Raw(result.combined_output())
        }
    }
}

fn payload_flag(envelope: &Envelope, key: &str) -> bool {
    matches!(
        envelope.payload.get(key).map(String::as_str),
        Some("1" | "true")
    )
}

fn default_shell() -> &'static str {
    if cfg!(windows) {
        "cmd.exe"
    } else {
        "/bin/sh"
    }
}

/// Service inventory snapshot.
pub struct ListServices;

#[async_trait]
impl Handler for ListServices {
    async fn handle(&self, ctx: &AgentCtx, _envelope: &Envelope) -> Reply {
        match ctx.collectors.services().await {
            Ok(services) => Reply::Services(services),
            Err(e) => Reply::Raw(format!("{e:#}")),
        }
    }
}

/// Start/stop/restart one service.
pub struct ServiceAction;

#[async_trait]
impl Handler for ServiceAction {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let (Some(name), Some(action)) = (
            envelope.payload.get("name"),
            envelope.payload.get("action"),
        ) else {
            return Reply::Outcome(ActionOutcome::failed(
                "svcaction envelope missing name or action".to_string(),
            ));
        };
        outcome_of(ctx.services.control(name, action).await)
    }
}

/// Change one service's startup type.
pub struct EditService;

#[async_trait]
impl Handler for EditService {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let (Some(name), Some(start_type)) = (
            envelope.payload.get("name"),
            envelope.payload.get("start_type"),
        ) else {
            return Reply::Outcome(ActionOutcome::failed(
                "editsvc envelope missing name or start_type".to_string(),
            ));
        };
        outcome_of(ctx.services.edit(name, start_type).await)
    }
}

/// Event-log query.
pub struct EventLog;

#[async_trait]
impl Handler for EventLog {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let log_name = envelope
            .payload
            .get("logname")
            .map_or("System", String::as_str);
        let days = envelope
            .payload
            .get("days")
            .and_then(|d| d.parse::<u32>().ok())
            .unwrap_or(1);
        match ctx.collectors.event_log(log_name, days).await {
            Ok(entries) => Reply::EventLog(entries),
            Err(e) => Reply::Raw(format!("{e:#}")),
        }
    }
}

/// Create one scheduled task from the envelope's descriptor.
pub struct CreateTask;

#[async_trait]
impl Handler for CreateTask {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let Some(task) = envelope.task.as_ref() else {
            return Reply::Outcome(ActionOutcome::failed(
                "schedtask envelope missing task descriptor".to_string(),
            ));
        };
        outcome_of(ctx.tasks.create(task).await)
    }
}

/// Delete one scheduled task by its controller-side primary key.
pub struct DeleteTask;

#[async_trait]
impl Handler for DeleteTask {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let Some(task_pk) = envelope.task_pk else {
            return Reply::Outcome(ActionOutcome::failed(
                "delschedtask envelope missing taskpk".to_string(),
            ));
        };
        outcome_of(ctx.tasks.delete(task_pk).await)
    }
}

/// Agent self-update: ack first, then download/hand off, then exit so the
/// supervisor restarts into the replaced binary.
pub struct AgentUpdate;

#[async_trait]
impl Handler for AgentUpdate {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let Some(_permit) = ctx.exclusion.try_acquire(classes::AGENT_UPDATE) else {
            return Reply::Raw(UPDATE_BUSY.to_string());
        };
        let (Some(version), Some(url)) = (
            envelope.payload.get("version"),
            envelope.payload.get("url"),
        ) else {
            return Reply::Raw("agentupdate envelope missing version or url".to_string());
        };

        // Ack before the long download; the caller would otherwise time
        // out waiting while the binary transfers.
        ctx.publish_reply(envelope, &Reply::ok()).await;

        match ctx.updates.self_update(version, url).await {
            Ok(()) => {
                if let Err(e) = ctx.transport.flush().await {
                    tracing::warn!(error = format!("{e:#}"), "flush before exit failed");
                }
                ctx.power.exit_process();
            }
            Err(e) => {
                tracing::error!(version = %version, error = format!("{e:#}"), "self-update failed");
            }
        }
        Reply::AlreadySent
    }
}

/// Patch scan, single flight.
pub struct UpdateScan;

#[async_trait]
impl Handler for UpdateScan {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let Some(_permit) = ctx.exclusion.try_acquire(classes::UPDATE_SCAN) else {
            return Reply::Raw(UPDATE_BUSY.to_string());
        };
        ctx.publish_reply(envelope, &Reply::ok()).await;
        if let Err(e) = ctx.updates.check_for_updates().await {
            tracing::error!(error = format!("{e:#}"), "update scan failed");
        }
        Reply::AlreadySent
    }
}

/// Patch install, single flight.
pub struct InstallUpdates;

#[async_trait]
impl Handler for InstallUpdates {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        let Some(_permit) = ctx.exclusion.try_acquire(classes::UPDATE_INSTALL) else {
            return Reply::Raw(UPDATE_BUSY.to_string());
        };
        ctx.publish_reply(envelope, &Reply::ok()).await;
        if let Err(e) = ctx.updates.install_updates().await {
            tracing::error!(error = format!("{e:#}"), "update install failed");
        }
        Reply::AlreadySent
    }
}

/// Reboot the machine. The ack goes out and is flushed before the action,
/// since the action may take the transport down with it.
pub struct RebootNow;

#[async_trait]
impl Handler for RebootNow {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        ctx.publish_reply(envelope, &Reply::ok()).await;
        if let Err(e) = ctx.transport.flush().await {
            tracing::warn!(error = format!("{e:#}"), "flush before reboot failed");
        }
        if let Err(e) = ctx.power.reboot().await {
            tracing::error!(error = format!("{e:#}"), "reboot failed");
        }
        Reply::AlreadySent
    }
}

/// Remove the agent from this machine.
pub struct Uninstall;

#[async_trait]
impl Handler for Uninstall {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply {
        ctx.publish_reply(envelope, &Reply::ok()).await;
        if let Err(e) = ctx.transport.flush().await {
            tracing::warn!(error = format!("{e:#}"), "flush before uninstall failed");
        }
        if let Err(e) = ctx.power.uninstall().await {
            tracing::error!(error = format!("{e:#}"), "uninstall failed");
        }
        Reply::AlreadySent
    }
}

/// Immediate out-of-cadence sync telemetry push.
pub struct SyncNow;

#[async_trait]
impl Handler for SyncNow {
    async fn handle(&self, ctx: &AgentCtx, _envelope: &Envelope) -> Reply {
        crate::checkin::push_signal(ctx, Signal::Sync).await;
        Reply::ok()
    }
}

/// Immediate out-of-cadence WMI telemetry push.
pub struct WmiNow;

#[async_trait]
impl Handler for WmiNow {
    async fn handle(&self, ctx: &AgentCtx, _envelope: &Envelope) -> Reply {
        crate::checkin::push_signal(ctx, Signal::Wmi).await;
        Reply::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_ctx, TestCtx};

    fn envelope_with(func: &str, pairs: &[(&str, &str)]) -> Envelope {
        let mut envelope = Envelope::for_func(func);
        for (k, v) in pairs {
            envelope
                .payload
                .insert((*k).to_string(), (*v).to_string());
        }
        envelope
    }

    #[tokio::test]
    async fn test_ping_replies_pong() {
        let TestCtx { ctx, .. } = test_ctx();
        let reply = Ping.handle(&ctx, &Envelope::for_func("ping")).await;
        assert_eq!(reply, Reply::Raw("pong".to_string()));
    }

    #[tokio::test]
    async fn test_killproc_without_pid_fails_cleanly() {
        let TestCtx { ctx, .. } = test_ctx();
        let reply = KillProc.handle(&ctx, &Envelope::for_func("killproc")).await;
        let Reply::Outcome(outcome) = reply else {
            panic!("expected an outcome reply");
        };
        assert!(!outcome.success);
        assert!(outcome.detail.contains("procpid"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rawcmd_returns_combined_output() {
        let TestCtx { ctx, .. } = test_ctx();
        let envelope = envelope_with("rawcmd", &[("command", "echo out; echo err >&2")]);
        let reply = RawCmd.handle(&ctx, &envelope).await;
        assert_eq!(reply, Reply::Raw("out\nerr\n".to_string()));
    }

    #[tokio::test]
    async fn test_rawcmd_without_command_is_an_error_string() {
        let TestCtx { ctx, .. } = test_ctx();
        let reply = RawCmd.handle(&ctx, &envelope_with("rawcmd", &[])).await;
        assert_eq!(reply, Reply::Raw("no command provided".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runscript_full_returns_structured_result() {
        // Hold the whole fixture: the scratch dir must outlive the run.
        let fixture = test_ctx();
        let ctx = &fixture.ctx;
        let mut envelope = envelope_with("runscriptfull", &[("shell", "shell")]);
        envelope.code = Some("echo scripted".to_string());
        let reply = RunScript { full: true }.handle(&ctx, &envelope).await;
        let Reply::Cmd(result) = reply else {
            panic!("expected a structured result");
        };
        assert_eq!(result.stdout, "scripted\n");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_runscript_rejects_unknown_shell() {
        let TestCtx { ctx, .. } = test_ctx();
        let mut envelope = envelope_with("runscript", &[("shell", "ruby")]);
        envelope.code = Some("puts 1".to_string());
        let reply = RunScript { full: false }.handle(&ctx, &envelope).await;
        assert_eq!(reply, Reply::Raw("unsupported shell: ruby".to_string()));
    }

    #[tokio::test]
    async fn test_svcaction_routes_to_service_ops() {
        let TestCtx { ctx, services, .. } = test_ctx();
        let envelope = envelope_with("svcaction", &[("name", "sshd"), ("action", "restart")]);
        let reply = ServiceAction.handle(&ctx, &envelope).await;
        assert_eq!(reply, Reply::Outcome(ActionOutcome::ok()));
        assert_eq!(
            services.calls(),
            vec!["control:sshd:restart".to_string()]
        );
    }

    #[tokio::test]
    async fn test_update_busy_sentinel_when_class_held() {
        let TestCtx { ctx, .. } = test_ctx();
        let _held = ctx
            .exclusion
            .try_acquire(classes::UPDATE_INSTALL)
            .expect("class free");
        let reply = InstallUpdates
            .handle(&ctx, &Envelope::for_func("installupdates"))
            .await;
        assert_eq!(reply, Reply::Raw(UPDATE_BUSY.to_string()));
    }

    #[tokio::test]
    async fn test_installupdates_acks_before_work_and_releases_class() {
        let TestCtx {
            ctx,
            transport,
            updates,
            ..
        } = test_ctx();
        let mut envelope = Envelope::for_func("installupdates");
        envelope.reply_to = Some("vigil.reply.1".to_string());

        let reply = InstallUpdates.handle(&ctx, &envelope).await;
        assert_eq!(reply, Reply::AlreadySent);
        assert_eq!(updates.install_calls(), 1);
        assert!(!ctx.exclusion.is_held(classes::UPDATE_INSTALL));

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "vigil.reply.1");
        let ack: String = vigil_common::envelope::decode(&published[0].1).expect("decode ack");
        assert_eq!(ack, "ok");
    }

    #[tokio::test]
    async fn test_rebootnow_acks_then_flushes_then_acts() {
        let TestCtx {
            ctx,
            transport,
            power,
            ..
        } = test_ctx();
        let mut envelope = Envelope::for_func("rebootnow");
        envelope.reply_to = Some("vigil.reply.2".to_string());

        let reply = RebootNow.handle(&ctx, &envelope).await;
        assert_eq!(reply, Reply::AlreadySent);
        assert_eq!(transport.published().len(), 1);
        assert_eq!(transport.flushes(), 1);
        assert_eq!(power.reboots(), 1);
    }

    #[tokio::test]
    async fn test_sync_pushes_telemetry_and_acks() {
        let TestCtx { ctx, transport, .. } = test_ctx();
        let reply = SyncNow.handle(&ctx, &Envelope::for_func("sync")).await;
        assert_eq!(reply, Reply::ok());
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].0,
            crate::transport::subjects::checkin(Signal::Sync)
        );
    }

    #[test]
    fn test_registry_covers_the_full_function_set() {
        let registry = registry();
        for func in [
            "ping",
            "procs",
            "killproc",
            "rawcmd",
            "runscript",
            "runscriptfull",
            "svcs",
            "svcaction",
            "editsvc",
            "eventlog",
            "schedtask",
            "delschedtask",
            "agentupdate",
            "updatescan",
            "installupdates",
            "rebootnow",
            "uninstall",
            "sync",
            "wmi",
        ] {
            assert!(registry.contains_key(func), "missing handler for {func}");
        }
    }
}
