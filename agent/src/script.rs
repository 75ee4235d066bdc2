//! Multi-shell script execution.
//!
//! A script job materializes its body into a temp file with the extension
//! the interpreter dispatches on, builds the interpreter-specific
//! invocation, and delegates to the process runner. The temp file is
//! deleted on every exit path — success, error, timeout — via the
//! `TempPath` RAII guard.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vigil_common::types::{CmdResult, ShellKind};

use crate::config::AgentConfig;
use crate::ports::IdentityProvider;
use crate::runner::{self, CmdMode, CmdSpec};

/// Magic environment variable: its value is stripped from the child env
/// and converted into deno CLI permission flags instead.
const DENO_PERMISSIONS_VAR: &str = "DENO_PERMISSIONS";

/// One script invocation.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub shell: ShellKind,
    pub body: String,
    /// Extra CLI args appended after the script path.
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Run in the interactive desktop user's context instead of the
    /// service account. Degrades gracefully when no such user exists.
    pub run_as_user: bool,
    pub env: Vec<(String, String)>,
    /// Nushell: load the default config file instead of `--no-config-file`.
    pub nushell_enable_config: bool,
    /// Deno: permission flags applied when the job carries none of its own.
    pub deno_default_permissions: Option<String>,
}

impl ScriptJob {
    #[must_use]
    pub fn new(shell: ShellKind, body: &str, timeout: Duration) -> Self {
        Self {
            shell,
            body: body.to_string(),
            args: Vec::new(),
            timeout,
            run_as_user: false,
            env: Vec::new(),
            nushell_enable_config: false,
            deno_default_permissions: None,
        }
    }
}

/// Executes script jobs. One instance is shared by all handlers; every job
/// gets its own uniquely-named temp file, so concurrent executions never
/// collide.
pub struct ScriptExecutor {
    scratch_dir: PathBuf,
    nushell_path: Option<PathBuf>,
    deno_path: Option<PathBuf>,
    deno_default_permissions: Option<String>,
    identity: Arc<dyn IdentityProvider>,
}

impl ScriptExecutor {
    #[must_use]
    pub fn new(config: &AgentConfig, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            scratch_dir: config.scratch_dir.clone(),
            nushell_path: config.nushell_path.clone(),
            deno_path: config.deno_path.clone(),
            deno_default_permissions: config.deno_default_permissions.clone(),
            identity,
        }
    }

    /// Run one script job to completion or timeout. Every failure mode is
    /// folded into the returned [`CmdResult`]; this never panics and never
    /// leaves the temp file behind.
    pub async fn run(&self, job: &ScriptJob) -> CmdResult {
        let body = normalize_line_endings(&job.body, job.shell);

        let temp = match self.materialize(&body, job.shell) {
            Ok(temp) => temp,
            Err(e) => {
                return CmdResult::spawn_failure(format!(
                    "failed to materialize script: {e}"
                ))
            }
        };
        let script_path = temp.to_string_lossy().into_owned();

        let mut env = job.env.clone();
        let mode = match self.build_invocation(job, &script_path, &mut env) {
            Ok(mode) => mode,
            Err(result) => return *result,
        };

        let launch_as = if job.run_as_user {
            match self.identity.interactive_user() {
                Some(launch) => {
                    tracing::debug!(user = %launch.user, "running script in interactive user context");
                    Some(launch)
                }
                None => {
                    tracing::debug!(
                        "no interactive user available, running as current identity"
                    );
                    None
                }
            }
        } else {
            None
        };

        let spec = CmdSpec {
            mode,
            timeout: job.timeout,
            detached: false,
            env,
            launch_as,
        };
        let result = runner::run(&spec).await;

        // `temp` (a TempPath) drops here, deleting the file on every path.
        drop(temp);
        result
    }

    /// Write the script body into a fresh uniquely-named temp file with
    /// the shell kind's extension, closing the write handle so the spawn
    /// does not hit "text file busy" on its own open descriptor.
    fn materialize(
        &self,
        body: &str,
        shell: ShellKind,
    ) -> std::io::Result<tempfile::TempPath> {
        use std::io::Write;

        let mut file = tempfile::Builder::new()
            .prefix("vigil-")
            .suffix(shell.extension())
            .tempfile_in(&self.scratch_dir)?;
        file.write_all(body.as_bytes())?;
        file.flush()?;

        let path = file.into_temp_path();

        #[cfg(unix)]
        if shell == ShellKind::Shell {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(path)
    }

    /// Build the interpreter invocation for one job. Returns the ready
    /// error result for missing/unsupported interpreters.
    fn build_invocation(
        &self,
        job: &ScriptJob,
        script_path: &str,
        env: &mut Vec<(String, String)>,
    ) -> Result<CmdMode, Box<CmdResult>> {
        let mode = match job.shell {
            // The temp file is executed directly so no shell
            // re-interpretation of the body occurs.
            ShellKind::Shell => CmdMode::Raw {
                program: script_path.to_string(),
                args: job.args.clone(),
            },
            ShellKind::Powershell => {
                let mut args = vec![
                    "-NonInteractive".to_string(),
                    "-NoProfile".to_string(),
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-File".to_string(),
                    script_path.to_string(),
                ];
                args.extend(job.args.clone());
                CmdMode::Raw {
                    program: powershell_binary().to_string(),
                    args,
                }
            }
            ShellKind::Python => {
                let mut args = vec![script_path.to_string()];
                args.extend(job.args.clone());
                CmdMode::Raw {
                    program: python_binary().to_string(),
                    args,
                }
            }
            ShellKind::Batch => {
                if cfg!(windows) {
                    let mut args = vec!["/C".to_string(), script_path.to_string()];
                    args.extend(job.args.clone());
                    CmdMode::Raw {
                        program: "cmd.exe".to_string(),
                        args,
                    }
                } else {
                    return Err(Box::new(CmdResult::missing_interpreter(
                        "batch scripts are only supported on Windows".to_string(),
                    )));
                }
            }
            ShellKind::Nushell => {
                let nu = self.resolve_optional("nushell", self.nushell_path.as_ref())?;
                let mut args = Vec::new();
                if !job.nushell_enable_config {
                    args.push("--no-config-file".to_string());
                }
                args.push(script_path.to_string());
                args.extend(job.args.clone());
                CmdMode::Raw { program: nu, args }
            }
            ShellKind::Deno => {
                let deno = self.resolve_optional("deno", self.deno_path.as_ref())?;
                let mut args = vec!["run".to_string(), "--no-prompt".to_string()];
                args.extend(self.deno_permission_flags(job, env));
                args.push(script_path.to_string());
                args.extend(job.args.clone());
                CmdMode::Raw {
                    program: deno,
                    args,
                }
            }
        };
        Ok(mode)
    }

    /// Optional interpreters fail fast with a clear "not installed" error
    /// instead of a generic spawn failure.
    fn resolve_optional(
        &self,
        name: &str,
        configured: Option<&PathBuf>,
    ) -> Result<String, Box<CmdResult>> {
        match configured {
            Some(path) if path.exists() => Ok(path.to_string_lossy().into_owned()),
            Some(path) => Err(Box::new(CmdResult::missing_interpreter(format!(
                "{name} not installed: {} does not exist",
                path.display()
            )))),
            None => Err(Box::new(CmdResult::missing_interpreter(format!(
                "{name} not installed: no interpreter path configured"
            )))),
        }
    }

    /// Resolve deno permission flags: the magic `DENO_PERMISSIONS` env var
    /// wins and is stripped from the child environment, then the job's
    /// default, then the agent-wide default.
    fn deno_permission_flags(
        &self,
        job: &ScriptJob,
        env: &mut Vec<(String, String)>,
    ) -> Vec<String> {
        if let Some(pos) = env.iter().position(|(k, _)| k == DENO_PERMISSIONS_VAR) {
            let (_, value) = env.remove(pos);
            return value.split_whitespace().map(str::to_string).collect();
        }
        job.deno_default_permissions
            .as_ref()
            .or(self.deno_default_permissions.as_ref())
            .map(|flags| flags.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Normalize line endings for the target platform: POSIX interpreters
/// choke on carriage returns from Windows-authored scripts. Native-shell
/// bodies without a shebang get the portable one prepended so direct
/// execution works.
fn normalize_line_endings(body: &str, shell: ShellKind) -> String {
    #[cfg(unix)]
    {
        let mut body = body.replace('\r', "");
        if shell == ShellKind::Shell && !body.starts_with("#!") {
            body.insert_str(0, "#!/bin/sh\n");
        }
        body
    }
    #[cfg(not(unix))]
    {
        let _ = shell;
        body.to_string()
    }
}

fn powershell_binary() -> &'static str {
    if cfg!(windows) {
        "powershell.exe"
    } else {
        "pwsh"
    }
}

fn python_binary() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}
