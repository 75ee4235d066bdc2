//! The process-execution primitive.
//!
//! [`run`] spawns a program or shell line, streams stdout/stderr into
//! buffers as output arrives, enforces a wall-clock timeout, and on expiry
//! kills the whole descendant process tree — shell wrappers and script
//! interpreters commonly fork children that would otherwise survive the
//! direct child's death.
//!
//! `tokio::time::timeout` around `.output().await` does not kill the child
//! when the timeout fires — the future is dropped but the OS process keeps
//! running. This module races `child.wait()` against a sleep inside
//! `tokio::select!` with an explicit tree kill, so `run` never blocks past
//! the timeout even when the child ignores termination for its own handle.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use vigil_common::types::{sanitize_output, CmdResult, TIMEOUT_EXIT_CODE};

use crate::ports::LaunchAs;
use crate::proc_tree;

/// Bounded retries for the POSIX "text file busy" quirk: spawning a temp
/// script right after writing it can race the dirty-page writeback.
const ETXTBSY_RETRIES: u32 = 5;
const ETXTBSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How the OS-level invocation is built. Exactly one mode is active by
/// construction.
#[derive(Debug, Clone)]
pub enum CmdMode {
    /// Pass the argument vector directly to the target binary. Used when
    /// the "binary" is itself a temp script file, so no shell
    /// re-interpretation occurs.
    Raw { program: String, args: Vec<String> },
    /// Tokenize a shell plus `-c <line>` (POSIX) or `/C <line>` (Windows).
    ShellLine { shell: String, line: String },
    /// Pass the whole remaining string as one argv element, for helper
    /// binaries with custom argument parsing.
    SingleArgString { program: String, arg: String },
}

impl CmdMode {
    /// The program that will be spawned, for error messages.
    #[must_use]
    pub fn program(&self) -> &str {
        match self {
            Self::Raw { program, .. }
            | Self::SingleArgString { program, .. } => program,
            Self::ShellLine { shell, .. } => shell,
        }
    }
}

/// One command to execute.
#[derive(Debug, Clone)]
pub struct CmdSpec {
    pub mode: CmdMode,
    /// Wall-clock limit; values below one second are clamped up to one.
    pub timeout: Duration,
    /// Spawn in a new process group so parent exit or termination does not
    /// take the child down with it.
    pub detached: bool,
    /// Appended over the inherited environment; later entries win.
    pub env: Vec<(String, String)>,
    /// Launch the child under this identity's context. Its environment
    /// block is applied first, so `env` entries override it.
    pub launch_as: Option<LaunchAs>,
}

impl CmdSpec {
    #[must_use]
    pub fn new(mode: CmdMode, timeout: Duration) -> Self {
        Self {
            mode,
            timeout,
            detached: false,
            env: Vec::new(),
            launch_as: None,
        }
    }

    /// Shell-line invocation with the platform's default shell.
    #[must_use]
    pub fn shell_line(shell: &str, line: &str, timeout: Duration) -> Self {
        Self::new(
            CmdMode::ShellLine {
                shell: shell.to_string(),
                line: line.to_string(),
            },
            timeout,
        )
    }
}

/// Execute `spec` to completion or timeout. Never panics; every failure
/// mode is folded into the returned [`CmdResult`].
pub async fn run(spec: &CmdSpec) -> CmdResult {
    let timeout = spec.timeout.max(Duration::from_secs(1));

    let mut cmd = build_command(spec);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(!spec.detached);

    let mut child = match spawn_with_retry(&mut cmd, spec.mode.program()).await {
        Ok(child) => child,
        Err(result) => return *result,
    };
    let pid = child.id();

    // Stream both pipes into shared buffers as output arrives, so a
    // long-running command's partial output is observable after a timeout
    // kill.
    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = tokio::spawn(drain_into(child.stdout.take(), Arc::clone(&stdout_buf)));
    let stderr_task = tokio::spawn(drain_into(child.stderr.take(), Arc::clone(&stderr_buf)));

    let mut timed_out = false;
    let mut error = None;
    let exit_code;

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => exit_code = status.code().unwrap_or(-1),
                Err(e) => {
                    exit_code = -1;
                    error = Some(format!("waiting for {} failed: {e}", spec.mode.program()));
                }
            }
        }
        () = tokio::time::sleep(timeout) => {
            if let Some(pid) = pid {
                proc_tree::kill_tree(pid).await;
            }
            // Kill failures are swallowed: the tree kill above usually got
            // there first and the postcondition already holds.
            let _ = child.kill().await;
            let _ = child.wait().await;
            timed_out = true;
            exit_code = TIMEOUT_EXIT_CODE;
            tracing::warn!(
                program = spec.mode.program(),
                timeout_secs = timeout.as_secs(),
                "command timed out, process tree killed",
            );
        }
    }

    // After exit (or tree kill) the pipe write ends are closed, so both
    // readers run to EOF.
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let stdout = take_sanitized(&stdout_buf);
    let mut stderr = take_sanitized(&stderr_buf);
    if timed_out {
        stderr.push_str(&format!(
            "\ntimeout: command exceeded {}s and was killed",
            timeout.as_secs()
        ));
    }

    CmdResult {
        stdout,
        stderr,
        exit_code,
        timed_out,
        error,
    }
}

fn build_command(spec: &CmdSpec) -> Command {
    let mut cmd = match &spec.mode {
        CmdMode::Raw { program, args } => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
        CmdMode::ShellLine { shell, line } => {
            let mut cmd = Command::new(shell);
            #[cfg(unix)]
            cmd.arg("-c").arg(line);
            #[cfg(windows)]
            cmd.arg("/C").arg(line);
            cmd
        }
        CmdMode::SingleArgString { program, arg } => {
            let mut cmd = Command::new(program);
            cmd.arg(arg);
            cmd
        }
    };

    if spec.detached {
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        {
            // DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP
            cmd.creation_flags(0x0000_0008 | 0x0000_0200);
        }
    }

    if let Some(launch) = &spec.launch_as {
        #[cfg(unix)]
        {
            if let Some(uid) = launch.uid {
                cmd.uid(uid);
            }
            if let Some(gid) = launch.gid {
                cmd.gid(gid);
            }
        }
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }
    }

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    cmd
}

/// Spawn, retrying the ETXTBSY quirk a bounded number of times. On
/// unrecoverable failure returns the ready-made spawn-failure result.
async fn spawn_with_retry(
    cmd: &mut Command,
    program: &str,
) -> Result<tokio::process::Child, Box<CmdResult>> {
    let mut attempts = 0;
    loop {
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if is_text_file_busy(&e) && attempts < ETXTBSY_RETRIES => {
                attempts += 1;
                tracing::debug!(program, attempts, "text file busy, retrying spawn");
                tokio::time::sleep(ETXTBSY_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(Box::new(CmdResult::spawn_failure(format!(
                    "failed to spawn {program}: {e}"
                ))));
            }
        }
    }
}

#[cfg(unix)]
fn is_text_file_busy(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
}

#[cfg(not(unix))]
fn is_text_file_busy(_e: &std::io::Error) -> bool {
    false
}

async fn drain_into<R: AsyncRead + Unpin + Send>(reader: Option<R>, buf: Arc<Mutex<Vec<u8>>>) {
    let Some(mut reader) = reader else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut guard) = buf.lock() {
                    guard.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

fn take_sanitized(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    match buf.lock() {
        Ok(guard) => sanitize_output(&guard),
        Err(poisoned) => sanitize_output(&poisoned.into_inner()),
    }
}
