//! Result and telemetry shapes shared between agent and controller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit code reported when a command was killed by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 98;

/// Exit code reported when an optional interpreter is not installed.
pub const MISSING_INTERPRETER_EXIT_CODE: i32 = 85;

/// Exit code reported when the child process could not be spawned at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 1;

/// Errors produced while encoding or decoding wire payloads.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to decode envelope: {0}")]
    Decode(String),

    #[error("failed to encode payload: {0}")]
    Encode(String),
}

/// Outcome of one command or script execution.
///
/// A timeout is a first-class outcome, not an error: `timed_out` is set,
/// `exit_code` is [`TIMEOUT_EXIT_CODE`], and whatever output was captured
/// before the kill is preserved. `error` is populated only for execution
/// failures distinct from a non-zero exit code (spawn failure, missing
/// interpreter).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CmdResult {
    /// Result for a child that could not be spawned.
    #[must_use]
    pub fn spawn_failure(detail: String) -> Self {
        Self {
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            error: Some(detail),
            ..Self::default()
        }
    }

    /// Result for a script whose interpreter is not installed.
    #[must_use]
    pub fn missing_interpreter(detail: String) -> Self {
        Self {
            exit_code: MISSING_INTERPRETER_EXIT_CODE,
            error: Some(detail),
            ..Self::default()
        }
    }

    /// stdout and stderr joined, the shape legacy `rawcmd` callers expect.
    #[must_use]
    pub fn combined_output(&self) -> String {
        if let Some(err) = &self.error {
            return err.clone();
        }
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Sanitize captured process output: strip NUL bytes and coerce to valid
/// UTF-8. Idempotent — sanitizing twice equals sanitizing once.
#[must_use]
pub fn sanitize_output(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace('\0', "")
}

/// Script interpreter selection, keyed by the wire names controllers send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    /// The OS-native shell: `/bin/sh` family on POSIX, cmd on Windows.
    Shell,
    Powershell,
    Python,
    Batch,
    Nushell,
    Deno,
}

impl ShellKind {
    /// File extension for the materialized temp script. Several
    /// interpreters dispatch on extension, so this is load-bearing.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Shell => ".sh",
            Self::Powershell => ".ps1",
            Self::Python => ".py",
            Self::Batch => ".bat",
            Self::Nushell => ".nu",
            Self::Deno => ".ts",
        }
    }

    /// Optional interpreters must be verified to exist before spawning so
    /// the caller gets a clear "not installed" error instead of a generic
    /// spawn failure.
    #[must_use]
    pub fn is_optional(self) -> bool {
        matches!(self, Self::Nushell | Self::Deno)
    }

    /// Parse a wire name like `"powershell"`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shell" | "cmd" => Some(Self::Shell),
            "powershell" => Some(Self::Powershell),
            "python" => Some(Self::Python),
            "batch" => Some(Self::Batch),
            "nushell" => Some(Self::Nushell),
            "deno" => Some(Self::Deno),
            _ => None,
        }
    }
}

/// Structured success/failure reply for mutating handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub detail: String,
}

impl ActionOutcome {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            detail: String::new(),
        }
    }

    #[must_use]
    pub fn failed(detail: String) -> Self {
        Self {
            success: false,
            detail,
        }
    }
}

// ── Telemetry shapes ──────────────────────────────────────────────────────────

/// Identity block pushed on the agent-info cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
}

/// One running process, as reported by the process collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// One OS service and its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub display_name: String,
    pub status: String,
    pub start_type: String,
}

/// One mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub device: String,
    pub mount_point: String,
    pub fstype: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// One installed software entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareItem {
    pub name: String,
    pub version: String,
    pub publisher: String,
}

/// One event-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub source: String,
    pub event_id: u32,
    pub level: String,
    pub message: String,
    pub time: chrono::DateTime<chrono::Utc>,
}
