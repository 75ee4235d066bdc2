//! Shared wire types for the Vigil endpoint agent.
//!
//! Everything the agent and the controller both need to understand lives
//! here: the RPC envelope, command/script result shapes, telemetry
//! payloads, and the check-in cadence configuration. The agent binary
//! depends on this crate; controller-side services can too.

pub mod checkin;
pub mod envelope;
pub mod types;

pub use checkin::{CheckInConfig, CheckInPayload, Signal};
pub use envelope::{decode, encode_named, Envelope, TaskDescriptor};
pub use types::{
    sanitize_output, ActionOutcome, AgentInfo, CmdResult, DiskInfo, EventLogEntry, ProcessInfo,
    ServiceStatus, ShellKind, SoftwareItem, WireError, MISSING_INTERPRETER_EXIT_CODE,
    SPAWN_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
