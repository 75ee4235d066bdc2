//! The RPC envelope: one decoded inbound pub/sub message.
//!
//! The wire format is a msgpack map with string keys. Every field except
//! `func` is optional so that newer controllers can add fields without
//! breaking older agents, and vice versa. Struct encoding always goes
//! through [`encode_named`] so keys are preserved (rmp-serde's default
//! tuple encoding would not be).

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::types::WireError;

/// Encode any serde value as a msgpack map with string keys.
///
/// # Errors
///
/// Returns [`WireError::Encode`] if the value cannot be serialized.
pub fn encode_named<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    rmp_serde::to_vec_named(value).map_err(|e| WireError::Encode(e.to_string()))
}

/// Decode a msgpack payload into any serde value.
///
/// # Errors
///
/// Returns [`WireError::Decode`] if the bytes are not valid msgpack for `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    rmp_serde::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

/// Scheduled-task descriptor carried by task create envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    /// Cron-style schedule expression, interpreted by the task scheduler.
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub enabled: bool,
}

/// One remote command pushed by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Function name — the key into the agent's dispatch table. Unknown
    /// names are dropped silently for forward compatibility.
    pub func: String,

    /// Timeout hint in seconds for command/script envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Free-form string-keyed parameters (shell kind, service name, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub payload: HashMap<String, String>,

    /// Extra argv appended after the script path for script envelopes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub script_args: Vec<String>,

    /// Target process id for `killproc`.
    #[serde(default, rename = "procpid", skip_serializing_if = "Option::is_none")]
    pub proc_pid: Option<u32>,

    /// Primary key of a scheduled task on the controller side.
    #[serde(default, rename = "taskpk", skip_serializing_if = "Option::is_none")]
    pub task_pk: Option<i64>,

    /// Correlation id for the optional async result post-back.
    #[serde(default, rename = "id", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<i64>,

    /// Script body for script envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Subject the reply is published to. Absent on telemetry-style
    /// envelopes that expect no reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Scheduled-task descriptor for task create envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskDescriptor>,

    /// `KEY=VALUE` environment overrides for command/script envelopes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<String>,
}

impl Envelope {
    /// Decode an inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Decode`] on malformed payloads; the caller
    /// drops those without replying since the reply address inside a
    /// malformed envelope cannot be trusted.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        decode(bytes)
    }

    /// Encode for publishing.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode_named(self)
    }

    /// Convenience constructor for the common func-only case.
    #[must_use]
    pub fn for_func(func: &str) -> Self {
        Self {
            func: func.to_string(),
            ..Self::default()
        }
    }

    /// Split `env_vars` into `(key, value)` pairs, skipping malformed
    /// entries. Later entries win on duplicate keys, consistent with
    /// environment-block resolution.
    #[must_use]
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env_vars
            .iter()
            .filter_map(|kv| {
                kv.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CmdResult;

    #[test]
    fn test_envelope_round_trip_preserves_fields() {
        let mut payload = HashMap::new();
        payload.insert("shell".to_string(), "python".to_string());

        let env = Envelope {
            func: "runscript".to_string(),
            timeout: Some(30),
            payload,
            script_args: vec!["--flag".to_string()],
            proc_pid: None,
            task_pk: Some(7),
            correlation_id: Some(42),
            code: Some("print('hi')".to_string()),
            reply_to: Some("vigil.reply.abc".to_string()),
            task: None,
            env_vars: vec!["FOO=bar".to_string()],
        };

        let bytes = env.encode().expect("encode should succeed");
        let back = Envelope::decode(&bytes).expect("decode should succeed");

        assert_eq!(back.func, "runscript");
        assert_eq!(back.timeout, Some(30));
        assert_eq!(back.payload.get("shell").map(String::as_str), Some("python"));
        assert_eq!(back.correlation_id, Some(42));
        assert_eq!(back.reply_to.as_deref(), Some("vigil.reply.abc"));
        assert_eq!(back.env_vars, vec!["FOO=bar".to_string()]);
    }

    #[test]
    fn test_envelope_decode_minimal_map() {
        // A controller that only sends `func` must still decode.
        let minimal = Envelope::for_func("ping");
        let bytes = minimal.encode().expect("encode should succeed");
        let back = Envelope::decode(&bytes).expect("decode should succeed");
        assert_eq!(back.func, "ping");
        assert!(back.payload.is_empty());
        assert!(back.reply_to.is_none());
    }

    #[test]
    fn test_envelope_decode_garbage_returns_error() {
        assert!(Envelope::decode(&[0xc1, 0xff, 0x00]).is_err());
        assert!(Envelope::decode(b"").is_err());
    }

    #[test]
    fn test_env_pairs_skips_malformed_entries() {
        let env = Envelope {
            env_vars: vec![
                "A=1".to_string(),
                "malformed".to_string(),
                "B=two=parts".to_string(),
            ],
            ..Envelope::for_func("rawcmd")
        };
        let pairs = env.env_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("A".to_string(), "1".to_string()));
        assert_eq!(pairs[1], ("B".to_string(), "two=parts".to_string()));
    }

    #[test]
    fn test_cmd_result_round_trip_identical_triple() {
        let res = CmdResult {
            stdout: "hello\n".to_string(),
            stderr: "warning\n".to_string(),
            exit_code: 3,
            timed_out: false,
            error: None,
        };
        let bytes = encode_named(&res).expect("encode should succeed");
        let back: CmdResult = decode(&bytes).expect("decode should succeed");
        assert_eq!(back, res);
    }

    #[test]
    fn test_task_descriptor_round_trip() {
        let env = Envelope {
            task: Some(TaskDescriptor {
                name: "nightly".to_string(),
                schedule: "0 3 * * *".to_string(),
                command: "cleanup.sh".to_string(),
                enabled: true,
            }),
            ..Envelope::for_func("schedtask")
        };
        let bytes = env.encode().expect("encode should succeed");
        let back = Envelope::decode(&bytes).expect("decode should succeed");
        let task = back.task.expect("task should survive the round trip");
        assert_eq!(task.name, "nightly");
        assert!(task.enabled);
    }
}
