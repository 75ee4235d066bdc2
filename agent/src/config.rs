//! Agent configuration loaded from environment variables via `envy`.
//!
//! Each field maps to `VIGIL_<FIELD>`:
//!   - `VIGIL_AGENT_ID`    (required)
//!   - `VIGIL_REDIS_URL`   (default `redis://127.0.0.1:6379`)
//!   - `VIGIL_API_URL`     (default `http://127.0.0.1:8000`)
//!   - `VIGIL_TOKEN`       (default empty — controller auth disabled)
//!   - `VIGIL_SCRATCH_DIR` (default the OS temp dir)
//!   - `VIGIL_NUSHELL_PATH`, `VIGIL_DENO_PATH` (optional interpreters)
//!   - `VIGIL_DENO_DEFAULT_PERMISSIONS` (e.g. `--allow-all`)

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Identity this agent subscribes under.
    pub agent_id: String,

    /// Pub/sub transport URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Controller HTTP API base URL (check-in config, result sink).
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer token for the controller HTTP API.
    #[serde(default)]
    pub token: String,

    /// Scratch directory for materialized script temp files.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Bundled/system nushell binary, when installed.
    #[serde(default)]
    pub nushell_path: Option<PathBuf>,

    /// Bundled/system deno binary, when installed.
    #[serde(default)]
    pub deno_path: Option<PathBuf>,

    /// Permission flags applied to deno scripts that carry none of their
    /// own, e.g. `--allow-all`.
    #[serde(default)]
    pub deno_default_permissions: Option<String>,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_api_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

impl AgentConfig {
    /// Load from `VIGIL_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when required variables are missing or malformed.
    pub fn from_env() -> Result<Self> {
        envy::prefixed("VIGIL_")
            .from_env()
            .context("failed to load config from VIGIL_* env vars (VIGIL_AGENT_ID is required)")
    }

    /// Config for tests: in-process defaults, no controller.
    #[must_use]
    pub fn for_tests(agent_id: &str, scratch_dir: PathBuf) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            redis_url: default_redis_url(),
            api_url: default_api_url(),
            token: String::new(),
            scratch_dir,
            nushell_path: None,
            deno_path: None,
            deno_default_permissions: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env_requires_agent_id() {
        std::env::remove_var("VIGIL_AGENT_ID");
        assert!(AgentConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_applies_defaults() {
        std::env::set_var("VIGIL_AGENT_ID", "agent-test");
        std::env::remove_var("VIGIL_REDIS_URL");
        std::env::remove_var("VIGIL_API_URL");
        let config = AgentConfig::from_env().expect("config should load");
        assert_eq!(config.agent_id, "agent-test");
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.api_url, "http://127.0.0.1:8000");
        assert!(config.token.is_empty());
        std::env::remove_var("VIGIL_AGENT_ID");
    }

    #[test]
    #[serial]
    fn test_from_env_overrides_win() {
        std::env::set_var("VIGIL_AGENT_ID", "agent-test");
        std::env::set_var("VIGIL_REDIS_URL", "rediss://broker:6380");
        let config = AgentConfig::from_env().expect("config should load");
        assert_eq!(config.redis_url, "rediss://broker:6380");
        std::env::remove_var("VIGIL_AGENT_ID");
        std::env::remove_var("VIGIL_REDIS_URL");
    }
}
