//! Best-effort durable result post-back.
//!
//! Script and command results that carry a correlation id are pushed to
//! the controller's HTTP API in addition to the pub/sub reply, so they are
//! recorded even if the requesting session is gone. This is a side
//! channel: its failure is logged and swallowed, never propagated back to
//! the RPC caller, since the primary reply already succeeded.

use vigil_common::types::CmdResult;

use crate::config::AgentConfig;

pub struct ResultSink {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl ResultSink {
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    /// PATCH the structured result under its correlation id. Best effort.
    pub async fn post_result(&self, correlation_id: i64, result: &CmdResult) {
        let url = format!("{}/api/v1/results/{correlation_id}/", self.api_url);
        let outcome = self
            .http
            .patch(&url)
            .header("Authorization", format!("Token {}", self.token))
            .json(result)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match outcome {
            Ok(_) => {
                tracing::debug!(correlation_id, "result posted to sink");
            }
            Err(e) => {
                tracing::warn!(correlation_id, error = %e, "result sink post failed (ignored)");
            }
        }
    }
}
