//! Periodic telemetry push.
//!
//! Every signal runs on its own interval task, so a slow collector can
//! never delay a cheap one. Collector and publish failures are logged and
//! skipped; the next tick tries again. The cadence config comes from the
//! controller at startup, with jittered hardcoded fallbacks when that
//! fetch fails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::task::JoinSet;

use vigil_common::checkin::{CheckInConfig, CheckInPayload, Signal};
use vigil_common::envelope::encode_named;

use crate::dispatch::AgentCtx;
use crate::transport::subjects;

const CONFIG_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives all telemetry cadences for one agent.
pub struct CheckInScheduler {
    ctx: Arc<AgentCtx>,
    http: reqwest::Client,
    /// Desynchronizes a fleet restarting at once.
    startup_delay: Duration,
}

impl CheckInScheduler {
    #[must_use]
    pub fn new(ctx: Arc<AgentCtx>) -> Self {
        let startup_delay = Duration::from_millis(rand::rng().random_range(1_000..=5_000));
        Self::with_startup_delay(ctx, startup_delay)
    }

    #[must_use]
    pub fn with_startup_delay(ctx: Arc<AgentCtx>, startup_delay: Duration) -> Self {
        Self {
            ctx,
            http: reqwest::Client::new(),
            startup_delay,
        }
    }

    /// Fetch the cadence config from the controller, falling back to the
    /// jittered defaults so a dead controller never silences the fleet.
    pub async fn fetch_config(&self) -> CheckInConfig {
        match self.fetch_config_inner().await {
            Ok(config) => {
                tracing::info!("check-in config fetched from controller");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = format!("{e:#}"),
                    "check-in config fetch failed, using fallback cadences"
                );
                CheckInConfig::fallback()
            }
        }
    }

    async fn fetch_config_inner(&self) -> Result<CheckInConfig> {
        let url = format!(
            "{}/api/v1/agents/{}/config",
            self.ctx.config.api_url.trim_end_matches('/'),
            self.ctx.config.agent_id
        );
        let config = self
            .http
            .get(&url)
            .header(
                "Authorization",
                format!("Token {}", self.ctx.config.token),
            )
            .timeout(CONFIG_FETCH_TIMEOUT)
            .send()
            .await
            .context("check-in config request failed")?
            .error_for_status()
            .context("check-in config request rejected")?
            .json::<CheckInConfig>()
            .await
            .context("check-in config body malformed")?;
        Ok(config)
    }

    /// Sleep the startup delay, fetch the cadence config, then run all
    /// cadences forever. The delay comes first so a fleet restarting at
    /// once does not hit the controller API in lockstep.
    pub async fn run(self) {
        tokio::time::sleep(self.startup_delay).await;
        let config = self.fetch_config().await;
        self.run_cadences(config).await;
    }

    /// Like [`run`](Self::run) with a caller-supplied config, skipping
    /// the controller fetch.
    pub async fn run_with_config(self, config: CheckInConfig) {
        tokio::time::sleep(self.startup_delay).await;
        self.run_cadences(config).await;
    }

    /// An initial burst pushes every enabled signal once so a fresh agent
    /// is visible immediately; after that each signal ticks on its own
    /// interval.
    async fn run_cadences(self, config: CheckInConfig) {
        let cadences = config.cadences();
        for (signal, _) in &cadences {
            push_signal(&self.ctx, *signal).await;
            let gap = Duration::from_millis(rand::rng().random_range(100..=400));
            tokio::time::sleep(gap).await;
        }

        let mut tasks = JoinSet::new();
        for (signal, secs) in cadences {
            let ctx = Arc::clone(&self.ctx);
            tasks.spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(secs));
                // The first tick fires immediately; the burst above
                // already covered it.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    push_signal(&ctx, signal).await;
                }
            });
        }

        // The cadence tasks never finish; this parks until shutdown
        // tears the runtime down.
        while tasks.join_next().await.is_some() {}
    }
}

/// Collect and publish one signal. Failures are logged, never propagated:
/// the cadence must survive a flaky collector.
pub async fn push_signal(ctx: &AgentCtx, signal: Signal) {
    let payload = match build_payload(ctx, signal).await {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(signal = signal.as_str(), error = format!("{e:#}"), "collector failed, skipping push");
            return;
        }
    };
    let bytes = match encode_named(&payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(signal = signal.as_str(), error = %e, "failed to encode telemetry");
            return;
        }
    };
    if let Err(e) = ctx
        .transport
        .publish(&subjects::checkin(signal), bytes)
        .await
    {
        tracing::warn!(signal = signal.as_str(), error = format!("{e:#}"), "telemetry publish failed");
    } else {
        tracing::debug!(signal = signal.as_str(), "telemetry pushed");
    }
}

async fn build_payload(ctx: &AgentCtx, signal: Signal) -> Result<CheckInPayload> {
    let agent_id = ctx.config.agent_id.clone();
    let payload = match signal {
        Signal::Hello => CheckInPayload::Hello {
            agent_id,
            version: ctx.version.clone(),
        },
        Signal::AgentInfo => CheckInPayload::AgentInfo {
            agent_id,
            info: ctx.collectors.agent_info().await?,
        },
        Signal::Services => CheckInPayload::Services {
            agent_id,
            services: ctx.collectors.services().await?,
        },
        Signal::PublicIp => CheckInPayload::PublicIp {
            agent_id,
            public_ip: ctx.collectors.public_ip().await?,
        },
        Signal::Disks => CheckInPayload::Disks {
            agent_id,
            disks: ctx.collectors.disks().await?,
        },
        Signal::Software => CheckInPayload::Software {
            agent_id,
            software: ctx.collectors.software().await?,
        },
        Signal::Wmi => CheckInPayload::Wmi {
            agent_id,
            wmi: ctx.collectors.wmi().await?,
        },
        Signal::Sync => CheckInPayload::Sync { agent_id },
    };
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_ctx, TestCtx};

    #[tokio::test]
    async fn test_push_signal_hello_carries_identity() {
        let TestCtx { ctx, transport, .. } = test_ctx();
        push_signal(&ctx, Signal::Hello).await;

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, subjects::checkin(Signal::Hello));

        let payload: CheckInPayload =
            vigil_common::envelope::decode(&published[0].1).expect("decode telemetry");
        let CheckInPayload::Hello { agent_id, version } = payload else {
            panic!("expected a hello payload");
        };
        assert_eq!(agent_id, ctx.config.agent_id);
        assert_eq!(version, ctx.version);
    }

    #[tokio::test]
    async fn test_push_signal_survives_collector_failure() {
        let TestCtx { ctx, transport, .. } = test_ctx();
        // The fake public_ip collector fails; nothing must be published
        // and nothing must panic.
        push_signal(&ctx, Signal::PublicIp).await;
        assert!(transport.published().is_empty());
    }
}
