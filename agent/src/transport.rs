//! Pub/sub transport client.
//!
//! The agent subscribes on a per-agent inbox subject and publishes
//! replies/telemetry through the [`Transport`] port. The production
//! implementation rides the `redis` crate's async pub/sub; the subscribe
//! loop reconnects forever with jittered backoff, so handlers never see
//! connection loss. Startup connect failure is fatal — a dispatcher that
//! cannot receive commands has no useful degraded mode.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;

/// Subject naming, shared by agent and controller.
pub mod subjects {
    use vigil_common::checkin::Signal;

    /// Per-agent private inbox.
    #[must_use]
    pub fn agent_inbox(agent_id: &str) -> String {
        format!("vigil.agent.{agent_id}")
    }

    /// Telemetry subject for one signal.
    #[must_use]
    pub fn checkin(signal: Signal) -> String {
        format!("vigil.checkin.{}", signal.as_str())
    }
}

/// Publish side of the pub/sub connection. Safe to share across
/// concurrency units; the underlying client guarantees concurrent use.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Ensure previously published messages are on the wire. Called before
    /// actions that may terminate the agent process.
    async fn flush(&self) -> Result<()>;
}

/// Production transport over a Valkey/Redis multiplexed connection.
pub struct RedisTransport {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisTransport {
    /// Connect and verify with PING.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unreachable — fatal at startup.
    pub async fn connect(url: &str) -> Result<(Self, redis::Client)> {
        let client = redis::Client::open(url).context("failed to create transport client")?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to transport")?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("transport startup PING failed — is the broker reachable?")?;

        tracing::info!(url, "transport connection ready");
        Ok((Self { conn }, client))
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(subject)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await
            .with_context(|| format!("PUBLISH to {subject} failed"))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // The multiplexed connection is ordered, so a PING round-trip
        // implies every prior publish reached the broker.
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("transport flush failed")?;
        Ok(())
    }
}

/// Spawn the inbox pump: subscribe to `subject` and forward raw message
/// payloads into the returned channel. Reconnects forever with jittered
/// backoff; gives up only when the receiving side (the dispatcher) goes
/// away.
pub fn spawn_inbox_pump(client: redis::Client, subject: String) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => match pubsub.subscribe(&subject).await {
                    Ok(()) => {
                        tracing::info!(subject = %subject, "subscribed to agent inbox");
                        let mut stream = pubsub.into_on_message();
                        while let Some(msg) = stream.next().await {
                            let payload = msg.get_payload_bytes().to_vec();
                            if tx.send(payload).await.is_err() {
                                return; // dispatcher gone, stop pumping
                            }
                        }
                        tracing::warn!(subject = %subject, "inbox stream ended, reconnecting");
                    }
                    Err(e) => {
                        tracing::warn!(subject = %subject, error = %e, "subscribe failed");
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "pub/sub connection failed, retrying");
                }
            }

            let backoff_ms = rand::rng().random_range(1_000..=5_000);
            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_common::checkin::Signal;

    #[test]
    fn test_subject_naming() {
        assert_eq!(subjects::agent_inbox("abc-123"), "vigil.agent.abc-123");
        assert_eq!(subjects::checkin(Signal::Hello), "vigil.checkin.hello");
        assert_eq!(subjects::checkin(Signal::PublicIp), "vigil.checkin.public_ip");
    }
}
