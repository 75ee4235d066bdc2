//! Vigil agent entrypoint: connect the transport, start the check-in
//! scheduler, and run the dispatcher until shutdown.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use vigil_agent::checkin::CheckInScheduler;
use vigil_agent::config::AgentConfig;
use vigil_agent::dispatch::{AgentCtx, Dispatcher};
use vigil_agent::transport::{self, subjects, RedisTransport};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env()?;
    tracing::info!(agent_id = %config.agent_id, version = VERSION, "vigil agent starting");

    // Fatal if the broker is unreachable: an agent that cannot receive
    // commands has no useful degraded mode.
    let (publisher, client) = RedisTransport::connect(&config.redis_url).await?;
    let inbox = transport::spawn_inbox_pump(client, subjects::agent_inbox(&config.agent_id));

    let ctx = Arc::new(AgentCtx::production(config, VERSION, Arc::new(publisher)));

    // The scheduler sleeps its jitter before contacting the controller,
    // so restarting fleets spread both the config fetch and the burst.
    tokio::spawn(CheckInScheduler::new(Arc::clone(&ctx)).run());

    Dispatcher::new(ctx).run(inbox, shutdown_signal()).await;
    tracing::info!("vigil agent shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown signal handler");
        std::future::pending::<()>().await;
    }
}
