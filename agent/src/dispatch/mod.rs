//! Inbound RPC dispatch.
//!
//! The dispatcher consumes the agent's private inbox, decodes each
//! envelope, looks up a handler by function name, and runs it on its own
//! task so slow handlers never block delivery of subsequent messages.
//! Unknown function names are dropped silently — a deliberate permissive
//! default so newer controllers can send newer function names to older
//! agents. Decode failures are logged, not replied to: the reply address
//! inside a malformed envelope cannot be trusted.

pub mod handlers;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

use vigil_common::envelope::{encode_named, Envelope};
use vigil_common::types::{
    ActionOutcome, CmdResult, EventLogEntry, ProcessInfo, ServiceStatus, WireError,
};

use crate::config::AgentConfig;
use crate::exclusion::ExclusionGuard;
use crate::platform::{ControllerUpdates, ServiceIdentity, SystemPower, SystemServices, SystemTasks};
use crate::ports::{Collectors, PowerOps, ServiceOps, TaskOps, UpdateOps};
use crate::script::ScriptExecutor;
use crate::sink::ResultSink;
use crate::transport::Transport;

/// Everything a handler may touch, shared across all in-flight handlers.
pub struct AgentCtx {
    pub config: AgentConfig,
    pub version: String,
    pub transport: Arc<dyn Transport>,
    pub collectors: Arc<dyn Collectors>,
    pub services: Arc<dyn ServiceOps>,
    pub tasks: Arc<dyn TaskOps>,
    pub power: Arc<dyn PowerOps>,
    pub updates: Arc<dyn UpdateOps>,
    pub exclusion: Arc<ExclusionGuard>,
    pub script: ScriptExecutor,
    pub sink: ResultSink,
}

impl AgentCtx {
    /// Wire up the production collaborators.
    #[must_use]
    pub fn production(
        config: AgentConfig,
        version: &str,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let script = ScriptExecutor::new(&config, Arc::new(ServiceIdentity));
        let sink = ResultSink::new(&config);
        let collectors = Arc::new(crate::collectors::SystemCollectors::new(
            &config.agent_id,
            version,
        ));
        let updates = Arc::new(ControllerUpdates::new(&config));
        Self {
            version: version.to_string(),
            transport,
            collectors,
            services: Arc::new(SystemServices),
            tasks: Arc::new(SystemTasks),
            power: Arc::new(SystemPower),
            updates,
            exclusion: Arc::new(ExclusionGuard::new()),
            script,
            sink,
            config,
        }
    }

    /// Publish one reply to the envelope's reply subject. Envelopes
    /// without a reply subject expect none; publish failures are logged —
    /// the transport client owns reconnection.
    pub async fn publish_reply(&self, envelope: &Envelope, reply: &Reply) {
        let Some(reply_to) = envelope.reply_to.as_deref() else {
            tracing::debug!(func = %envelope.func, "envelope has no reply subject, skipping reply");
            return;
        };
        let bytes = match reply.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(func = %envelope.func, error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.transport.publish(reply_to, bytes).await {
            tracing::warn!(func = %envelope.func, error = %e, "failed to publish reply");
        }
    }

    /// Push a structured result to the result sink when the envelope
    /// carries a correlation id. Best effort by design.
    pub async fn post_correlated_result(&self, envelope: &Envelope, result: &CmdResult) {
        if let Some(id) = envelope.correlation_id {
            self.sink.post_result(id, result).await;
        }
    }
}

/// What a handler sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Raw string sentinel (`"pong"`, `"ok"`, `"updaterunning"`, error
    /// strings) — preserved for wire compatibility.
    Raw(String),
    Cmd(CmdResult),
    Procs(Vec<ProcessInfo>),
    Services(Vec<ServiceStatus>),
    EventLog(Vec<EventLogEntry>),
    Outcome(ActionOutcome),
    /// The handler already published its reply (exclusive long-running
    /// and fire-and-continue handlers reply before the work).
    AlreadySent,
}

impl Reply {
    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Self::Raw(s) => encode_named(s),
            Self::Cmd(r) => encode_named(r),
            Self::Procs(p) => encode_named(p),
            Self::Services(s) => encode_named(s),
            Self::EventLog(e) => encode_named(e),
            Self::Outcome(o) => encode_named(o),
            Self::AlreadySent => Err(WireError::Encode(
                "reply was already sent by the handler".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn ok() -> Self {
        Self::Raw("ok".to_string())
    }
}

/// The unit of logic bound to one envelope function name.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &AgentCtx, envelope: &Envelope) -> Reply;
}

/// Routes inbound envelopes to handlers.
pub struct Dispatcher {
    ctx: Arc<AgentCtx>,
    registry: HashMap<&'static str, Arc<dyn Handler>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(ctx: Arc<AgentCtx>) -> Self {
        Self {
            ctx,
            registry: handlers::registry(),
        }
    }

    /// Replace or add one handler binding. Mostly useful in tests.
    pub fn register(&mut self, func: &'static str, handler: Arc<dyn Handler>) {
        self.registry.insert(func, handler);
    }

    /// Consume the inbox until it closes or `shutdown` resolves, then
    /// drain in-flight handlers so a graceful stop never abandons work.
    pub async fn run(self, mut inbox: tokio::sync::mpsc::Receiver<Vec<u8>>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                maybe = inbox.recv() => {
                    match maybe {
                        Some(bytes) => self.dispatch_one(&mut in_flight, &bytes),
                        None => {
                            tracing::warn!("inbox closed, dispatcher stopping");
                            break;
                        }
                    }
                }
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            tracing::error!(error = %e, "handler task panicked");
                        }
                    }
                }
                () = &mut shutdown => {
                    tracing::info!("shutdown requested, draining in-flight handlers");
                    break;
                }
            }
        }

        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    tracing::error!(error = %e, "handler task panicked during drain");
                }
            }
        }
    }

    /// Decode, look up, and spawn. Never blocks on handler completion.
    fn dispatch_one(&self, in_flight: &mut JoinSet<()>, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable envelope");
                return;
            }
        };

        let Some(handler) = self.registry.get(envelope.func.as_str()).cloned() else {
            tracing::debug!(func = %envelope.func, "no handler registered, dropping");
            return;
        };

        tracing::debug!(func = %envelope.func, "dispatching");
        let ctx = Arc::clone(&self.ctx);
        in_flight.spawn(async move {
            let reply = handler.handle(&ctx, &envelope).await;
            if !matches!(reply, Reply::AlreadySent) {
                ctx.publish_reply(&envelope, &reply).await;
            }
        });
    }
}
