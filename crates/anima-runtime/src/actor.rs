use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info};

use anima_core::message::{ActorMessage, MessageType};
use anima_events::EventWriter;

use crate::error::Result;
use crate::system::SystemHandle;

/// A message-driven coordination primitive with a bounded mailbox.
///
/// The runtime guarantees `handle` is never invoked concurrently with
/// itself for one actor, and that messages from a single sender arrive in
/// enqueue order. A handler error is logged and the actor keeps running;
/// only the `Shutdown` control tag ends the loop.
#[async_trait]
pub trait Actor: Send + 'static {
    fn actor_id(&self) -> &str;

    /// Acquire resources before the message loop starts. An error here
    /// aborts system startup; components with a degraded mode catch their
    /// own backing-store failures instead of returning them.
    async fn initialize(&mut self, _ctx: &ActorContext) -> Result<()> {
        Ok(())
    }

    async fn handle(&mut self, msg: ActorMessage, ctx: &ActorContext) -> Result<()>;

    /// Release resources after the loop exits.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handle passed into every `handle` invocation: who am I, and how do I
/// reach the rest of the system.
#[derive(Clone)]
pub struct ActorContext {
    actor_id: String,
    system: SystemHandle,
}

impl ActorContext {
    pub(crate) fn new(actor_id: String, system: SystemHandle) -> Self {
        Self { actor_id, system }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn system(&self) -> &SystemHandle {
        &self.system
    }

    /// Send with this actor as the sender.
    pub async fn send(&self, to: &str, mut msg: ActorMessage) -> Result<()> {
        msg.sender_id = Some(self.actor_id.clone());
        self.system.send(to, msg).await
    }

    /// Event writer, when the system was wired to an event store.
    pub fn events(&self) -> Option<&EventWriter> {
        self.system.events()
    }

    /// Append a semantic event, logging instead of failing when no store is
    /// attached or the append errors. State transitions must not die on
    /// observability.
    pub async fn emit_event(
        &self,
        stream_id: &str,
        event_type: &str,
        payload: serde_json::Value,
        correlation_id: Option<&str>,
    ) {
        if let Some(writer) = self.system.events() {
            if let Err(e) = writer
                .append(stream_id, event_type, payload, correlation_id)
                .await
            {
                error!(
                    actor = %self.actor_id,
                    stream_id,
                    event_type,
                    error = %e,
                    "failed to append event"
                );
            }
        }
    }
}

/// Drive one actor's mailbox until shutdown.
///
/// The wake timeout keeps the loop responsive to a runtime stop even when
/// no messages arrive.
pub(crate) async fn run_message_loop(
    mut actor: Box<dyn Actor>,
    mut rx: mpsc::Receiver<ActorMessage>,
    ctx: ActorContext,
    wake_timeout: Duration,
) {
    debug!(actor = %ctx.actor_id(), "message loop started");
    loop {
        match timeout(wake_timeout, rx.recv()).await {
            Ok(Some(msg)) => {
                if msg.message_type == MessageType::Shutdown {
                    info!(actor = %ctx.actor_id(), "received shutdown message");
                    break;
                }
                debug!(
                    actor = %ctx.actor_id(),
                    message_type = %msg.message_type,
                    sender = msg.sender_id.as_deref().unwrap_or("-"),
                    "processing message"
                );
                if let Err(e) = actor.handle(msg, &ctx).await {
                    error!(actor = %ctx.actor_id(), error = %e, "handler error");
                }
            }
            Ok(None) => break,
            // Periodic wake with an empty mailbox.
            Err(_) => continue,
        }
    }

    if let Err(e) = actor.shutdown().await {
        error!(actor = %ctx.actor_id(), error = %e, "error during actor shutdown");
    }
    debug!(actor = %ctx.actor_id(), "message loop ended");
}
