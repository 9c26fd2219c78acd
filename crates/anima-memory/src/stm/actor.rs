use async_trait::async_trait;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use anima_core::config::StmConfig;
use anima_core::message::{ActorMessage, MessageType};
use anima_runtime::{Actor, ActorContext};

use crate::stm::store::{ContextFormat, SpeakerRole, StmStore};

#[derive(Debug, Deserialize)]
struct StorePayload {
    user_id: String,
    message_type: String,
    content: String,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GetContextPayload {
    user_id: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClearPayload {
    user_id: String,
}

#[derive(Debug, Default)]
struct StmMetrics {
    store_count: u64,
    get_context_count: u64,
    clear_count: u64,
    unknown_count: u64,
    db_errors: u64,
}

/// Short-term memory actor.
///
/// Owns the `stm_buffer` table. If the backing store is unavailable at
/// init the actor enters degraded mode: stores are acknowledged without
/// persisting and contexts come back empty.
pub struct StmActor {
    config: StmConfig,
    db_path: Option<String>,
    store: Option<StmStore>,
    degraded: bool,
    degraded_logged: bool,
    metrics: StmMetrics,
}

impl StmActor {
    /// Open the database at `db_path` during initialization.
    pub fn new(config: StmConfig, db_path: &str) -> Self {
        Self {
            config,
            db_path: Some(db_path.to_string()),
            store: None,
            degraded: false,
            degraded_logged: false,
            metrics: StmMetrics::default(),
        }
    }

    /// Wrap an already-open connection (tests use `open_in_memory`).
    pub fn with_connection(config: StmConfig, conn: Connection) -> Self {
        let store = StmStore::new(conn, &config).ok();
        let degraded = store.is_none();
        Self {
            config,
            db_path: None,
            store,
            degraded,
            degraded_logged: false,
            metrics: StmMetrics::default(),
        }
    }

    fn log_degraded_once(&mut self) {
        if !self.degraded_logged {
            warn!("STM in degraded mode: stores acknowledged without persistence");
            self.degraded_logged = true;
        }
    }

    async fn handle_store(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        self.metrics.store_count += 1;
        let payload: StorePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed StoreMemory payload");
                return;
            }
        };
        let Some(store) = &self.store else {
            self.log_degraded_once();
            return;
        };
        let role = match payload.message_type.parse::<SpeakerRole>() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "invalid message_type in StoreMemory");
                return;
            }
        };
        match store.store(&payload.user_id, role, &payload.content, payload.metadata) {
            Ok(()) => {
                ctx.emit_event(
                    &format!("stm_{}", payload.user_id),
                    "MemoryStoredEvent",
                    json!({
                        "user_id": payload.user_id,
                        "message_type": role.as_str(),
                        "content_length": payload.content.chars().count(),
                    }),
                    None,
                )
                .await;
            }
            Err(e) => {
                self.metrics.db_errors += 1;
                warn!(user_id = %payload.user_id, error = %e, "failed to store STM row");
            }
        }
    }

    async fn handle_get_context(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        self.metrics.get_context_count += 1;
        let payload: GetContextPayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed GetContext payload");
                return;
            }
        };
        let Some(reply_to) = msg.reply_target().map(String::from) else {
            warn!("GetContext without reply_to or sender_id");
            return;
        };

        let format = payload
            .format
            .as_deref()
            .map(ContextFormat::parse)
            .unwrap_or_else(|| ContextFormat::parse(&self.config.context_format));

        let (messages, total, degraded) = match &self.store {
            Some(store) => match store.context(&payload.user_id, payload.limit, format) {
                Ok(context) => (context.messages, context.total_messages, false),
                Err(e) => {
                    // Degraded read path: empty context instead of an error.
                    self.metrics.db_errors += 1;
                    warn!(user_id = %payload.user_id, error = %e, "context query failed, returning empty");
                    (Vec::new(), 0, true)
                }
            },
            None => {
                self.log_degraded_once();
                (Vec::new(), 0, true)
            }
        };

        ctx.emit_event(
            &format!("stm_{}", payload.user_id),
            "ContextRetrievedEvent",
            json!({
                "user_id": payload.user_id,
                "context_size": total,
                "format": format.as_str(),
            }),
            payload.request_id.as_deref(),
        )
        .await;

        let response = ActorMessage::new(
            MessageType::ContextResponse,
            json!({
                "user_id": payload.user_id,
                "messages": messages,
                "total_messages": total,
                "format": format.as_str(),
                "degraded_mode": degraded,
                "request_id": payload.request_id,
            }),
        );
        if let Err(e) = ctx.send(&reply_to, response).await {
            warn!(reply_to = %reply_to, error = %e, "failed to deliver ContextResponse");
        }
    }

    fn handle_clear(&mut self, msg: &ActorMessage) {
        self.metrics.clear_count += 1;
        let payload: ClearPayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed ClearUserMemory payload");
                return;
            }
        };
        if let Some(store) = &self.store {
            match store.clear(&payload.user_id) {
                Ok(deleted) => debug!(user_id = %payload.user_id, deleted, "cleared STM"),
                Err(e) => {
                    self.metrics.db_errors += 1;
                    warn!(user_id = %payload.user_id, error = %e, "failed to clear STM");
                }
            }
        }
    }
}

#[async_trait]
impl Actor for StmActor {
    fn actor_id(&self) -> &str {
        "memory"
    }

    async fn initialize(&mut self, _ctx: &ActorContext) -> anima_runtime::Result<()> {
        if self.store.is_some() {
            return Ok(());
        }
        let Some(path) = self.db_path.clone() else {
            self.degraded = true;
            return Ok(());
        };
        if let Some(parent) = std::path::Path::new(&path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        match Connection::open(&path).map_err(crate::error::MemoryError::from) {
            Ok(conn) => match StmStore::new(conn, &self.config) {
                Ok(store) => {
                    self.store = Some(store);
                    info!("STM actor initialized");
                }
                Err(e) => {
                    self.degraded = true;
                    warn!(error = %e, "STM schema init failed, entering degraded mode");
                }
            },
            Err(e) => {
                self.degraded = true;
                warn!(error = %e, "STM database unavailable, entering degraded mode");
            }
        }
        Ok(())
    }

    async fn handle(&mut self, msg: ActorMessage, ctx: &ActorContext) -> anima_runtime::Result<()> {
        match msg.message_type {
            MessageType::StoreMemory => self.handle_store(&msg, ctx).await,
            MessageType::GetContext => self.handle_get_context(&msg, ctx).await,
            MessageType::ClearUserMemory => self.handle_clear(&msg),
            other => {
                self.metrics.unknown_count += 1;
                warn!(message_type = %other, "STM received unknown message type");
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anima_runtime::Result<()> {
        info!(
            store = self.metrics.store_count,
            get = self.metrics.get_context_count,
            clear = self.metrics.clear_count,
            unknown = self.metrics.unknown_count,
            db_errors = self.metrics.db_errors,
            degraded = self.degraded,
            "STM final metrics"
        );
        Ok(())
    }
}
