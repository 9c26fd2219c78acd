use async_trait::async_trait;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use anima_core::clients::Embedder;
use anima_core::config::LtmConfig;
use anima_core::emotion::EmotionVector;
use anima_core::message::{ActorMessage, MessageType};
use anima_runtime::{Actor, ActorContext};

use crate::ltm::scoring::{
    classify_memory_type, classify_trigger, importance_score, novelty_score, semantic_tags,
};
use crate::ltm::store::LtmStore;
use crate::ltm::types::{LtmMemory, UserProfile};

#[derive(Debug, Deserialize)]
struct EvaluatePayload {
    user_id: String,
    user_text: String,
    bot_response: String,
    #[serde(default)]
    emotions: BTreeMap<String, f64>,
    #[serde(default)]
    dominant_emotions: Vec<String>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchPayload {
    user_id: String,
    search_type: String,
    #[serde(default)]
    query_vector: Option<Vec<f32>>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingPayload {
    user_id: String,
    text: String,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeletePayload {
    memory_id: String,
}

#[derive(Debug, Default)]
struct LtmMetrics {
    evaluations: u64,
    calibration_skips: u64,
    saves: u64,
    novelty_rejections: u64,
    searches: u64,
    embedding_requests: u64,
    db_errors: u64,
}

/// Long-term memory actor: decides which turns survive, retrieves relevant
/// memories, and maintains per-user calibration statistics.
pub struct LtmActor {
    config: LtmConfig,
    db_path: Option<String>,
    store: Option<LtmStore>,
    embedder: Option<Arc<dyn Embedder>>,
    degraded_logged: bool,
    metrics: LtmMetrics,
}

impl LtmActor {
    pub fn new(config: LtmConfig, db_path: &str, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            config,
            db_path: Some(db_path.to_string()),
            store: None,
            embedder,
            degraded_logged: false,
            metrics: LtmMetrics::default(),
        }
    }

    pub fn with_connection(
        config: LtmConfig,
        conn: Connection,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        let store = LtmStore::new(conn).ok();
        Self {
            config,
            db_path: None,
            store,
            embedder,
            degraded_logged: false,
            metrics: LtmMetrics::default(),
        }
    }

    fn log_degraded_once(&mut self) {
        if !self.degraded_logged {
            warn!("LTM in degraded mode: evaluations skipped, searches empty");
            self.degraded_logged = true;
        }
    }

    /// Evaluate one completed turn for retention.
    async fn handle_evaluate(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        self.metrics.evaluations += 1;
        let payload: EvaluatePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed EvaluateForLtm payload");
                return;
            }
        };
        if self.store.is_none() {
            self.log_degraded_once();
            return;
        }

        let emotions = EmotionVector::from_map(&payload.emotions);
        let emotions = if emotions.is_all_zero() {
            EmotionVector::neutral()
        } else {
            emotions
        };
        let tags = semantic_tags(&payload.user_text, &payload.bot_response);
        let stream = format!("ltm_{}", payload.user_id);
        let correlation = payload.request_id.as_deref();

        let mut profile = match self.load_or_create_profile(&payload.user_id) {
            Ok(p) => p,
            Err(e) => {
                self.metrics.db_errors += 1;
                warn!(error = %e, "failed to load LTM profile");
                return;
            }
        };

        // Embedding for the novelty centroid and, when saved, retrieval.
        let fragment = format!("{}\n{}", payload.user_text, payload.bot_response);
        let embedding = self.embed(&fragment).await;

        let novelty = novelty_score(&profile, &emotions, embedding.as_deref(), &tags);
        let trigger = classify_trigger(&emotions, &payload.user_text);
        let importance = importance_score(&emotions, trigger, &payload.user_text);

        // Cold start: accumulate statistics, never save.
        if !profile.calibration_complete {
            profile.absorb(
                &emotions,
                &tags,
                embedding.as_deref(),
                novelty.composite,
                self.config.novelty_window,
                self.config.cold_start_buffer_size,
            );
            self.metrics.calibration_skips += 1;
            let persisted = self.persist_profile(&profile);
            ctx.emit_event(
                &stream,
                "CalibrationProgressEvent",
                json!({
                    "user_id": payload.user_id,
                    "progress": profile.total_messages,
                    "buffer_size": self.config.cold_start_buffer_size,
                }),
                correlation,
            )
            .await;
            if let Err(e) = persisted {
                self.metrics.db_errors += 1;
                warn!(error = %e, "failed to persist LTM profile");
            }
            return;
        }

        let threshold = profile.dynamic_threshold(self.config.cold_start_min_threshold);
        let saved = novelty.composite >= threshold && importance >= threshold;

        profile.absorb(
            &emotions,
            &tags,
            embedding.as_deref(),
            novelty.composite,
            self.config.novelty_window,
            self.config.cold_start_buffer_size,
        );
        if let Err(e) = self.persist_profile(&profile) {
            self.metrics.db_errors += 1;
            warn!(error = %e, "failed to persist LTM profile");
        }

        ctx.emit_event(
            &stream,
            "NoveltyCalculatedEvent",
            json!({
                "user_id": payload.user_id,
                "novelty_score": novelty.composite,
                "semantic": novelty.semantic,
                "emotional": novelty.emotional,
                "contextual": novelty.contextual,
                "threshold": threshold,
                "saved": saved,
            }),
            correlation,
        )
        .await;
        ctx.emit_event(
            &stream,
            "ImportanceCalculatedEvent",
            json!({
                "user_id": payload.user_id,
                "importance_score": importance,
                "trigger_reason": trigger.as_str(),
                "saved": saved,
            }),
            correlation,
        )
        .await;

        if !saved {
            self.metrics.novelty_rejections += 1;
            if importance >= threshold {
                // High importance lost to familiarity: worth a trace.
                ctx.emit_event(
                    &stream,
                    "MemoryRejectedEvent",
                    json!({
                        "user_id": payload.user_id,
                        "novelty_score": novelty.composite,
                        "importance_score": importance,
                        "threshold": threshold,
                    }),
                    correlation,
                )
                .await;
            }
            return;
        }

        let memory = LtmMemory::new(
            &payload.user_id,
            &payload.user_text,
            &payload.bot_response,
            emotions,
            payload.dominant_emotions.clone(),
            importance,
            novelty.composite,
            classify_memory_type(&payload.user_text, &payload.bot_response),
            trigger,
            tags,
            embedding,
        );
        match self.store.as_ref().unwrap().save_memory(&memory) {
            Ok(()) => {
                self.metrics.saves += 1;
                info!(
                    user_id = %payload.user_id,
                    novelty = novelty.composite,
                    importance,
                    trigger = trigger.as_str(),
                    "LTM memory saved"
                );
            }
            Err(e) => {
                self.metrics.db_errors += 1;
                warn!(error = %e, "failed to save LTM memory");
            }
        }
    }

    async fn handle_search(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        self.metrics.searches += 1;
        let payload: SearchPayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed GetLtmMemory payload");
                return;
            }
        };
        let Some(reply_to) = msg.reply_target().map(String::from) else {
            warn!("GetLtmMemory without reply_to or sender_id");
            return;
        };
        let limit = payload.limit.unwrap_or(self.config.context_limit);

        let result = match &self.store {
            None => {
                self.log_degraded_once();
                Ok(Vec::new())
            }
            Some(store) => match (payload.search_type.as_str(), &payload.query_vector) {
                ("vector", Some(query)) if !query.is_empty() => {
                    store.search_vector(&payload.user_id, query, limit)
                }
                _ => store.recent(&payload.user_id, limit),
            },
        };

        let (success, results, error) = match result {
            Ok(memories) => {
                let rendered: Vec<Value> = memories
                    .iter()
                    .map(|m| {
                        json!({
                            "memory_id": m.memory_id,
                            "user_text": m.user_text,
                            "bot_text": m.bot_text,
                            "dominant_emotions": m.dominant_emotions,
                            "importance_score": m.importance_score,
                            "memory_type": m.memory_type.as_str(),
                            "created_at": m.created_at.to_rfc3339(),
                        })
                    })
                    .collect();
                (true, rendered, None)
            }
            Err(e) => {
                self.metrics.db_errors += 1;
                (false, Vec::new(), Some(e.to_string()))
            }
        };

        ctx.emit_event(
            &format!("ltm_{}", payload.user_id),
            "LTMSearchCompletedEvent",
            json!({
                "user_id": payload.user_id,
                "search_type": payload.search_type,
                "results": results.len(),
                "success": success,
            }),
            payload.request_id.as_deref(),
        )
        .await;

        let response = ActorMessage::new(
            MessageType::LtmResponse,
            json!({
                "user_id": payload.user_id,
                "success": success,
                "results": results,
                "error": error,
                "request_id": payload.request_id,
            }),
        );
        if let Err(e) = ctx.send(&reply_to, response).await {
            warn!(reply_to = %reply_to, error = %e, "failed to deliver LtmResponse");
        }
    }

    async fn handle_embedding(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        self.metrics.embedding_requests += 1;
        let payload: EmbeddingPayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed GenerateEmbedding payload");
                return;
            }
        };
        let Some(reply_to) = msg.reply_target().map(String::from) else {
            warn!("GenerateEmbedding without reply_to or sender_id");
            return;
        };

        let result = match &self.embedder {
            Some(embedder) => {
                let deadline = Duration::from_secs_f64(self.config.embedding_request_timeout_secs);
                match tokio::time::timeout(deadline, embedder.embed(&payload.text)).await {
                    Ok(Ok(vector)) => Ok(vector),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("embedding timeout".to_string()),
                }
            }
            None => Err("no embedder configured".to_string()),
        };

        let response = match result {
            Ok(vector) => {
                debug!(user_id = %payload.user_id, dims = vector.len(), "embedding generated");
                ActorMessage::new(
                    MessageType::EmbeddingResponse,
                    json!({
                        "user_id": payload.user_id,
                        "success": true,
                        "embedding": vector,
                        "request_id": payload.request_id,
                    }),
                )
            }
            Err(error) => {
                warn!(user_id = %payload.user_id, error = %error, "embedding failed");
                ActorMessage::new(
                    MessageType::EmbeddingResponse,
                    json!({
                        "user_id": payload.user_id,
                        "success": false,
                        "error": error,
                        "request_id": payload.request_id,
                    }),
                )
            }
        };
        if let Err(e) = ctx.send(&reply_to, response).await {
            warn!(reply_to = %reply_to, error = %e, "failed to deliver EmbeddingResponse");
        }
    }

    fn handle_delete(&mut self, msg: &ActorMessage) {
        let payload: DeletePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed DeleteLtmMemory payload");
                return;
            }
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_memory(&payload.memory_id) {
                warn!(memory_id = %payload.memory_id, error = %e, "delete failed");
            }
        }
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        let deadline = Duration::from_secs_f64(self.config.embedding_request_timeout_secs);
        match tokio::time::timeout(deadline, embedder.embed(text)).await {
            Ok(Ok(vector)) => Some(vector),
            Ok(Err(e)) => {
                debug!(error = %e, "embedding unavailable for evaluation");
                None
            }
            Err(_) => {
                debug!("embedding timed out during evaluation");
                None
            }
        }
    }

    fn load_or_create_profile(&self, user_id: &str) -> crate::Result<UserProfile> {
        let store = self.store.as_ref().expect("checked by caller");
        Ok(store
            .load_profile(user_id)?
            .unwrap_or_else(|| UserProfile::new(user_id)))
    }

    fn persist_profile(&self, profile: &UserProfile) -> crate::Result<()> {
        self.store.as_ref().expect("checked by caller").save_profile(profile)
    }
}

#[async_trait]
impl Actor for LtmActor {
    fn actor_id(&self) -> &str {
        "ltm"
    }

    async fn initialize(&mut self, _ctx: &ActorContext) -> anima_runtime::Result<()> {
        if self.store.is_some() {
            return Ok(());
        }
        let Some(path) = self.db_path.clone() else {
            return Ok(());
        };
        if let Some(parent) = std::path::Path::new(&path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        match Connection::open(&path) {
            Ok(conn) => match LtmStore::new(conn) {
                Ok(store) => {
                    self.store = Some(store);
                    info!("LTM actor initialized");
                }
                Err(e) => warn!(error = %e, "LTM schema init failed, entering degraded mode"),
            },
            Err(e) => warn!(error = %e, "LTM database unavailable, entering degraded mode"),
        }
        Ok(())
    }

    async fn handle(&mut self, msg: ActorMessage, ctx: &ActorContext) -> anima_runtime::Result<()> {
        match msg.message_type {
            MessageType::EvaluateForLtm | MessageType::SaveToLtm => {
                self.handle_evaluate(&msg, ctx).await
            }
            MessageType::GetLtmMemory => self.handle_search(&msg, ctx).await,
            MessageType::GenerateEmbedding => self.handle_embedding(&msg, ctx).await,
            MessageType::DeleteLtmMemory => self.handle_delete(&msg),
            other => warn!(message_type = %other, "LTM received unknown message type"),
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anima_runtime::Result<()> {
        info!(
            evaluations = self.metrics.evaluations,
            calibration_skips = self.metrics.calibration_skips,
            saves = self.metrics.saves,
            rejections = self.metrics.novelty_rejections,
            searches = self.metrics.searches,
            embeddings = self.metrics.embedding_requests,
            db_errors = self.metrics.db_errors,
            "LTM final metrics"
        );
        Ok(())
    }
}
