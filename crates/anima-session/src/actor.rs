use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use anima_core::config::AnimaConfig;
use anima_core::emotion::EmotionVector;
use anima_core::message::{ActorMessage, MessageType};
use anima_runtime::{Actor, ActorContext, RuntimeError};

use crate::analysis::{messages_from_context, run_personality_analysis};
use crate::mode::{ModeDetector, ModeLexicon};
use crate::pending::{PendingRequest, Readiness};
use crate::session::Session;

// Collaborator actor ids. The rate-limit gate, emotion classifier host,
// generation pipeline, and chat transport are registered by the embedding
// application under these names.
const AUTH: &str = "auth";
const MEMORY: &str = "memory";
const LTM: &str = "ltm";
const PARTNER: &str = "talk_model";
const PERSONALITY: &str = "personality";
const PERCEPTION: &str = "perception";
const GENERATION: &str = "generation";
const TRANSPORT: &str = "transport";

/// Prefix distinguishing personality-analysis context requests from the
/// per-turn fan-out.
const ANALYSIS_PREFIX: &str = "analysis:";

#[derive(Debug, Deserialize)]
struct UserMessagePayload {
    user_id: String,
    chat_id: i64,
    text: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LimitResponsePayload {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    unlimited: bool,
    #[serde(default)]
    messages_today: u32,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    approaching_limit: bool,
    #[serde(default)]
    messages_remaining: Option<u32>,
    #[serde(default)]
    subscription_expiring: bool,
    #[serde(default)]
    days_remaining: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ContextResponsePayload {
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponsePayload {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LtmResponsePayload {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartnerModelResponsePayload {
    #[serde(default)]
    recommended_mode: Option<String>,
    #[serde(default)]
    mode_confidence: f64,
    #[serde(default)]
    persona_version: Option<i64>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmotionResultPayload {
    user_id: String,
    #[serde(default)]
    emotions: BTreeMap<String, f64>,
    #[serde(default)]
    dominant_emotions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BotResponsePayload {
    user_id: String,
    text: String,
    #[serde(default)]
    generated_at: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingLimit {
    user_id: String,
    chat_id: i64,
    text: String,
    username: Option<String>,
    created_at: chrono::DateTime<Utc>,
}

/// The per-user-turn fan-out coordinator.
pub struct SessionActor {
    config: AnimaConfig,
    detector: ModeDetector,
    sessions: HashMap<String, Session>,
    pending: HashMap<String, PendingRequest>,
    pending_limits: HashMap<String, PendingLimit>,
    janitor: Option<JoinHandle<()>>,
}

impl SessionActor {
    pub fn new(config: AnimaConfig) -> Self {
        let detector = ModeDetector::new(ModeLexicon::default(), config.mode.clone());
        Self {
            config,
            detector,
            sessions: HashMap::new(),
            pending: HashMap::new(),
            pending_limits: HashMap::new(),
            janitor: None,
        }
    }

    async fn get_or_create_session(
        &mut self,
        user_id: &str,
        username: Option<String>,
        ctx: &ActorContext,
    ) -> &mut Session {
        if !self.sessions.contains_key(user_id) {
            let session = Session::new(user_id, username);
            ctx.emit_event(
                &format!("user_{user_id}"),
                "SessionCreatedEvent",
                json!({
                    "user_id": user_id,
                    "username": session.username,
                    "created_at": session.created_at.to_rfc3339(),
                }),
                None,
            )
            .await;
            info!(user_id, "created new session");
            self.sessions.insert(user_id.to_string(), session);
        }
        self.sessions.get_mut(user_id).unwrap()
    }

    async fn handle_user_message(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        let payload: UserMessagePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed UserMessage payload");
                return;
            }
        };

        let session = self
            .get_or_create_session(&payload.user_id, payload.username.clone(), ctx)
            .await;
        session.last_user_text = Some(payload.text.clone());
        session.last_activity = Utc::now();

        let limit_request_id = Uuid::new_v4().to_string();
        let pending_limit = PendingLimit {
            user_id: payload.user_id.clone(),
            chat_id: payload.chat_id,
            text: payload.text.clone(),
            username: payload.username.clone(),
            created_at: Utc::now(),
        };

        let check = ActorMessage::new(
            MessageType::CheckLimit,
            json!({
                "user_id": payload.user_id,
                "request_id": limit_request_id,
            }),
        )
        .with_reply_to(ctx.actor_id());

        match ctx.send(AUTH, check).await {
            Ok(()) => {
                self.pending_limits
                    .insert(limit_request_id.clone(), pending_limit);
                debug!(user_id = %payload.user_id, request_id = %limit_request_id, "sent CheckLimit");
            }
            Err(RuntimeError::ActorNotFound { .. }) => {
                // No gate registered in this deployment: proceed directly.
                debug!("no auth gate registered, skipping limit check");
                self.continue_processing(pending_limit, ctx).await;
            }
            Err(e) => {
                warn!(error = %e, "CheckLimit delivery failed, proceeding without gate");
                self.continue_processing(pending_limit, ctx).await;
            }
        }
    }

    async fn handle_limit_response(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        let payload: LimitResponsePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed LimitResponse payload");
                return;
            }
        };
        let Some(request_id) = payload.request_id.clone() else {
            warn!("LimitResponse without request_id");
            return;
        };
        let Some(pending) = self.pending_limits.remove(&request_id) else {
            warn!(request_id = %request_id, "LimitResponse for unknown request");
            return;
        };

        if payload.approaching_limit {
            let remaining = payload.messages_remaining.unwrap_or(0);
            let limit = payload.limit.unwrap_or(self.config.limits.daily_message_limit);
            self.notify_user(
                &pending,
                format!("You have {remaining} of {limit} daily messages left."),
                ctx,
            )
            .await;
        }
        if payload.subscription_expiring {
            let text = match payload.days_remaining {
                Some(0) | None => "Your subscription expires today.".to_string(),
                Some(days) => format!("Your subscription expires in {days} days."),
            };
            self.notify_user(&pending, text, ctx).await;
        }

        let limit = payload.limit.unwrap_or(self.config.limits.daily_message_limit);
        if !payload.unlimited && payload.messages_today >= limit {
            warn!(
                user_id = %pending.user_id,
                messages_today = payload.messages_today,
                limit,
                "daily limit exceeded"
            );
            ctx.emit_event(
                &format!("user_{}", pending.user_id),
                "LimitExceededEvent",
                json!({
                    "user_id": pending.user_id,
                    "messages_today": payload.messages_today,
                    "daily_limit": limit,
                }),
                None,
            )
            .await;
            let exceeded = ActorMessage::new(
                MessageType::LimitExceeded,
                json!({
                    "user_id": pending.user_id,
                    "chat_id": pending.chat_id,
                    "messages_today": payload.messages_today,
                    "limit": limit,
                }),
            );
            if let Err(e) = ctx.send(TRANSPORT, exceeded).await {
                warn!(error = %e, "failed to deliver LimitExceeded notice");
            }
            return;
        }

        debug!(user_id = %pending.user_id, "within limits, processing message");
        self.continue_processing(pending, ctx).await;
    }

    /// The fan-out phase: ask every collateral source in parallel, tagged
    /// with one request id, then wait for the readiness condition.
    async fn continue_processing(&mut self, limit: PendingLimit, ctx: &ActorContext) {
        let request_id = Uuid::new_v4().to_string();
        let mut pending = PendingRequest::new(
            &request_id,
            &limit.user_id,
            limit.chat_id,
            &limit.text,
            limit.username.clone(),
        );

        if let Some(session) = self.sessions.get_mut(&limit.user_id) {
            session.message_count += 1;
            session.messages_since_analysis += 1;
            session.last_activity = Utc::now();
        }

        let stm_request = ActorMessage::new(
            MessageType::GetContext,
            json!({
                "user_id": limit.user_id,
                "request_id": request_id,
            }),
        )
        .with_reply_to(ctx.actor_id());
        if let Err(e) = ctx.send(MEMORY, stm_request).await {
            // STM is mandatory for readiness; degrade to an empty context.
            warn!(error = %e, "GetContext delivery failed, using empty context");
            pending.stm_received = true;
        }

        let embed_request = ActorMessage::new(
            MessageType::GenerateEmbedding,
            json!({
                "user_id": limit.user_id,
                "text": limit.text,
                "request_id": request_id,
            }),
        )
        .with_reply_to(ctx.actor_id());
        match ctx.send(LTM, embed_request).await {
            Ok(()) => {
                pending.expecting_embedding = true;
                pending.expecting_ltm = true;
                pending.ltm_requested_at = Some(Utc::now());
            }
            Err(e) => {
                debug!(error = %e, "embedding request failed, skipping LTM branch");
            }
        }

        let partner_request = ActorMessage::new(
            MessageType::GetPartnerModel,
            json!({
                "user_id": limit.user_id,
                "request_id": request_id,
            }),
        )
        .with_reply_to(ctx.actor_id());
        match ctx.send(PARTNER, partner_request).await {
            Ok(()) => pending.partner_requested = true,
            Err(e) => debug!(error = %e, "partner model request failed, skipping"),
        }

        let personality_request = ActorMessage::new(
            MessageType::GetPersonalityProfile,
            json!({
                "user_id": limit.user_id,
                "request_id": request_id,
            }),
        )
        .with_reply_to(ctx.actor_id());
        match ctx.send(PERSONALITY, personality_request).await {
            Ok(()) => pending.personality_requested = true,
            Err(e) => debug!(error = %e, "personality request failed, skipping"),
        }

        let emotion_request = ActorMessage::new(
            MessageType::AnalyzeEmotion,
            json!({
                "user_id": limit.user_id,
                "text": limit.text,
            }),
        )
        .with_reply_to(ctx.actor_id());
        if let Err(e) = ctx.send(PERCEPTION, emotion_request).await {
            debug!(error = %e, "emotion analysis request failed");
        }

        self.pending.insert(request_id.clone(), pending);
        self.maybe_trigger_analysis(&limit.user_id, ctx).await;
        self.check_ready(&request_id, ctx).await;
    }

    /// Every N user messages, kick off the personality-analysis pipeline.
    /// Failures are logged and never block the turn.
    async fn maybe_trigger_analysis(&mut self, user_id: &str, ctx: &ActorContext) {
        let interval = self.config.limits.analysis_interval;
        let Some(session) = self.sessions.get_mut(user_id) else {
            return;
        };
        if interval == 0 || session.messages_since_analysis < interval {
            return;
        }
        session.messages_since_analysis = 0;

        let request_id = format!("{ANALYSIS_PREFIX}{}:{}", user_id, Uuid::new_v4());
        let history_request = ActorMessage::new(
            MessageType::GetContext,
            json!({
                "user_id": user_id,
                "limit": self.config.limits.analysis_history,
                "format": "structured",
                "request_id": request_id,
            }),
        )
        .with_reply_to(ctx.actor_id());
        match ctx.send(MEMORY, history_request).await {
            Ok(()) => info!(user_id, "personality analysis requested"),
            Err(e) => warn!(error = %e, "personality analysis history request failed"),
        }
    }

    async fn handle_context_response(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        let payload: ContextResponsePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed ContextResponse payload");
                return;
            }
        };
        let Some(request_id) = payload.request_id.clone() else {
            warn!("ContextResponse without request_id");
            return;
        };

        if let Some(rest) = request_id.strip_prefix(ANALYSIS_PREFIX) {
            let user_id = rest.split(':').next().unwrap_or_default().to_string();
            self.run_analysis(&user_id, &payload.messages, ctx).await;
            return;
        }

        let Some(pending) = self.pending.get_mut(&request_id) else {
            warn!(request_id = %request_id, "ContextResponse for unknown request");
            return;
        };
        pending.stm_context = payload.messages;
        pending.stm_received = true;
        debug!(
            request_id = %request_id,
            messages = pending.stm_context.len(),
            "received STM context"
        );
        self.check_ready(&request_id, ctx).await;
    }

    async fn run_analysis(&mut self, user_id: &str, messages: &[Value], ctx: &ActorContext) {
        let Some(session) = self.sessions.get(user_id) else {
            return;
        };
        let emotions = session
            .last_emotion_vector
            .as_ref()
            .map(EmotionVector::from_map);
        let history = messages_from_context(messages);
        let outcome = run_personality_analysis(
            user_id,
            &history,
            session.current_mode,
            emotions.as_ref(),
        );

        let update = ActorMessage::new(MessageType::UpdatePartnerModel, outcome.partner_update);
        if let Err(e) = ctx.send(PARTNER, update).await {
            warn!(error = %e, "UpdatePartnerModel delivery failed");
        }
        if let Some(style_update) = outcome.style_update {
            let update = ActorMessage::new(MessageType::UpdatePersonalityContext, style_update);
            if let Err(e) = ctx.send(PERSONALITY, update).await {
                warn!(error = %e, "UpdatePersonalityContext delivery failed");
            }
        }
    }

    async fn handle_embedding_response(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        let payload: EmbeddingResponsePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed EmbeddingResponse payload");
                return;
            }
        };
        let Some(request_id) = payload.request_id.clone() else {
            return;
        };
        if !self.pending.contains_key(&request_id) {
            warn!(request_id = %request_id, "EmbeddingResponse for unknown request");
            return;
        }

        match (payload.success, payload.embedding) {
            (true, Some(vector)) if !vector.is_empty() => {
                let user_id = {
                    let pending = self.pending.get_mut(&request_id).unwrap();
                    pending.embedding_received = true;
                    pending.query_vector = Some(vector.clone());
                    pending.ltm_requested_at = Some(Utc::now());
                    pending.user_id.clone()
                };
                let search = ActorMessage::new(
                    MessageType::GetLtmMemory,
                    json!({
                        "user_id": user_id,
                        "search_type": "vector",
                        "query_vector": vector,
                        "limit": self.config.ltm.context_limit,
                        "request_id": request_id,
                    }),
                )
                .with_reply_to(ctx.actor_id());
                if let Err(e) = ctx.send(LTM, search).await {
                    warn!(error = %e, "vector search request failed");
                    if let Some(pending) = self.pending.get_mut(&request_id) {
                        pending.expecting_ltm = false;
                    }
                }
                self.check_ready(&request_id, ctx).await;
            }
            _ => {
                warn!(
                    error = payload.error.as_deref().unwrap_or("empty embedding"),
                    "embedding failed, falling back to recent search"
                );
                self.fallback_to_recent(&request_id, ctx).await;
            }
        }
    }

    /// Embedding unavailable: resolve the branch and search recent
    /// memories instead.
    async fn fallback_to_recent(&mut self, request_id: &str, ctx: &ActorContext) {
        let Some(pending) = self.pending.get_mut(request_id) else {
            return;
        };
        pending.resolve_embedding_empty();
        pending.ltm_requested_at = Some(Utc::now());
        let user_id = pending.user_id.clone();

        let search = ActorMessage::new(
            MessageType::GetLtmMemory,
            json!({
                "user_id": user_id,
                "search_type": "recent",
                "limit": self.config.ltm.context_limit,
                "request_id": request_id,
            }),
        )
        .with_reply_to(ctx.actor_id());
        if let Err(e) = ctx.send(LTM, search).await {
            warn!(error = %e, "recent search request failed");
            if let Some(pending) = self.pending.get_mut(request_id) {
                pending.expecting_ltm = false;
            }
        }
        info!(user_id = %user_id, "fell back to recent LTM search");
        Box::pin(self.check_ready(request_id, ctx)).await;
    }

    async fn handle_ltm_response(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        let payload: LtmResponsePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed LtmResponse payload");
                return;
            }
        };
        let Some(request_id) = payload.request_id.clone() else {
            return;
        };
        let Some(pending) = self.pending.get_mut(&request_id) else {
            warn!(request_id = %request_id, "LtmResponse for unknown request");
            return;
        };
        if payload.success {
            pending.ltm_memories = payload.results;
        } else {
            // Continue without memories.
            warn!(
                error = payload.error.as_deref().unwrap_or("unknown"),
                "LTM search failed, continuing without memories"
            );
            pending.ltm_memories = Vec::new();
        }
        pending.ltm_received = true;
        self.check_ready(&request_id, ctx).await;
    }

    async fn handle_partner_response(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        let payload: PartnerModelResponsePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed PartnerModelResponse payload");
                return;
            }
        };
        let Some(request_id) = payload.request_id.clone() else {
            return;
        };
        let Some(pending) = self.pending.get_mut(&request_id) else {
            return;
        };
        pending.partner_received = true;
        pending.partner_mode = payload
            .recommended_mode
            .as_deref()
            .and_then(|m| m.parse().ok());
        pending.partner_confidence = payload.mode_confidence;
        if let Some(session) = self.sessions.get_mut(&pending.user_id) {
            session.partner_persona_version = payload.persona_version;
        }
        self.check_ready(&request_id, ctx).await;
    }

    async fn handle_personality_response(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        let request_id = msg
            .payload
            .get("request_id")
            .and_then(Value::as_str)
            .map(String::from);
        let Some(request_id) = request_id else {
            return;
        };
        let Some(pending) = self.pending.get_mut(&request_id) else {
            warn!(request_id = %request_id, "PersonalityProfileResponse for unknown request");
            return;
        };
        pending.personality_received = true;
        pending.personality_profile = Some(json!({
            "active_traits": msg.payload.get("active_traits").cloned().unwrap_or(Value::Null),
            "dominant_traits": msg.payload.get("dominant_traits").cloned().unwrap_or(Value::Null),
            "profile_metrics": msg.payload.get("profile_metrics").cloned().unwrap_or(Value::Null),
            "protection_applied": msg.payload.get("protection_applied").cloned().unwrap_or(Value::Null),
        }));
        self.check_ready(&request_id, ctx).await;
    }

    async fn handle_emotion_result(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        let payload: EmotionResultPayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed EmotionResult payload");
                return;
            }
        };
        let Some(session) = self.sessions.get_mut(&payload.user_id) else {
            warn!(user_id = %payload.user_id, "EmotionResult for unknown session");
            return;
        };
        session.last_emotion_vector = Some(payload.emotions.clone());
        session.last_dominant_emotions = payload.dominant_emotions.clone();
        let user_text = session.last_user_text.clone();
        let username = session.username.clone();

        if !payload.emotions.is_empty() {
            // Emotion scores [0,1] → personality modifiers [0.5,1.5].
            // Zero scores carry no signal and are not forwarded.
            let modifiers: BTreeMap<String, f64> = payload
                .emotions
                .iter()
                .filter(|(_, value)| **value > 0.0)
                .map(|(label, value)| (label.clone(), 0.5 + value))
                .collect();
            let update = ActorMessage::new(
                MessageType::UpdatePersonalityContext,
                json!({
                    "user_id": payload.user_id,
                    "modifier_type": "emotion",
                    "modifier_data": modifiers,
                }),
            );
            if let Err(e) = ctx.send(PERSONALITY, update).await {
                debug!(error = %e, "emotion forwarding failed");
            }
        }

        if let Some(text) = user_text {
            let store = ActorMessage::new(
                MessageType::StoreMemory,
                json!({
                    "user_id": payload.user_id,
                    "message_type": "user",
                    "content": text,
                    "metadata": {
                        "username": username,
                        "emotions": payload.emotions,
                        "dominant_emotions": payload.dominant_emotions,
                    },
                }),
            );
            if let Err(e) = ctx.send(MEMORY, store).await {
                warn!(error = %e, "failed to store user turn");
            }
        }

        ctx.emit_event(
            &format!("user_{}", payload.user_id),
            "EmotionDetectedEvent",
            json!({
                "user_id": payload.user_id,
                "dominant_emotions": payload.dominant_emotions,
                "emotion_scores": payload.emotions,
            }),
            None,
        )
        .await;
    }

    async fn handle_bot_response(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        let payload: BotResponsePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed BotResponse payload");
                return;
            }
        };
        let Some(session) = self.sessions.get_mut(&payload.user_id) else {
            return;
        };
        session.last_bot_response = Some(payload.text.clone());
        session.last_bot_mode = Some(session.current_mode);
        session.last_bot_confidence = Some(session.mode_confidence);

        let mode = session.current_mode;
        let confidence = session.mode_confidence;
        let emotions = session.last_emotion_vector.clone();
        let dominant = session.last_dominant_emotions.clone();
        let user_text = session.last_user_text.clone();

        let store = ActorMessage::new(
            MessageType::StoreMemory,
            json!({
                "user_id": payload.user_id,
                "message_type": "bot",
                "content": payload.text,
                "metadata": {
                    "generated_at": payload.generated_at.unwrap_or_else(|| Utc::now().to_rfc3339()),
                    "mode": mode.as_str(),
                    "mode_confidence": confidence,
                },
            }),
        );
        if let Err(e) = ctx.send(MEMORY, store).await {
            warn!(error = %e, "failed to store bot turn");
        }

        // Completed turn with a strong emotional signal goes to LTM for
        // evaluation.
        if let (Some(emotions), Some(user_text)) = (emotions, user_text) {
            let peak = emotions.values().copied().fold(0.0, f64::max);
            let non_neutral = dominant.iter().any(|label| label != "neutral");
            if peak >= self.config.limits.ltm_trigger_threshold && non_neutral {
                let evaluate = ActorMessage::new(
                    MessageType::EvaluateForLtm,
                    json!({
                        "user_id": payload.user_id,
                        "user_text": user_text,
                        "bot_response": payload.text,
                        "emotions": emotions,
                        "dominant_emotions": dominant,
                    }),
                );
                if let Err(e) = ctx.send(LTM, evaluate).await {
                    warn!(error = %e, "EvaluateForLtm delivery failed");
                }
            }
        }
    }

    async fn check_ready(&mut self, request_id: &str, ctx: &ActorContext) {
        let readiness = match self.pending.get(request_id) {
            Some(pending) => pending.readiness(Utc::now(), &self.config.ltm, &self.config.limits),
            None => return,
        };
        match readiness {
            Readiness::NotReady => {}
            Readiness::EmbeddingOverdue => {
                debug!(request_id, "embedding overdue, falling back to recent search");
                self.fallback_to_recent(request_id, ctx).await;
            }
            Readiness::Ready => {
                let pending = self.pending.remove(request_id).unwrap();
                self.dispatch_generation(pending, ctx).await;
            }
        }
    }

    /// All parts in: decide the mode and emit the generation request.
    async fn dispatch_generation(&mut self, pending: PendingRequest, ctx: &ActorContext) {
        let Some(session) = self.sessions.get_mut(&pending.user_id) else {
            return;
        };
        let previous_mode = session.current_mode;
        let (mode, confidence, details) = self.detector.detect(
            &pending.text,
            session,
            pending.partner_mode,
            pending.partner_confidence,
        );

        let source = if pending.partner_mode.is_some()
            && pending.partner_confidence > self.config.mode.partner_confidence_threshold
        {
            "partner_persona"
        } else {
            "text_analysis"
        };

        if mode != previous_mode {
            ctx.emit_event(
                &format!("user_{}", pending.user_id),
                "ModeDetectedEvent",
                json!({
                    "user_id": pending.user_id,
                    "mode": mode.as_str(),
                    "confidence": confidence,
                    "previous_mode": previous_mode.as_str(),
                    "detection_scores": details.scores,
                    "source": source,
                }),
                Some(&pending.request_id),
            )
            .await;
        }
        session.push_mode(mode, confidence, self.config.mode.history_size);
        info!(
            user_id = %pending.user_id,
            mode = mode.as_str(),
            confidence,
            source,
            "generation mode decided"
        );

        let message_count = session.message_count;
        let generate = ActorMessage::new(
            MessageType::GenerateResponse,
            json!({
                "user_id": pending.user_id,
                "chat_id": pending.chat_id,
                "text": pending.text,
                "message_count": message_count,
                "mode": mode.as_str(),
                "mode_confidence": confidence,
                "historical_context": pending.stm_context,
                "ltm_memories": pending.ltm_memories,
                "personality_profile": pending.personality_profile,
                "request_id": pending.request_id,
            }),
        )
        .with_reply_to(ctx.actor_id());
        if let Err(e) = ctx.send(GENERATION, generate).await {
            warn!(error = %e, "GenerateResponse delivery failed");
            let error_notice = ActorMessage::new(
                MessageType::Error,
                json!({
                    "user_id": pending.user_id,
                    "chat_id": pending.chat_id,
                    "error": "generation unavailable",
                    "error_type": "internal",
                }),
            );
            let _ = ctx.send(TRANSPORT, error_notice).await;
        }
    }

    /// Stale fan-out janitor: re-check every pending turn (timeouts only
    /// advance when something arrives otherwise), then discard records
    /// older than the cap with a diagnostic event.
    async fn sweep_pending(&mut self, ctx: &ActorContext) {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        for request_id in ids {
            self.check_ready(&request_id, ctx).await;
        }

        let now = Utc::now();
        let max_age = self.config.limits.pending_max_age_secs;
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.age_secs(now) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in stale {
            if let Some(pending) = self.pending.remove(&request_id) {
                warn!(request_id = %request_id, user_id = %pending.user_id, "discarding stale pending request");
                ctx.emit_event(
                    &format!("user_{}", pending.user_id),
                    "StalePendingDiscardedEvent",
                    json!({
                        "user_id": pending.user_id,
                        "request_id": request_id,
                        "age_secs": pending.age_secs(now),
                    }),
                    Some(&request_id),
                )
                .await;
            }
        }
        self.pending_limits
            .retain(|_, p| (now - p.created_at).num_seconds().max(0) as u64 <= max_age);
    }

    async fn notify_user(&self, pending: &PendingLimit, text: String, ctx: &ActorContext) {
        let notice = ActorMessage::new(
            MessageType::BotResponse,
            json!({
                "user_id": pending.user_id,
                "chat_id": pending.chat_id,
                "text": text,
                "generated_at": Utc::now().to_rfc3339(),
            }),
        );
        if let Err(e) = ctx.send(TRANSPORT, notice).await {
            debug!(error = %e, "user notice delivery failed");
        }
    }
}

#[async_trait]
impl Actor for SessionActor {
    fn actor_id(&self) -> &str {
        "user_session"
    }

    async fn initialize(&mut self, ctx: &ActorContext) -> anima_runtime::Result<()> {
        // Self-addressed tick driving the stale-pending sweep.
        let system = ctx.system().clone();
        let period = std::time::Duration::from_secs(
            (self.config.limits.pending_max_age_secs / 2).max(1),
        );
        self.janitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let tick = ActorMessage::new(MessageType::Ping, json!({"sweep": true}));
                if system.send("user_session", tick).await.is_err() {
                    break;
                }
            }
        }));
        info!("session orchestrator initialized");
        Ok(())
    }

    async fn handle(&mut self, msg: ActorMessage, ctx: &ActorContext) -> anima_runtime::Result<()> {
        match msg.message_type {
            MessageType::UserMessage | MessageType::ProcessUserMessage => {
                self.handle_user_message(&msg, ctx).await
            }
            MessageType::LimitResponse => self.handle_limit_response(&msg, ctx).await,
            MessageType::ContextResponse => self.handle_context_response(&msg, ctx).await,
            MessageType::EmbeddingResponse => self.handle_embedding_response(&msg, ctx).await,
            MessageType::LtmResponse => self.handle_ltm_response(&msg, ctx).await,
            MessageType::PartnerModelResponse => self.handle_partner_response(&msg, ctx).await,
            MessageType::PersonalityProfileResponse => {
                self.handle_personality_response(&msg, ctx).await
            }
            MessageType::EmotionResult => self.handle_emotion_result(&msg, ctx).await,
            MessageType::BotResponse => self.handle_bot_response(&msg, ctx).await,
            MessageType::CacheHitMetric => {
                if let Some(user_id) = msg.payload.get("user_id").and_then(Value::as_str) {
                    if let Some(session) = self.sessions.get_mut(user_id) {
                        let rate = msg
                            .payload
                            .get("hit_rate")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0);
                        session.push_cache_metric(rate);
                    }
                }
            }
            MessageType::Ping => self.sweep_pending(ctx).await,
            other => debug!(message_type = %other, "session orchestrator ignoring message"),
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anima_runtime::Result<()> {
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
        }
        let count = self.sessions.len();
        self.sessions.clear();
        self.pending.clear();
        self.pending_limits.clear();
        info!(sessions = count, "session orchestrator shut down");
        Ok(())
    }
}
