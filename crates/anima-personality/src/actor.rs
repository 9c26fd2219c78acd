use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use anima_core::clients::TtlCache;
use anima_core::config::PersonalityConfig;
use anima_core::message::{ActorMessage, MessageType};
use anima_runtime::{Actor, ActorContext};

use crate::db::PersonalityDb;
use crate::profile::{compute_profile, dominant_traits, profile_metrics};
use crate::resonance::ResonanceProfile;
use crate::traits::{base_traits, emotion_trait_affinity, BaseTrait};

#[derive(Debug, Deserialize)]
struct UpdateContextPayload {
    user_id: String,
    modifier_type: String,
    modifier_data: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct GetProfilePayload {
    user_id: String,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Default)]
struct PersonalityMetrics {
    profile_requests: u64,
    cache_hits: u64,
    modifier_updates: u64,
    adaptations: u64,
    core_constraints_applied: u64,
    session_limits_applied: u64,
    recoveries: u64,
    db_errors: u64,
}

/// Personality actor: owns the resonance tables and serves profile
/// requests from a TTL cache that is invalidated on every modifier update
/// or adaptation.
pub struct PersonalityActor {
    config: PersonalityConfig,
    db_path: Option<String>,
    db: Option<PersonalityDb>,
    cache: Arc<dyn TtlCache>,
    traits: Vec<BaseTrait>,
    style_mods: HashMap<String, BTreeMap<String, f64>>,
    emotion_mods: HashMap<String, BTreeMap<String, f64>>,
    session_start: HashMap<String, BTreeMap<String, f64>>,
    metrics: PersonalityMetrics,
}

impl PersonalityActor {
    pub fn new(config: PersonalityConfig, db_path: &str, cache: Arc<dyn TtlCache>) -> Self {
        Self {
            config,
            db_path: Some(db_path.to_string()),
            db: None,
            cache,
            traits: base_traits(),
            style_mods: HashMap::new(),
            emotion_mods: HashMap::new(),
            session_start: HashMap::new(),
            metrics: PersonalityMetrics::default(),
        }
    }

    pub fn with_connection(
        config: PersonalityConfig,
        conn: Connection,
        cache: Arc<dyn TtlCache>,
    ) -> Self {
        let traits = base_traits();
        let db = PersonalityDb::new(conn, &traits).ok();
        Self {
            config,
            db_path: None,
            db,
            cache,
            traits,
            style_mods: HashMap::new(),
            emotion_mods: HashMap::new(),
            session_start: HashMap::new(),
            metrics: PersonalityMetrics::default(),
        }
    }

    fn cache_key(user_id: &str) -> String {
        format!("anima:personality_profile:{user_id}")
    }

    fn load_or_create_resonance(&mut self, user_id: &str) -> ResonanceProfile {
        if let Some(db) = &self.db {
            match db.load_resonance(user_id) {
                Ok(Some(profile)) => return profile,
                Ok(None) => {}
                Err(e) => {
                    self.metrics.db_errors += 1;
                    warn!(error = %e, "failed to load resonance profile");
                }
            }
        }
        ResonanceProfile::new(user_id, &self.traits)
    }

    fn persist_resonance(&mut self, profile: &ResonanceProfile) {
        if let Some(db) = &self.db {
            if let Err(e) = db.save_resonance(profile) {
                self.metrics.db_errors += 1;
                warn!(error = %e, "failed to save resonance profile");
            }
        }
    }

    /// Route an incoming modifier map to per-trait multipliers.
    /// Style modifiers address traits by name; emotion modifiers arrive
    /// keyed by emotion label and fan out through the affinity table.
    fn to_trait_modifiers(&self, modifier_type: &str, data: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let mut mods: BTreeMap<String, f64> = BTreeMap::new();
        match modifier_type {
            "style" => {
                for (name, value) in data {
                    if self.traits.iter().any(|t| t.name == name.as_str()) {
                        mods.insert(name.clone(), value.clamp(0.5, 1.5));
                    }
                }
            }
            _ => {
                for (emotion, value) in data {
                    for trait_name in emotion_trait_affinity(emotion) {
                        let value = value.clamp(0.5, 1.5);
                        let entry = mods.entry((*trait_name).to_string()).or_insert(value);
                        if value > *entry {
                            *entry = value;
                        }
                    }
                }
            }
        }
        mods
    }

    async fn handle_update_context(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        self.metrics.modifier_updates += 1;
        let payload: UpdateContextPayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed UpdatePersonalityContext payload");
                return;
            }
        };

        let mods = self.to_trait_modifiers(&payload.modifier_type, &payload.modifier_data);
        match payload.modifier_type.as_str() {
            "style" => {
                self.style_mods.insert(payload.user_id.clone(), mods);
            }
            "emotion" => {
                self.emotion_mods.insert(payload.user_id.clone(), mods);
            }
            other => {
                warn!(modifier_type = other, "unknown modifier type");
                return;
            }
        }

        if let Some(db) = &self.db {
            let data = serde_json::to_value(&payload.modifier_data).unwrap_or(Value::Null);
            if let Err(e) = db.record_modifier(&payload.user_id, &payload.modifier_type, &data) {
                self.metrics.db_errors += 1;
                warn!(error = %e, "failed to record modifier history");
            }
        }

        let mut resonance = self.load_or_create_resonance(&payload.user_id);
        resonance.touch();
        resonance.interaction_count += 1;

        if resonance.interaction_count % self.config.adaptation_interval == 0 {
            let mut targets = self
                .style_mods
                .get(&payload.user_id)
                .cloned()
                .unwrap_or_default();
            for (name, value) in self
                .emotion_mods
                .get(&payload.user_id)
                .cloned()
                .unwrap_or_default()
            {
                // Where both speak, average them.
                targets
                    .entry(name)
                    .and_modify(|v| *v = (*v + value) / 2.0)
                    .or_insert(value);
            }
            resonance.adapt(&targets, &self.traits, &self.config);
            self.metrics.adaptations += 1;

            ctx.emit_event(
                &format!("personality_{}", payload.user_id),
                "ResonanceCalculatedEvent",
                json!({
                    "user_id": payload.user_id,
                    "coefficients": resonance.coefficients,
                    "interaction_count": resonance.interaction_count,
                    "learning_rate": self.config.learning_rate,
                }),
                None,
            )
            .await;
            ctx.emit_event(
                &format!("personality_{}", payload.user_id),
                "PersonalityAdaptationEvent",
                json!({
                    "user_id": payload.user_id,
                    "targets": targets,
                    "modifier_type": payload.modifier_type,
                }),
                None,
            )
            .await;
        }

        self.persist_resonance(&resonance);
        self.cache.delete(&Self::cache_key(&payload.user_id)).await;
        debug!(user_id = %payload.user_id, modifier_type = %payload.modifier_type, "personality context updated");
    }

    async fn handle_get_profile(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        self.metrics.profile_requests += 1;
        let payload: GetProfilePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed GetPersonalityProfile payload");
                return;
            }
        };
        let Some(reply_to) = msg.reply_target().map(String::from) else {
            warn!("GetPersonalityProfile without reply_to or sender_id");
            return;
        };

        if let Some(cached) = self.cache.get(&Self::cache_key(&payload.user_id)).await {
            self.metrics.cache_hits += 1;
            if let Ok(mut value) = serde_json::from_str::<Value>(&cached) {
                value["request_id"] = json!(payload.request_id);
                let reply = ActorMessage::new(MessageType::PersonalityProfileResponse, value);
                if let Err(e) = ctx.send(&reply_to, reply).await {
                    warn!(error = %e, "failed to deliver cached profile");
                }
                return;
            }
        }

        let resonance = self.load_or_create_resonance(&payload.user_id);
        let days_inactive = resonance.days_inactive(Utc::now());
        let empty = BTreeMap::new();
        let style = self.style_mods.get(&payload.user_id).unwrap_or(&empty);
        let emotion = self.emotion_mods.get(&payload.user_id).unwrap_or(&empty);
        let session_start = self.session_start.get(&payload.user_id).cloned();

        let active = compute_profile(
            &self.traits,
            &resonance,
            style,
            emotion,
            session_start.as_ref(),
            Utc::now(),
        );

        if active.engaged.contains(&"core_constraints") {
            self.metrics.core_constraints_applied += 1;
        }
        if active.engaged.contains(&"session_limits") {
            self.metrics.session_limits_applied += 1;
        }

        // First computation of this session becomes the change baseline.
        if session_start.is_none() {
            self.session_start
                .insert(payload.user_id.clone(), active.traits.clone());
        }

        let mut protection_applied: Vec<&str> = Vec::new();
        if self.traits.iter().any(|t| t.is_core) {
            protection_applied.push("core_constraints");
        }
        if session_start.is_some() {
            protection_applied.push("session_limits");
        }
        if days_inactive >= self.config.recovery_days {
            protection_applied.push("recovery");
        }

        if !active.engaged.is_empty() {
            ctx.emit_event(
                &format!("personality_{}", payload.user_id),
                "AuthenticityCheckEvent",
                json!({
                    "user_id": payload.user_id,
                    "protection_applied": true,
                    "engaged": active.engaged,
                }),
                payload.request_id.as_deref(),
            )
            .await;
        }

        let metrics = profile_metrics(&active.traits);
        let response = json!({
            "user_id": payload.user_id,
            "request_id": payload.request_id,
            "active_traits": active.traits,
            "dominant_traits": dominant_traits(&active.traits, 5),
            "profile_metrics": {
                "stability": metrics.stability,
                "dominance": metrics.dominance,
                "balance": metrics.balance,
            },
            "protection_applied": protection_applied,
            "days_inactive": days_inactive,
            "timestamp": Utc::now().to_rfc3339(),
        });

        self.cache
            .set(
                &Self::cache_key(&payload.user_id),
                response.to_string(),
                self.config.cache_ttl_secs,
            )
            .await;

        let reply = ActorMessage::new(MessageType::PersonalityProfileResponse, response);
        if let Err(e) = ctx.send(&reply_to, reply).await {
            warn!(reply_to = %reply_to, error = %e, "failed to deliver profile response");
        }
    }

    /// Inactivity recovery pass over every stored resonance profile.
    async fn handle_cleanup(&mut self, ctx: &ActorContext) {
        let Some(db) = &self.db else { return };
        let user_ids = match db.all_resonance_user_ids() {
            Ok(ids) => ids,
            Err(e) => {
                self.metrics.db_errors += 1;
                warn!(error = %e, "failed to list resonance profiles");
                return;
            }
        };

        let now = Utc::now();
        for user_id in user_ids {
            let mut profile = self.load_or_create_resonance(&user_id);
            if profile.recover(now, &self.config) {
                self.metrics.recoveries += 1;
                self.persist_resonance(&profile);
                self.cache.delete(&Self::cache_key(&user_id)).await;
                ctx.emit_event(
                    &format!("personality_{user_id}"),
                    "AuthenticityCheckEvent",
                    json!({
                        "user_id": user_id,
                        "protection_applied": true,
                        "engaged": ["recovery"],
                        "days_inactive": profile.days_inactive(now),
                    }),
                    None,
                )
                .await;
                info!(user_id = %user_id, "resonance recovered toward neutral");
            }
        }
    }
}

#[async_trait]
impl Actor for PersonalityActor {
    fn actor_id(&self) -> &str {
        "personality"
    }

    async fn initialize(&mut self, _ctx: &ActorContext) -> anima_runtime::Result<()> {
        if self.db.is_some() {
            return Ok(());
        }
        let Some(path) = self.db_path.clone() else {
            return Ok(());
        };
        if let Some(parent) = std::path::Path::new(&path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        match Connection::open(&path) {
            Ok(conn) => match PersonalityDb::new(conn, &self.traits) {
                Ok(db) => {
                    self.db = Some(db);
                    info!("personality actor initialized");
                }
                Err(e) => {
                    warn!(error = %e, "personality schema init failed, running memory-only")
                }
            },
            Err(e) => warn!(error = %e, "personality database unavailable, running memory-only"),
        }
        Ok(())
    }

    async fn handle(&mut self, msg: ActorMessage, ctx: &ActorContext) -> anima_runtime::Result<()> {
        match msg.message_type {
            MessageType::UpdatePersonalityContext => self.handle_update_context(&msg, ctx).await,
            MessageType::GetPersonalityProfile => self.handle_get_profile(&msg, ctx).await,
            MessageType::CleanupInactiveResonance => self.handle_cleanup(ctx).await,
            other => warn!(message_type = %other, "personality received unknown message type"),
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anima_runtime::Result<()> {
        info!(
            requests = self.metrics.profile_requests,
            cache_hits = self.metrics.cache_hits,
            updates = self.metrics.modifier_updates,
            adaptations = self.metrics.adaptations,
            core_constraints = self.metrics.core_constraints_applied,
            session_limits = self.metrics.session_limits_applied,
            recoveries = self.metrics.recoveries,
            db_errors = self.metrics.db_errors,
            "personality final metrics"
        );
        Ok(())
    }
}
