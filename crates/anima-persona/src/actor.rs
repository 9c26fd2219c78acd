use async_trait::async_trait;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use anima_core::clients::TtlCache;
use anima_core::config::PersonalityConfig;
use anima_core::message::{ActorMessage, MessageType};
use anima_core::types::{GenerationMode, StyleVector};
use anima_runtime::{Actor, ActorContext};

use crate::detector::TraitManifestation;
use crate::store::PersonaStore;

#[derive(Debug, Deserialize)]
struct GetPayload {
    user_id: String,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatePayload {
    user_id: String,
    style_vector: StyleVector,
    recommended_mode: String,
    mode_confidence: f64,
    #[serde(default)]
    style_confidence: Option<f64>,
    #[serde(default)]
    messages_analyzed: Option<i64>,
    #[serde(default)]
    detected_traits: Vec<IncomingTrait>,
}

#[derive(Debug, Deserialize)]
struct IncomingTrait {
    trait_name: String,
    strength: f64,
    #[serde(default)]
    markers: Vec<String>,
}

#[derive(Debug, Default)]
struct PersonaMetrics {
    requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    personas_found: u64,
    personas_not_found: u64,
    versions_written: u64,
    db_errors: u64,
}

/// Partner-model actor: single owner of the `partner_personas` table.
///
/// Reads go cache → database → empty response in degraded mode; updates
/// version the persona only when the style vector moved past the change
/// threshold, and always invalidate the cache entry afterwards.
pub struct PartnerModelActor {
    config: PersonalityConfig,
    db_path: Option<String>,
    store: Option<PersonaStore>,
    cache: Arc<dyn TtlCache>,
    degraded_logged: bool,
    metrics: PersonaMetrics,
}

impl PartnerModelActor {
    pub fn new(config: PersonalityConfig, db_path: &str, cache: Arc<dyn TtlCache>) -> Self {
        Self {
            config,
            db_path: Some(db_path.to_string()),
            store: None,
            cache,
            degraded_logged: false,
            metrics: PersonaMetrics::default(),
        }
    }

    pub fn with_connection(
        config: PersonalityConfig,
        conn: Connection,
        cache: Arc<dyn TtlCache>,
    ) -> Self {
        let store = PersonaStore::new(conn).ok();
        Self {
            config,
            db_path: None,
            store,
            cache,
            degraded_logged: false,
            metrics: PersonaMetrics::default(),
        }
    }

    fn cache_key(user_id: &str) -> String {
        format!("anima:partner_persona:{user_id}")
    }

    async fn handle_get(&mut self, msg: &ActorMessage, ctx: &ActorContext) {
        self.metrics.requests += 1;
        let payload: GetPayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed GetPartnerModel payload");
                return;
            }
        };
        let Some(reply_to) = msg.reply_target().map(String::from) else {
            warn!("GetPartnerModel without reply_to or sender_id");
            return;
        };

        let mut response = json!({
            "user_id": payload.user_id,
            "recommended_mode": null,
            "mode_confidence": 0.0,
            "persona_version": null,
            "degraded_mode": false,
            "request_id": payload.request_id,
        });

        if self.store.is_none() {
            if !self.degraded_logged {
                warn!("partner model in degraded mode: returning empty personas");
                self.degraded_logged = true;
            }
            response["degraded_mode"] = json!(true);
        } else if let Some(cached) = self.cache.get(&Self::cache_key(&payload.user_id)).await {
            self.metrics.cache_hits += 1;
            debug!(user_id = %payload.user_id, "partner persona cache hit");
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&cached) {
                response["recommended_mode"] = value["recommended_mode"].clone();
                response["mode_confidence"] = value["mode_confidence"].clone();
                response["persona_version"] = value["persona_version"].clone();
            }
        } else {
            self.metrics.cache_misses += 1;
            match self.store.as_ref().unwrap().active_persona(&payload.user_id) {
                Ok(Some(persona)) => {
                    self.metrics.personas_found += 1;
                    response["recommended_mode"] =
                        json!(persona.recommended_mode.map(|m| m.as_str()));
                    response["mode_confidence"] = json!(persona.mode_confidence);
                    response["persona_version"] = json!(persona.version);

                    let cache_value = json!({
                        "recommended_mode": persona.recommended_mode.map(|m| m.as_str()),
                        "mode_confidence": persona.mode_confidence,
                        "persona_version": persona.version,
                    });
                    self.cache
                        .set(
                            &Self::cache_key(&payload.user_id),
                            cache_value.to_string(),
                            self.config.partner_cache_ttl_secs,
                        )
                        .await;
                }
                Ok(None) => {
                    self.metrics.personas_not_found += 1;
                    debug!(user_id = %payload.user_id, "no active partner persona");
                }
                Err(e) => {
                    self.metrics.db_errors += 1;
                    warn!(user_id = %payload.user_id, error = %e, "persona lookup failed");
                }
            }
        }

        let reply = ActorMessage::new(MessageType::PartnerModelResponse, response);
        if let Err(e) = ctx.send(&reply_to, reply).await {
            warn!(reply_to = %reply_to, error = %e, "failed to deliver PartnerModelResponse");
        }
    }

    async fn handle_update(&mut self, msg: &ActorMessage) {
        let payload: UpdatePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed UpdatePartnerModel payload");
                return;
            }
        };
        let Some(store) = &self.store else {
            return;
        };
        let Ok(mode) = payload.recommended_mode.parse::<GenerationMode>() else {
            warn!(mode = %payload.recommended_mode, "unknown recommended mode");
            return;
        };

        let should_version = match store.active_persona(&payload.user_id) {
            Ok(Some(existing)) => {
                let delta = payload.style_vector.max_component_delta(&existing.style_vector);
                if delta <= self.config.change_threshold {
                    info!(
                        user_id = %payload.user_id,
                        delta,
                        threshold = self.config.change_threshold,
                        "style change below threshold, keeping current persona"
                    );
                    false
                } else {
                    true
                }
            }
            Ok(None) => true,
            Err(e) => {
                self.metrics.db_errors += 1;
                warn!(error = %e, "could not read active persona");
                return;
            }
        };

        if should_version {
            match store.update_persona(
                &payload.user_id,
                &payload.style_vector,
                payload.style_confidence.unwrap_or(0.3),
                mode,
                payload.mode_confidence,
                payload.messages_analyzed.unwrap_or(0),
            ) {
                Ok((persona_id, version)) => {
                    self.metrics.versions_written += 1;
                    info!(
                        user_id = %payload.user_id,
                        persona_id = %persona_id,
                        version,
                        "new partner persona version"
                    );
                    self.cache.delete(&Self::cache_key(&payload.user_id)).await;
                }
                Err(e) => {
                    self.metrics.db_errors += 1;
                    warn!(error = %e, "persona update failed");
                    return;
                }
            }
        }

        if !payload.detected_traits.is_empty() {
            let traits: Vec<TraitManifestation> = payload
                .detected_traits
                .iter()
                .map(|t| TraitManifestation {
                    trait_name: t.trait_name.clone(),
                    strength: t.strength,
                    markers: t.markers.clone(),
                    emotional_context: Default::default(),
                })
                .collect();
            match store.save_manifestations(&payload.user_id, Some(mode), &traits) {
                Ok(batch) => {
                    info!(
                        user_id = %payload.user_id,
                        traits = traits.len(),
                        batch = %batch,
                        "saved trait manifestations"
                    );
                }
                Err(e) => {
                    self.metrics.db_errors += 1;
                    warn!(error = %e, "failed to save trait manifestations");
                }
            }
        }
    }
}

#[async_trait]
impl Actor for PartnerModelActor {
    fn actor_id(&self) -> &str {
        "talk_model"
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
            Ok(conn) => match PersonaStore::new(conn) {
                Ok(store) => {
                    self.store = Some(store);
                    info!("partner model actor initialized");
                }
                Err(e) => {
                    warn!(error = %e, "persona schema init failed, entering degraded mode")
                }
            },
            Err(e) => warn!(error = %e, "persona database unavailable, entering degraded mode"),
        }
        Ok(())
    }

    async fn handle(&mut self, msg: ActorMessage, ctx: &ActorContext) -> anima_runtime::Result<()> {
        match msg.message_type {
            MessageType::GetPartnerModel => self.handle_get(&msg, ctx).await,
            MessageType::UpdatePartnerModel => self.handle_update(&msg).await,
            other => warn!(message_type = %other, "partner model received unknown message type"),
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anima_runtime::Result<()> {
        info!(
            requests = self.metrics.requests,
            cache_hits = self.metrics.cache_hits,
            cache_misses = self.metrics.cache_misses,
            found = self.metrics.personas_found,
            not_found = self.metrics.personas_not_found,
            versions = self.metrics.versions_written,
            db_errors = self.metrics.db_errors,
            "partner model final metrics"
        );
        Ok(())
    }
}
