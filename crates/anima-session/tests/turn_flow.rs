use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use anima_core::config::AnimaConfig;
use anima_core::message::{ActorMessage, MessageType};
use anima_events::{EventStore, MemoryEventStore};
use anima_runtime::{Actor, ActorContext, ActorSystem};
use anima_session::SessionActor;

type Log = Arc<Mutex<Vec<ActorMessage>>>;

/// Scripted collaborator: records what it saw and answers the fan-out the
/// way the real component would on an empty system.
struct Stub {
    id: &'static str,
    log: Log,
}

impl Stub {
    fn new(id: &'static str) -> (Self, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        (Self { id, log: log.clone() }, log)
    }
}

#[async_trait]
impl Actor for Stub {
    fn actor_id(&self) -> &str {
        self.id
    }

    async fn handle(&mut self, msg: ActorMessage, ctx: &ActorContext) -> anima_runtime::Result<()> {
        self.log.lock().unwrap().push(msg.clone());
        let reply_to = msg.reply_target().map(String::from);
        let request_id = msg.payload.get("request_id").cloned();
        let user_id = msg.payload.get("user_id").cloned();

        let response = match msg.message_type {
            MessageType::CheckLimit => Some(ActorMessage::new(
                MessageType::LimitResponse,
                json!({
                    "request_id": request_id,
                    "unlimited": false,
                    "messages_today": 1,
                    "limit": 100,
                }),
            )),
            MessageType::GetContext => Some(ActorMessage::new(
                MessageType::ContextResponse,
                json!({
                    "user_id": user_id,
                    "messages": [],
                    "total_messages": 0,
                    "format": "structured",
                    "request_id": request_id,
                }),
            )),
            MessageType::GenerateEmbedding => Some(ActorMessage::new(
                MessageType::EmbeddingResponse,
                json!({
                    "user_id": user_id,
                    "success": true,
                    "embedding": vec![0.01f32; 384],
                    "request_id": request_id,
                }),
            )),
            MessageType::GetLtmMemory => Some(ActorMessage::new(
                MessageType::LtmResponse,
                json!({
                    "user_id": user_id,
                    "success": true,
                    "results": [],
                    "request_id": request_id,
                }),
            )),
            MessageType::GetPartnerModel => Some(ActorMessage::new(
                MessageType::PartnerModelResponse,
                json!({
                    "user_id": user_id,
                    "recommended_mode": null,
                    "mode_confidence": 0.0,
                    "persona_version": null,
                    "request_id": request_id,
                }),
            )),
            MessageType::GetPersonalityProfile => Some(ActorMessage::new(
                MessageType::PersonalityProfileResponse,
                json!({
                    "user_id": user_id,
                    "request_id": request_id,
                    "active_traits": {"empathy": 0.8},
                    "dominant_traits": ["empathy"],
                    "profile_metrics": {"stability": 0.9, "dominance": 0.3, "balance": 0.8},
                    "protection_applied": [],
                }),
            )),
            MessageType::AnalyzeEmotion => Some(ActorMessage::new(
                MessageType::EmotionResult,
                json!({
                    "user_id": user_id,
                    "emotions": {"neutral": 1.0},
                    "dominant_emotions": ["neutral"],
                }),
            )),
            _ => None,
        };

        if let (Some(reply_to), Some(response)) = (reply_to, response) {
            ctx.send(&reply_to, response).await.ok();
        }
        Ok(())
    }
}

#[tokio::test]
async fn happy_path_turn_dispatches_generation() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new(100_000, 32));
    let system = ActorSystem::new(
        "turn-test",
        anima_core::config::ActorConfig {
            queue_size: 64,
            message_timeout_secs: 0.05,
            ..Default::default()
        },
        anima_core::config::BreakerConfig::default(),
        anima_core::config::DlqConfig {
            cleanup_interval_secs: 0,
            ..Default::default()
        },
    )
    .with_event_store(store.clone());

    system
        .register(Box::new(SessionActor::new(AnimaConfig::default())))
        .await
        .unwrap();

    let mut logs = std::collections::HashMap::new();
    for id in [
        "auth",
        "memory",
        "ltm",
        "talk_model",
        "personality",
        "perception",
        "generation",
        "transport",
    ] {
        let (stub, log) = Stub::new(id);
        system.register(Box::new(stub)).await.unwrap();
        logs.insert(id, log);
    }
    system.start().await.unwrap();
    let handle = system.handle();

    handle
        .send(
            "user_session",
            ActorMessage::new(
                MessageType::UserMessage,
                json!({
                    "user_id": "u1",
                    "chat_id": 1,
                    "text": "Hi",
                    "username": "alice",
                }),
            ),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    // The whole fan-out ran.
    assert_eq!(logs["auth"].lock().unwrap().len(), 1);
    assert!(logs["memory"]
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.message_type == MessageType::GetContext));
    assert!(logs["ltm"]
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.message_type == MessageType::GenerateEmbedding));
    // Embedding succeeded, so the memory search used the vector.
    let ltm_log = logs["ltm"].lock().unwrap();
    let search = ltm_log
        .iter()
        .find(|m| m.message_type == MessageType::GetLtmMemory)
        .expect("no LTM search");
    assert_eq!(search.payload["search_type"], json!("vector"));
    drop(ltm_log);

    // Generation request carries the composed turn.
    let generation_log = logs["generation"].lock().unwrap();
    let generate = generation_log
        .iter()
        .find(|m| m.message_type == MessageType::GenerateResponse)
        .expect("no GenerateResponse");
    assert_eq!(generate.payload["user_id"], json!("u1"));
    assert_eq!(generate.payload["chat_id"], json!(1));
    // "Hi" scores zero everywhere: fallback mode talk at the floor
    // confidence.
    assert_eq!(generate.payload["mode"], json!("talk"));
    assert_eq!(generate.payload["mode_confidence"], json!(0.5));
    assert_eq!(generate.payload["historical_context"], json!([]));
    assert_eq!(generate.payload["ltm_memories"], json!([]));
    assert_eq!(
        generate.payload["personality_profile"]["dominant_traits"],
        json!(["empathy"])
    );
    drop(generation_log);

    // The session stream recorded the birth of the session.
    let events = store.get_stream("user_u1", 0).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type() == "SessionCreatedEvent"));

    // Bot response: both turns land in STM, no LTM evaluation for a
    // neutral turn.
    handle
        .send(
            "user_session",
            ActorMessage::new(
                MessageType::BotResponse,
                json!({
                    "user_id": "u1",
                    "chat_id": 1,
                    "text": "Hello! How are you?",
                }),
            ),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let memory_log = logs["memory"].lock().unwrap();
    let stored: Vec<&ActorMessage> = memory_log
        .iter()
        .filter(|m| m.message_type == MessageType::StoreMemory)
        .collect();
    assert_eq!(stored.len(), 2, "expected user + bot turns in STM");
    assert_eq!(stored[0].payload["message_type"], json!("user"));
    assert_eq!(stored[1].payload["message_type"], json!("bot"));
    drop(memory_log);

    assert!(!logs["ltm"]
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.message_type == MessageType::EvaluateForLtm));

    system.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn emotional_turn_is_sent_to_ltm_for_evaluation() {
    let system = ActorSystem::new(
        "ltm-trigger-test",
        anima_core::config::ActorConfig {
            queue_size: 64,
            message_timeout_secs: 0.05,
            ..Default::default()
        },
        anima_core::config::BreakerConfig::default(),
        anima_core::config::DlqConfig {
            cleanup_interval_secs: 0,
            ..Default::default()
        },
    );
    system
        .register(Box::new(SessionActor::new(AnimaConfig::default())))
        .await
        .unwrap();
    let mut logs = std::collections::HashMap::new();
    for id in [
        "auth",
        "memory",
        "ltm",
        "talk_model",
        "personality",
        "perception",
        "generation",
        "transport",
    ] {
        let (stub, log) = Stub::new(id);
        system.register(Box::new(stub)).await.unwrap();
        logs.insert(id, log);
    }
    system.start().await.unwrap();
    let handle = system.handle();

    handle
        .send(
            "user_session",
            ActorMessage::new(
                MessageType::UserMessage,
                json!({"user_id": "u1", "chat_id": 1, "text": "something amazing happened today"}),
            ),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Inject a high-intensity emotion result, then complete the turn.
    handle
        .send(
            "user_session",
            ActorMessage::new(
                MessageType::EmotionResult,
                json!({
                    "user_id": "u1",
                    "emotions": {"excitement": 0.95},
                    "dominant_emotions": ["excitement"],
                }),
            ),
        )
        .await
        .unwrap();
    handle
        .send(
            "user_session",
            ActorMessage::new(
                MessageType::BotResponse,
                json!({"user_id": "u1", "chat_id": 1, "text": "tell me everything!"}),
            ),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ltm_log = logs["ltm"].lock().unwrap();
    let evaluate = ltm_log
        .iter()
        .find(|m| m.message_type == MessageType::EvaluateForLtm)
        .expect("no EvaluateForLtm");
    assert_eq!(evaluate.payload["emotions"]["excitement"], json!(0.95));
    assert_eq!(
        evaluate.payload["user_text"],
        json!("something amazing happened today")
    );
    drop(ltm_log);

    // The emotion result was also forwarded to the personality core as
    // modifiers in the [0.5, 1.5] band.
    let personality_log = logs["personality"].lock().unwrap();
    let update = personality_log
        .iter()
        .find(|m| {
            m.message_type == MessageType::UpdatePersonalityContext
                && m.payload["modifier_data"].get("excitement").is_some()
        })
        .expect("no personality context update for the emotional turn");
    assert_eq!(update.payload["modifier_type"], json!("emotion"));
    let modifier = update.payload["modifier_data"]["excitement"].as_f64().unwrap();
    assert!((modifier - 1.45).abs() < 1e-9);

    system.stop(Duration::from_secs(1)).await;
}
