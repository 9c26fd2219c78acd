use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::json;

use anima_core::clients::InMemoryTtlCache;
use anima_core::config::{ActorConfig, BreakerConfig, DlqConfig, PersonalityConfig};
use anima_core::message::{ActorMessage, MessageType};
use anima_personality::PersonalityActor;
use anima_runtime::{Actor, ActorContext, ActorSystem};

struct Sink {
    seen: Arc<Mutex<Vec<ActorMessage>>>,
}

#[async_trait]
impl Actor for Sink {
    fn actor_id(&self) -> &str {
        "sink"
    }

    async fn handle(&mut self, msg: ActorMessage, _ctx: &ActorContext) -> anima_runtime::Result<()> {
        self.seen.lock().unwrap().push(msg);
        Ok(())
    }
}

#[tokio::test]
async fn hostile_modifiers_cannot_break_core_traits() {
    let system = ActorSystem::new(
        "personality-test",
        ActorConfig {
            queue_size: 32,
            message_timeout_secs: 0.05,
            ..Default::default()
        },
        BreakerConfig::default(),
        DlqConfig {
            cleanup_interval_secs: 0,
            ..Default::default()
        },
    );

    let cache = Arc::new(InMemoryTtlCache::new(64));
    let actor = PersonalityActor::with_connection(
        PersonalityConfig::default(),
        Connection::open_in_memory().unwrap(),
        cache,
    );
    system.register(Box::new(actor)).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    system
        .register(Box::new(Sink { seen: seen.clone() }))
        .await
        .unwrap();
    system.start().await.unwrap();
    let handle = system.handle();

    // Hostile style modifier pushing every trait to the minimum.
    handle
        .send(
            "personality",
            ActorMessage::new(
                MessageType::UpdatePersonalityContext,
                json!({
                    "user_id": "u1",
                    "modifier_type": "style",
                    "modifier_data": {
                        "empathy": 0.5,
                        "curiosity": 0.5,
                        "caring": 0.5,
                        "irony": 0.5,
                    },
                }),
            ),
        )
        .await
        .unwrap();

    handle
        .send(
            "personality",
            ActorMessage::new(
                MessageType::GetPersonalityProfile,
                json!({"user_id": "u1", "request_id": "req-1"}),
            )
            .with_reply_to("sink"),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let replies = seen.lock().unwrap();
    let profile = replies
        .iter()
        .find(|m| m.message_type == MessageType::PersonalityProfileResponse)
        .expect("no profile response");

    let active = &profile.payload["active_traits"];
    // Core floor: active value never below 0.4 × base.
    assert!(active["curiosity"].as_f64().unwrap() >= 0.4 * 0.8 - 1e-9);
    assert!(active["empathy"].as_f64().unwrap() >= 0.4 * 0.8 - 1e-9);
    assert!(active["caring"].as_f64().unwrap() >= 0.4 * 0.75 - 1e-9);

    let protections: Vec<String> = profile.payload["protection_applied"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert!(protections.contains(&"core_constraints".to_string()));
    assert_eq!(profile.payload["request_id"], json!("req-1"));
    drop(replies);

    system.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn profile_cache_is_invalidated_by_modifier_updates() {
    let system = ActorSystem::new(
        "personality-cache-test",
        ActorConfig {
            queue_size: 32,
            message_timeout_secs: 0.05,
            ..Default::default()
        },
        BreakerConfig::default(),
        DlqConfig {
            cleanup_interval_secs: 0,
            ..Default::default()
        },
    );
    let cache = Arc::new(InMemoryTtlCache::new(64));
    let actor = PersonalityActor::with_connection(
        PersonalityConfig::default(),
        Connection::open_in_memory().unwrap(),
        cache,
    );
    system.register(Box::new(actor)).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    system
        .register(Box::new(Sink { seen: seen.clone() }))
        .await
        .unwrap();
    system.start().await.unwrap();
    let handle = system.handle();

    let get = || {
        ActorMessage::new(
            MessageType::GetPersonalityProfile,
            json!({"user_id": "u1"}),
        )
        .with_reply_to("sink")
    };

    handle.send("personality", get()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let baseline = seen.lock().unwrap().last().unwrap().payload["active_traits"]["playfulness"]
        .as_f64()
        .unwrap();

    // Boost playfulness via an emotion modifier; the cached profile must
    // not be served afterwards.
    handle
        .send(
            "personality",
            ActorMessage::new(
                MessageType::UpdatePersonalityContext,
                json!({
                    "user_id": "u1",
                    "modifier_type": "emotion",
                    "modifier_data": {"joy": 1.5},
                }),
            ),
        )
        .await
        .unwrap();
    handle.send("personality", get()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let boosted = seen.lock().unwrap().last().unwrap().payload["active_traits"]["playfulness"]
        .as_f64()
        .unwrap();
    assert!(
        boosted > baseline,
        "expected boost, baseline {baseline} vs {boosted}"
    );

    system.stop(Duration::from_secs(1)).await;
}
