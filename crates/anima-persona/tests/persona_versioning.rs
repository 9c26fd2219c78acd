use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::json;

use anima_core::clients::InMemoryTtlCache;
use anima_core::config::{ActorConfig, BreakerConfig, DlqConfig, PersonalityConfig};
use anima_core::message::{ActorMessage, MessageType};
use anima_persona::PartnerModelActor;
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

fn update_msg(style: (f64, f64, f64, f64)) -> ActorMessage {
    ActorMessage::new(
        MessageType::UpdatePartnerModel,
        json!({
            "user_id": "u1",
            "style_vector": {
                "playfulness": style.0,
                "seriousness": style.1,
                "emotionality": style.2,
                "creativity": style.3,
            },
            "recommended_mode": "expert",
            "mode_confidence": 0.8,
            "style_confidence": 0.6,
            "messages_analyzed": 25,
        }),
    )
}

fn get_msg() -> ActorMessage {
    ActorMessage::new(MessageType::GetPartnerModel, json!({"user_id": "u1"}))
        .with_reply_to("sink")
}

async fn latest_version(
    seen: &Arc<Mutex<Vec<ActorMessage>>>,
    handle: &anima_runtime::SystemHandle,
) -> serde_json::Value {
    handle.send("talk_model", get_msg()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let replies = seen.lock().unwrap();
    replies
        .iter()
        .rev()
        .find(|m| m.message_type == MessageType::PartnerModelResponse)
        .expect("no PartnerModelResponse")
        .payload["persona_version"]
        .clone()
}

#[tokio::test]
async fn versioning_respects_change_threshold_and_cache_stays_fresh() {
    let system = ActorSystem::new(
        "persona-test",
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

    let config = PersonalityConfig {
        change_threshold: 0.05,
        partner_cache_ttl_secs: 600,
        ..Default::default()
    };
    let cache = Arc::new(InMemoryTtlCache::new(64));
    let actor =
        PartnerModelActor::with_connection(config, Connection::open_in_memory().unwrap(), cache);
    system.register(Box::new(actor)).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    system
        .register(Box::new(Sink { seen: seen.clone() }))
        .await
        .unwrap();
    system.start().await.unwrap();
    let handle = system.handle();

    // First update creates version 1.
    handle
        .send("talk_model", update_msg((0.3, 0.7, 0.5, 0.5)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(latest_version(&seen, &handle).await, json!(1));

    // Sub-threshold drift: existing version retained (served from cache).
    handle
        .send("talk_model", update_msg((0.31, 0.69, 0.51, 0.49)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(latest_version(&seen, &handle).await, json!(1));

    // A real shift versions the persona and invalidates the cache; the
    // next read must reflect the new version, never the stale one.
    handle
        .send("talk_model", update_msg((0.8, 0.2, 0.5, 0.5)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(latest_version(&seen, &handle).await, json!(2));

    system.stop(Duration::from_secs(1)).await;
}
