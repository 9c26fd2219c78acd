use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use anima_core::clients::{classify_with_timeout, EmotionClassifier};
use anima_core::emotion::EmotionVector;
use anima_core::message::{ActorMessage, MessageType};
use anima_runtime::{Actor, ActorContext};

#[derive(Debug, Deserialize)]
struct AnalyzePayload {
    user_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    request_id: Option<String>,
}

/// Wraps the synchronous CPU-bound emotion classifier behind the bus.
///
/// Classification runs on the blocking pool with a deadline; any failure
/// (timeout, panic, empty input) degrades to the neutral vector so the
/// turn never stalls on perception.
pub struct PerceptionActor<C: EmotionClassifier + 'static> {
    classifier: Arc<C>,
    timeout: Duration,
    analyzed: u64,
    errors: u64,
}

impl<C: EmotionClassifier + 'static> PerceptionActor<C> {
    pub fn new(classifier: Arc<C>, timeout: Duration) -> Self {
        Self {
            classifier,
            timeout,
            analyzed: 0,
            errors: 0,
        }
    }

    async fn reply(
        &self,
        ctx: &ActorContext,
        reply_to: &str,
        payload: &AnalyzePayload,
        emotions: EmotionVector,
        dominant: Vec<String>,
        error: Option<String>,
    ) {
        let response = ActorMessage::new(
            MessageType::EmotionResult,
            json!({
                "user_id": payload.user_id,
                "emotions": emotions.to_map(),
                "dominant_emotions": dominant,
                "error": error,
                "request_id": payload.request_id,
            }),
        );
        if let Err(e) = ctx.send(reply_to, response).await {
            warn!(reply_to, error = %e, "failed to deliver EmotionResult");
        }
    }
}

#[async_trait]
impl<C: EmotionClassifier + 'static> Actor for PerceptionActor<C> {
    fn actor_id(&self) -> &str {
        "perception"
    }

    async fn handle(&mut self, msg: ActorMessage, ctx: &ActorContext) -> anima_runtime::Result<()> {
        if msg.message_type != MessageType::AnalyzeEmotion {
            return Ok(());
        }
        let payload: AnalyzePayload = match msg.payload_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed AnalyzeEmotion payload");
                return Ok(());
            }
        };
        let Some(reply_to) = msg.reply_target().map(String::from) else {
            warn!("AnalyzeEmotion without reply_to or sender_id");
            return Ok(());
        };

        if payload.text.trim().is_empty() {
            self.reply(
                ctx,
                &reply_to,
                &payload,
                EmotionVector::neutral(),
                vec!["neutral".to_string()],
                Some("empty text".to_string()),
            )
            .await;
            return Ok(());
        }

        match classify_with_timeout(self.classifier.clone(), payload.text.clone(), self.timeout)
            .await
        {
            Ok((emotions, dominant)) => {
                self.analyzed += 1;
                self.reply(ctx, &reply_to, &payload, emotions, dominant, None).await;
            }
            Err(e) => {
                self.errors += 1;
                warn!(user_id = %payload.user_id, error = %e, "emotion analysis failed, replying neutral");
                self.reply(
                    ctx,
                    &reply_to,
                    &payload,
                    EmotionVector::neutral(),
                    vec!["neutral".to_string()],
                    Some(e.to_string()),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anima_runtime::Result<()> {
        info!(
            analyzed = self.analyzed,
            errors = self.errors,
            "perception actor shut down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_core::config::{ActorConfig, BreakerConfig, DlqConfig};
    use anima_runtime::ActorSystem;
    use std::sync::Mutex;

    struct KeywordClassifier;

    impl EmotionClassifier for KeywordClassifier {
        fn classify(&self, text: &str) -> anima_core::Result<(EmotionVector, Vec<String>)> {
            let mut emotions = EmotionVector::zeros();
            if text.contains("great") {
                emotions.set("joy", 0.9);
            } else {
                emotions.set("neutral", 0.8);
            }
            let dominant = emotions.dominant(3);
            Ok((emotions, dominant))
        }
    }

    struct Sink {
        seen: Arc<Mutex<Vec<ActorMessage>>>,
    }

    #[async_trait]
    impl Actor for Sink {
        fn actor_id(&self) -> &str {
            "sink"
        }

        async fn handle(
            &mut self,
            msg: ActorMessage,
            _ctx: &ActorContext,
        ) -> anima_runtime::Result<()> {
            self.seen.lock().unwrap().push(msg);
            Ok(())
        }
    }

    #[tokio::test]
    async fn classifier_result_is_routed_back() {
        let system = ActorSystem::new(
            "perception-test",
            ActorConfig {
                queue_size: 16,
                message_timeout_secs: 0.05,
                ..Default::default()
            },
            BreakerConfig::default(),
            DlqConfig {
                cleanup_interval_secs: 0,
                ..Default::default()
            },
        );
        system
            .register(Box::new(PerceptionActor::new(
                Arc::new(KeywordClassifier),
                Duration::from_millis(500),
            )))
            .await
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        system
            .register(Box::new(Sink { seen: seen.clone() }))
            .await
            .unwrap();
        system.start().await.unwrap();

        system
            .handle()
            .send(
                "perception",
                ActorMessage::new(
                    MessageType::AnalyzeEmotion,
                    json!({"user_id": "u1", "text": "what a great day"}),
                )
                .with_reply_to("sink"),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let replies = seen.lock().unwrap();
        let result = replies
            .iter()
            .find(|m| m.message_type == MessageType::EmotionResult)
            .expect("no EmotionResult");
        assert_eq!(result.payload["dominant_emotions"][0], json!("joy"));
        assert!(result.payload["error"].is_null());
        drop(replies);

        // Empty text degrades to neutral instead of failing.
        system
            .handle()
            .send(
                "perception",
                ActorMessage::new(
                    MessageType::AnalyzeEmotion,
                    json!({"user_id": "u1", "text": "  "}),
                )
                .with_reply_to("sink"),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let replies = seen.lock().unwrap();
        let neutral = replies
            .iter()
            .rev()
            .find(|m| m.message_type == MessageType::EmotionResult)
            .unwrap();
        assert_eq!(neutral.payload["dominant_emotions"][0], json!("neutral"));

        system.stop(Duration::from_secs(1)).await;
    }
}
