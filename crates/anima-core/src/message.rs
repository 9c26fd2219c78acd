use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Closed enumeration of every message tag on the actor bus.
///
/// The wire form is the snake_case string; adding a variant is a protocol
/// change and must be coordinated with every handler that matches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Control
    Ping,
    Pong,
    Error,
    Shutdown,
    DlqQueued,
    DlqProcessed,
    DlqCleanup,

    // User turn lifecycle
    UserMessage,
    ProcessUserMessage,
    GenerateResponse,
    BotResponse,
    StreamingChunk,
    SessionCreated,
    SessionUpdated,

    // Generation diagnostics
    CacheHitMetric,
    PromptInclusion,
    JsonModeFailure,
    JsonValidationFailed,
    StructuredResponseGenerated,
    ModeDetected,
    ModeFallback,
    GenerationParametersUsed,
    PatternDebug,

    // Short-term memory
    StoreMemory,
    GetContext,
    ContextResponse,
    ClearUserMemory,

    // Emotion analysis
    AnalyzeEmotion,
    EmotionResult,

    // Rate limiting
    CheckLimit,
    LimitResponse,
    LimitExceeded,

    // Long-term memory
    SaveToLtm,
    GetLtmMemory,
    DeleteLtmMemory,
    LtmResponse,
    EvaluateForLtm,
    GenerateEmbedding,
    EmbeddingResponse,

    // System maintenance
    CollectSystemMetrics,
    InitiateArchival,
    CheckStorageAlerts,
    SystemMetricsResponse,

    // Partner persona
    GetPartnerModel,
    PartnerModelResponse,
    UpdatePartnerModel,

    // Personality
    UpdatePersonalityContext,
    GetPersonalityProfile,
    PersonalityProfileResponse,
    CleanupInactiveResonance,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reuse the serde rename so logs match the wire form.
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}

/// Envelope for every message routed between actors.
///
/// Payloads are schemaless JSON maps; handlers extract the typed shape they
/// expect with [`ActorMessage::payload_as`]. Value copies only: an envelope
/// never carries references into another actor's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorMessage {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Actor id a response should be routed to, when different from the
    /// sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl ActorMessage {
    pub fn new(message_type: MessageType, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender_id: None,
            message_type,
            payload,
            timestamp: Utc::now(),
            reply_to: None,
        }
    }

    /// Control message with an empty payload.
    pub fn control(message_type: MessageType) -> Self {
        Self::new(message_type, Value::Null)
    }

    pub fn from_sender(sender_id: &str, message_type: MessageType, payload: Value) -> Self {
        let mut msg = Self::new(message_type, payload);
        msg.sender_id = Some(sender_id.to_string());
        msg
    }

    pub fn with_reply_to(mut self, actor_id: &str) -> Self {
        self.reply_to = Some(actor_id.to_string());
        self
    }

    /// Where a response to this message should go: explicit `reply_to`
    /// first, sender as the fallback.
    pub fn reply_target(&self) -> Option<&str> {
        self.reply_to.as_deref().or(self.sender_id.as_deref())
    }

    /// Deserialize the payload into the shape the handler expects.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct StorePayload {
        user_id: String,
        content: String,
    }

    #[test]
    fn message_type_uses_snake_case_wire_form() {
        let json = serde_json::to_string(&MessageType::GetPartnerModel).unwrap();
        assert_eq!(json, r#""get_partner_model""#);
        let back: MessageType = serde_json::from_str(r#""evaluate_for_ltm""#).unwrap();
        assert_eq!(back, MessageType::EvaluateForLtm);
    }

    #[test]
    fn reply_target_prefers_reply_to() {
        let msg = ActorMessage::from_sender("session", MessageType::GetContext, json!({}))
            .with_reply_to("generation");
        assert_eq!(msg.reply_target(), Some("generation"));

        let msg = ActorMessage::from_sender("session", MessageType::GetContext, json!({}));
        assert_eq!(msg.reply_target(), Some("session"));
    }

    #[test]
    fn typed_payload_extraction() {
        let msg = ActorMessage::new(
            MessageType::StoreMemory,
            json!({"user_id": "u1", "content": "hi"}),
        );
        let payload: StorePayload = msg.payload_as().unwrap();
        assert_eq!(
            payload,
            StorePayload {
                user_id: "u1".into(),
                content: "hi".into()
            }
        );
    }
}
