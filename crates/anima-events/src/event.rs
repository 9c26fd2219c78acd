use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One immutable record in the event log.
///
/// Fields are private on purpose: an event is never edited after creation.
/// Version stamping and correlation happen through the builder methods,
/// which return a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: String,
    stream_id: String,
    event_type: String,
    payload: Value,
    timestamp: DateTime<Utc>,
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

impl Event {
    pub fn new(stream_id: &str, event_type: &str, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            stream_id: stream_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
            version: 0,
            correlation_id: None,
        }
    }

    /// Stamp the expected per-stream version (0-based, gap-free).
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Attach a cross-stream trace id.
    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Reconstruct a persisted row. Storage backends only.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        event_id: String,
        stream_id: String,
        event_type: String,
        payload: Value,
        timestamp: DateTime<Utc>,
        version: u32,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            event_id,
            stream_id,
            event_type,
            payload,
            timestamp,
            version,
            correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_stamps_version_and_correlation() {
        let event = Event::new("user_u1", "SessionCreatedEvent", json!({"user_id": "u1"}))
            .with_version(3)
            .with_correlation("req-9");
        assert_eq!(event.version(), 3);
        assert_eq!(event.correlation_id(), Some("req-9"));
        assert_eq!(event.stream_id(), "user_u1");
    }

    #[test]
    fn serde_round_trip() {
        let event = Event::new("ltm_u1", "NoveltyCalculatedEvent", json!({"score": 0.8}));
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
