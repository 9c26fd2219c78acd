//! Interfaces to the external collaborators the core coordinates but does
//! not implement: the LLM, the embedding service, the emotion classifier,
//! and the TTL key-value cache. Hosts embed the workspace and supply these.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::emotion::EmotionVector;
use crate::error::{CoreError, Result};

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Sampling parameters for one completion. Fixed per generation mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub params: SamplingParams,
    pub stream: bool,
    /// When set, the provider is asked for a JSON-object response.
    pub response_format_json: bool,
}

/// Streamed completion chunk.
#[derive(Debug, Clone)]
pub enum CompletionChunk {
    Content { text: String },
    Done { usage: Usage },
}

/// Final usage counters, including optional prompt cache accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cache_hit_tokens: Option<u32>,
    pub cache_miss_tokens: Option<u32>,
}

/// Chat-completion collaborator. Streaming is the primary path; chunks are
/// pushed through the channel and the final `Done` carries usage counters.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        req: &CompletionRequest,
        tx: mpsc::Sender<CompletionChunk>,
    ) -> Result<()>;
}

/// Text → fixed-dimensional float vector. Failures fall back to the
/// recent-memories search path upstream.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Synchronous CPU-bound emotion classifier. The perception actor runs it
/// on the blocking pool with a timeout; implementations must not block on
/// I/O.
pub trait EmotionClassifier: Send + Sync {
    /// Full 28-dim score vector plus ranked dominant labels.
    fn classify(&self, text: &str) -> Result<(EmotionVector, Vec<String>)>;
}

/// TTL key-value cache. Keys are namespaced with the `anima:` prefix by
/// callers. The default in-process implementation below is single-node;
/// hosts may supply a distributed one.
#[async_trait]
pub trait TtlCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl_secs: u64);
    async fn delete(&self, key: &str);
}

/// In-process TTL cache: entries expire lazily on read, the oldest entry is
/// evicted when the table is full.
pub struct InMemoryTtlCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    capacity: usize,
}

struct CacheEntry {
    value: String,
    stored_at: DateTime<Utc>,
    ttl_secs: u64,
}

impl InMemoryTtlCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }
}

#[async_trait]
impl TtlCache for InMemoryTtlCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        let expired = match entries.get(key) {
            Some(entry) => {
                Utc::now() - entry.stored_at >= Duration::seconds(entry.ttl_secs as i64)
            }
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                entries.remove(&k);
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Utc::now(),
                ttl_secs,
            },
        );
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

/// Run a synchronous classifier on the blocking pool with a deadline.
pub async fn classify_with_timeout<C: EmotionClassifier + 'static>(
    classifier: std::sync::Arc<C>,
    text: String,
    timeout: std::time::Duration,
) -> Result<(EmotionVector, Vec<String>)> {
    let handle = tokio::task::spawn_blocking(move || classifier.classify(&text));
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(CoreError::Internal(format!(
            "emotion classifier panicked: {}",
            join_err
        ))),
        Err(_) => Err(CoreError::Timeout {
            ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    struct SlowClassifier;

    impl EmotionClassifier for SlowClassifier {
        fn classify(&self, _text: &str) -> Result<(EmotionVector, Vec<String>)> {
            std::thread::sleep(StdDuration::from_millis(200));
            Ok((EmotionVector::neutral(), vec!["neutral".into()]))
        }
    }

    #[tokio::test]
    async fn ttl_cache_expires_entries() {
        let cache = InMemoryTtlCache::new(4);
        cache.set("anima:k", "v".into(), 0).await;
        assert_eq!(cache.get("anima:k").await, None);

        cache.set("anima:k", "v".into(), 60).await;
        assert_eq!(cache.get("anima:k").await, Some("v".into()));
        cache.delete("anima:k").await;
        assert_eq!(cache.get("anima:k").await, None);
    }

    #[tokio::test]
    async fn ttl_cache_evicts_oldest_when_full() {
        let cache = InMemoryTtlCache::new(2);
        cache.set("a", "1".into(), 60).await;
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        cache.set("b", "2".into(), 60).await;
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        cache.set("c", "3".into(), 60).await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("c").await, Some("3".into()));
    }

    #[tokio::test]
    async fn classifier_timeout_is_reported() {
        let result = classify_with_timeout(
            Arc::new(SlowClassifier),
            "hello".into(),
            StdDuration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
    }
}
