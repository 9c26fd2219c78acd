use chrono::{DateTime, Utc};
use serde_json::Value;

use anima_core::config::{LimitsConfig, LtmConfig};
use anima_core::types::GenerationMode;

/// What the readiness check decided for one in-flight turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Keep waiting.
    NotReady,
    /// The embedding reply is overdue: fall back to recent-memory search.
    EmbeddingOverdue,
    /// All mandatory parts present (or timed out on their skip branches).
    Ready,
}

/// Fan-out state for one user turn, keyed by request id.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub user_id: String,
    pub chat_id: i64,
    pub text: String,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,

    pub stm_received: bool,
    pub stm_context: Vec<Value>,

    pub expecting_ltm: bool,
    pub ltm_received: bool,
    pub ltm_memories: Vec<Value>,
    pub ltm_requested_at: Option<DateTime<Utc>>,

    pub expecting_embedding: bool,
    pub embedding_received: bool,
    pub query_vector: Option<Vec<f32>>,

    pub partner_requested: bool,
    pub partner_received: bool,
    pub partner_mode: Option<GenerationMode>,
    pub partner_confidence: f64,

    pub personality_requested: bool,
    pub personality_received: bool,
    pub personality_profile: Option<Value>,
}

impl PendingRequest {
    pub fn new(request_id: &str, user_id: &str, chat_id: i64, text: &str, username: Option<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            user_id: user_id.to_string(),
            chat_id,
            text: text.to_string(),
            username,
            created_at: Utc::now(),
            stm_received: false,
            stm_context: Vec::new(),
            expecting_ltm: false,
            ltm_received: false,
            ltm_memories: Vec::new(),
            ltm_requested_at: None,
            expecting_embedding: false,
            embedding_received: false,
            query_vector: None,
            partner_requested: false,
            partner_received: false,
            partner_mode: None,
            partner_confidence: 0.0,
            personality_requested: false,
            personality_received: false,
            personality_profile: None,
        }
    }

    /// Mark the embedding branch resolved without a vector: the memory
    /// search proceeds in `recent` mode.
    pub fn resolve_embedding_empty(&mut self) {
        self.embedding_received = true;
        self.query_vector = None;
    }

    /// Readiness per the fan-out contract.
    ///
    /// Ready when STM arrived, personality arrived or timed out, partner
    /// model arrived or timed out, and the LTM branch either delivered,
    /// was never requested, or timed out. A pending embedding blocks until
    /// its own deadline, after which the caller must fall back to the
    /// recent search.
    pub fn readiness(
        &self,
        now: DateTime<Utc>,
        ltm: &LtmConfig,
        limits: &LimitsConfig,
    ) -> Readiness {
        let elapsed = |since: DateTime<Utc>| (now - since).num_milliseconds() as f64 / 1000.0;

        if self.expecting_embedding && !self.embedding_received {
            let reference = self.ltm_requested_at.unwrap_or(self.created_at);
            if elapsed(reference) > ltm.embedding_request_timeout_secs {
                return Readiness::EmbeddingOverdue;
            }
            return Readiness::NotReady;
        }

        let ltm_timed_out = self.expecting_ltm
            && !self.ltm_received
            && self
                .ltm_requested_at
                .map(|at| elapsed(at) > ltm.request_timeout_secs)
                .unwrap_or(false);

        let partner_ready = self.partner_received
            || !self.partner_requested
            || elapsed(self.created_at) > limits.partner_timeout_secs;

        let personality_ready = self.personality_received
            || !self.personality_requested
            || elapsed(self.created_at) > limits.personality_timeout_secs;

        let ltm_ready = self.ltm_received || !self.expecting_ltm || ltm_timed_out;

        if self.stm_received && partner_ready && personality_ready && ltm_ready {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created_at).num_seconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending() -> PendingRequest {
        PendingRequest::new("req-1", "u1", 7, "hello", None)
    }

    fn configs() -> (LtmConfig, LimitsConfig) {
        (LtmConfig::default(), LimitsConfig::default())
    }

    #[test]
    fn stm_alone_is_ready_when_nothing_else_was_asked() {
        let (ltm, limits) = configs();
        let mut p = pending();
        assert_eq!(p.readiness(Utc::now(), &ltm, &limits), Readiness::NotReady);
        p.stm_received = true;
        assert_eq!(p.readiness(Utc::now(), &ltm, &limits), Readiness::Ready);
    }

    #[test]
    fn pending_embedding_blocks_until_deadline() {
        let (ltm, limits) = configs();
        let mut p = pending();
        p.stm_received = true;
        p.expecting_embedding = true;
        p.expecting_ltm = true;
        p.ltm_requested_at = Some(Utc::now());
        assert_eq!(p.readiness(Utc::now(), &ltm, &limits), Readiness::NotReady);

        let later = Utc::now() + Duration::seconds(ltm.embedding_request_timeout_secs as i64 + 1);
        assert_eq!(p.readiness(later, &ltm, &limits), Readiness::EmbeddingOverdue);
    }

    #[test]
    fn ltm_timeout_downgrades_to_skip_branch() {
        let (ltm, limits) = configs();
        let mut p = pending();
        p.stm_received = true;
        p.expecting_ltm = true;
        p.expecting_embedding = true;
        p.embedding_received = true;
        p.ltm_requested_at = Some(Utc::now());
        assert_eq!(p.readiness(Utc::now(), &ltm, &limits), Readiness::NotReady);

        let later = Utc::now() + Duration::seconds(ltm.request_timeout_secs as i64 + 1);
        assert_eq!(p.readiness(later, &ltm, &limits), Readiness::Ready);
    }

    #[test]
    fn optional_dependencies_time_out_independently() {
        let (ltm, limits) = configs();
        let mut p = pending();
        p.stm_received = true;
        p.partner_requested = true;
        p.personality_requested = true;
        assert_eq!(p.readiness(Utc::now(), &ltm, &limits), Readiness::NotReady);

        p.personality_received = true;
        assert_eq!(p.readiness(Utc::now(), &ltm, &limits), Readiness::NotReady);

        let later = Utc::now() + Duration::seconds(limits.partner_timeout_secs as i64 + 1);
        assert_eq!(p.readiness(later, &ltm, &limits), Readiness::Ready);
    }
}
