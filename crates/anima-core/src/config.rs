use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (anima.toml + ANIMA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnimaConfig {
    #[serde(default)]
    pub actor: ActorConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub event_store: EventStoreConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub stm: StmConfig,
    #[serde(default)]
    pub ltm: LtmConfig,
    #[serde(default)]
    pub personality: PersonalityConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl AnimaConfig {
    /// Load config from a TOML file with ANIMA_* env var overrides.
    /// Missing file means defaults only; env still applies.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("anima.toml");
        let config: AnimaConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("ANIMA_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;
        Ok(config)
    }
}

/// Mailbox and message loop settings shared by every actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Bounded mailbox capacity; a full mailbox is the backpressure signal.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Periodic wake of the message loop, seconds.
    #[serde(default = "default_message_timeout_secs")]
    pub message_timeout_secs: f64,
    /// Per-actor drain budget during shutdown, seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: f64,
    /// Whether `send` retries on a full mailbox.
    #[serde(default = "bool_true")]
    pub retry_enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay, seconds. Doubles each attempt.
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: f64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: f64,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            message_timeout_secs: default_message_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            retry_enabled: true,
            max_retries: default_max_retries(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
        }
    }
}

/// Per-recipient circuit breaker over the queue-full failure class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_max_size")]
    pub max_size: usize,
    /// Janitor period, seconds. Zero disables the janitor.
    #[serde(default = "default_dlq_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "bool_true")]
    pub metrics_enabled: bool,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: default_dlq_max_size(),
            cleanup_interval_secs: default_dlq_cleanup_interval_secs(),
            metrics_enabled: true,
        }
    }
}

/// Which event store backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventStoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreConfig {
    #[serde(default)]
    pub kind: EventStoreKind,
    /// Database path for the durable variant.
    #[serde(default = "default_event_db_path")]
    pub db_path: String,
    /// Buffer size that triggers a flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: f64,
    /// Hard cap on the write buffer; reaching it forces a flush and counts
    /// a buffer-overflow metric.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "default_stream_cache_size")]
    pub stream_cache_size: usize,
    /// Memory-variant event cap; exceeding it evicts whole streams
    /// oldest-first.
    #[serde(default = "default_max_memory_events")]
    pub max_memory_events: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            kind: EventStoreKind::Memory,
            db_path: default_event_db_path(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            max_buffer_size: default_max_buffer_size(),
            stream_cache_size: default_stream_cache_size(),
            max_memory_events: default_max_memory_events(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_archive_days")]
    pub days_threshold: i64,
    #[serde(default = "default_archive_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// Daily wall-clock run time.
    #[serde(default = "default_schedule_hour")]
    pub schedule_hour: u32,
    #[serde(default = "default_schedule_minute")]
    pub schedule_minute: u32,
    #[serde(default = "default_archive_query_timeout_secs")]
    pub query_timeout_secs: f64,
    /// Count but do not modify.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            days_threshold: default_archive_days(),
            batch_size: default_archive_batch_size(),
            compression_level: default_compression_level(),
            schedule_hour: default_schedule_hour(),
            schedule_minute: default_schedule_minute(),
            query_timeout_secs: default_archive_query_timeout_secs(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StmConfig {
    /// Ring buffer capacity per user.
    #[serde(default = "default_stm_buffer_size")]
    pub buffer_size: usize,
    /// Messages longer than this are truncated with a metadata note.
    #[serde(default = "default_stm_message_max_length")]
    pub message_max_length: usize,
    /// "structured" maps message types to LLM roles; "text" returns raw
    /// triples.
    #[serde(default = "default_stm_context_format")]
    pub context_format: String,
    #[serde(default = "default_stm_query_timeout_secs")]
    pub query_timeout_secs: f64,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_stm_buffer_size(),
            message_max_length: default_stm_message_max_length(),
            context_format: default_stm_context_format(),
            query_timeout_secs: default_stm_query_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtmConfig {
    /// Turns accepted for statistics before any saving starts.
    #[serde(default = "default_cold_start_buffer_size")]
    pub cold_start_buffer_size: usize,
    /// Floor of the dynamic save threshold.
    #[serde(default = "default_cold_start_min_threshold")]
    pub cold_start_min_threshold: f64,
    /// Steepness of the profile maturity sigmoid.
    #[serde(default = "default_maturity_sigmoid_rate")]
    pub maturity_sigmoid_rate: f64,
    /// Memories handed to the generation prompt.
    #[serde(default = "default_ltm_context_limit")]
    pub context_limit: usize,
    #[serde(default = "default_ltm_request_timeout_secs")]
    pub request_timeout_secs: f64,
    #[serde(default = "default_embedding_request_timeout_secs")]
    pub embedding_request_timeout_secs: f64,
    /// Rolling novelty window length per user profile.
    #[serde(default = "default_novelty_window")]
    pub novelty_window: usize,
}

impl Default for LtmConfig {
    fn default() -> Self {
        Self {
            cold_start_buffer_size: default_cold_start_buffer_size(),
            cold_start_min_threshold: default_cold_start_min_threshold(),
            maturity_sigmoid_rate: default_maturity_sigmoid_rate(),
            context_limit: default_ltm_context_limit(),
            request_timeout_secs: default_ltm_request_timeout_secs(),
            embedding_request_timeout_secs: default_embedding_request_timeout_secs(),
            novelty_window: default_novelty_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalityConfig {
    /// Days of inactivity before resonance starts drifting to neutral.
    #[serde(default = "default_recovery_days")]
    pub recovery_days: i64,
    /// Per-inactive-day interpolation factor toward the neutral coefficient.
    #[serde(default = "default_recovery_rate")]
    pub recovery_rate: f64,
    /// Interactions between resonance adaptations.
    #[serde(default = "default_adaptation_interval")]
    pub adaptation_interval: u64,
    /// Global budget on `sum(|c - 1|)` across all coefficients.
    #[serde(default = "default_max_deviation")]
    pub max_deviation: f64,
    #[serde(default = "default_noise_level")]
    pub noise_level: f64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Core traits learn slower by this factor.
    #[serde(default = "default_core_learning_factor")]
    pub core_learning_factor: f64,
    #[serde(default = "default_profile_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Style-vector delta needed before the partner persona writes a new
    /// version.
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
    #[serde(default = "default_partner_cache_ttl_secs")]
    pub partner_cache_ttl_secs: u64,
}

impl Default for PersonalityConfig {
    fn default() -> Self {
        Self {
            recovery_days: default_recovery_days(),
            recovery_rate: default_recovery_rate(),
            adaptation_interval: default_adaptation_interval(),
            max_deviation: default_max_deviation(),
            noise_level: default_noise_level(),
            learning_rate: default_learning_rate(),
            core_learning_factor: default_core_learning_factor(),
            cache_ttl_secs: default_profile_cache_ttl_secs(),
            change_threshold: default_change_threshold(),
            partner_cache_ttl_secs: default_partner_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Confidence reported when every tier scores zero.
    #[serde(default = "default_mode_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Raw score divisor producing the [0,1] confidence.
    #[serde(default = "default_score_normalization_factor")]
    pub score_normalization_factor: f64,
    /// Confidence multiplier when the last three modes agree with the
    /// winner.
    #[serde(default = "default_stable_history_multiplier")]
    pub stable_history_multiplier: f64,
    /// Partner recommendation overrides text scoring above this confidence.
    #[serde(default = "default_partner_confidence_threshold")]
    pub partner_confidence_threshold: f64,
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
    #[serde(default = "default_mode_history_size")]
    pub history_size: usize,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_mode_confidence_threshold(),
            score_normalization_factor: default_score_normalization_factor(),
            stable_history_multiplier: default_stable_history_multiplier(),
            partner_confidence_threshold: default_partner_confidence_threshold(),
            min_text_length: default_min_text_length(),
            history_size: default_mode_history_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_daily_message_limit")]
    pub daily_message_limit: u32,
    /// Messages remaining at which the approaching-limit warning fires.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
    /// Stale pending fan-out records older than this are discarded.
    #[serde(default = "default_pending_max_age_secs")]
    pub pending_max_age_secs: u64,
    /// User messages between personality-analysis runs.
    #[serde(default = "default_analysis_interval")]
    pub analysis_interval: u32,
    /// STM history depth fed to the analyzers.
    #[serde(default = "default_analysis_history")]
    pub analysis_history: usize,
    /// Readiness timeout for the partner-model reply.
    #[serde(default = "default_partner_timeout_secs")]
    pub partner_timeout_secs: f64,
    /// Readiness timeout for the personality-profile reply.
    #[serde(default = "default_personality_timeout_secs")]
    pub personality_timeout_secs: f64,
    /// Peak emotion intensity required before a finished turn is sent to
    /// long-term memory for evaluation.
    #[serde(default = "default_ltm_trigger_threshold")]
    pub ltm_trigger_threshold: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            daily_message_limit: default_daily_message_limit(),
            warning_threshold: default_warning_threshold(),
            pending_max_age_secs: default_pending_max_age_secs(),
            analysis_interval: default_analysis_interval(),
            analysis_history: default_analysis_history(),
            partner_timeout_secs: default_partner_timeout_secs(),
            personality_timeout_secs: default_personality_timeout_secs(),
            ltm_trigger_threshold: default_ltm_trigger_threshold(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_queue_size() -> usize {
    100
}
fn default_message_timeout_secs() -> f64 {
    1.0
}
fn default_shutdown_timeout_secs() -> f64 {
    5.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_secs() -> f64 {
    0.1
}
fn default_retry_max_delay_secs() -> f64 {
    2.0
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_secs() -> f64 {
    30.0
}
fn default_dlq_max_size() -> usize {
    1000
}
fn default_dlq_cleanup_interval_secs() -> u64 {
    300
}
fn default_event_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.anima/events.db", home)
}
fn default_batch_size() -> usize {
    50
}
fn default_flush_interval_secs() -> f64 {
    1.0
}
fn default_max_buffer_size() -> usize {
    1000
}
fn default_stream_cache_size() -> usize {
    128
}
fn default_max_memory_events() -> usize {
    100_000
}
fn default_archive_days() -> i64 {
    90
}
fn default_archive_batch_size() -> usize {
    500
}
fn default_compression_level() -> u32 {
    6
}
fn default_schedule_hour() -> u32 {
    3
}
fn default_schedule_minute() -> u32 {
    0
}
fn default_archive_query_timeout_secs() -> f64 {
    60.0
}
fn default_stm_buffer_size() -> usize {
    50
}
fn default_stm_message_max_length() -> usize {
    4000
}
fn default_stm_context_format() -> String {
    "structured".to_string()
}
fn default_stm_query_timeout_secs() -> f64 {
    5.0
}
fn default_cold_start_buffer_size() -> usize {
    30
}
fn default_cold_start_min_threshold() -> f64 {
    0.45
}
fn default_maturity_sigmoid_rate() -> f64 {
    0.1
}
fn default_ltm_context_limit() -> usize {
    5
}
fn default_ltm_request_timeout_secs() -> f64 {
    3.0
}
fn default_embedding_request_timeout_secs() -> f64 {
    2.0
}
fn default_novelty_window() -> usize {
    100
}
fn default_recovery_days() -> i64 {
    14
}
fn default_recovery_rate() -> f64 {
    0.1
}
fn default_adaptation_interval() -> u64 {
    10
}
fn default_max_deviation() -> f64 {
    2.0
}
fn default_noise_level() -> f64 {
    0.01
}
fn default_learning_rate() -> f64 {
    0.05
}
fn default_core_learning_factor() -> f64 {
    0.5
}
fn default_profile_cache_ttl_secs() -> u64 {
    300
}
fn default_change_threshold() -> f64 {
    0.05
}
fn default_partner_cache_ttl_secs() -> u64 {
    600
}
fn default_mode_confidence_threshold() -> f64 {
    0.5
}
fn default_score_normalization_factor() -> f64 {
    10.0
}
fn default_stable_history_multiplier() -> f64 {
    1.2
}
fn default_partner_confidence_threshold() -> f64 {
    0.7
}
fn default_min_text_length() -> usize {
    3
}
fn default_mode_history_size() -> usize {
    10
}
fn default_daily_message_limit() -> u32 {
    100
}
fn default_warning_threshold() -> u32 {
    10
}
fn default_pending_max_age_secs() -> u64 {
    60
}
fn default_analysis_interval() -> u32 {
    10
}
fn default_analysis_history() -> usize {
    50
}
fn default_partner_timeout_secs() -> f64 {
    2.0
}
fn default_personality_timeout_secs() -> f64 {
    2.0
}
fn default_ltm_trigger_threshold() -> f64 {
    0.6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = AnimaConfig::default();
        assert_eq!(cfg.actor.queue_size, 100);
        assert!(cfg.actor.retry_enabled);
        assert_eq!(cfg.event_store.kind, EventStoreKind::Memory);
        assert_eq!(cfg.ltm.cold_start_buffer_size, 30);
        assert!(cfg.personality.change_threshold > 0.0);
    }

    #[test]
    fn figment_load_with_missing_file_uses_defaults() {
        let cfg = AnimaConfig::load(Some("/nonexistent/anima.toml")).unwrap();
        assert_eq!(cfg.stm.buffer_size, 50);
        assert_eq!(cfg.mode.stable_history_multiplier, 1.2);
    }
}
