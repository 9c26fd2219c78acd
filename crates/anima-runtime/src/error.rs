use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Actor {actor_id} already registered")]
    AlreadyRegistered { actor_id: String },

    #[error("Actor {actor_id} not found")]
    ActorNotFound { actor_id: String },

    /// Transient: the recipient's mailbox is full. Retried by `send`, then
    /// quarantined to the DLQ.
    #[error("Mailbox full for actor {actor_id}")]
    QueueFull { actor_id: String },

    /// The recipient's circuit breaker is open; the call was rejected
    /// without an enqueue attempt.
    #[error("Circuit breaker open for actor {actor_id}")]
    BreakerOpen { actor_id: String },

    /// The recipient's mailbox was closed (actor stopped).
    #[error("Mailbox closed for actor {actor_id}")]
    MailboxClosed { actor_id: String },

    #[error("Actor {actor_id} failed to initialize: {reason}")]
    InitFailed { actor_id: String, reason: String },

    #[error("Handler error: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
