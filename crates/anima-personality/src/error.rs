use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersonalityError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown trait: {0}")]
    UnknownTrait(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

pub type Result<T> = std::result::Result<T, PersonalityError>;
