/// Shared error type used across all SerialAgent crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("SerialMemory: {0}")]
    SerialMemory(String),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("attachment validation: {0}")]
    AttachmentValidation(String),

    #[error("confirmation not found: {0}")]
    ConfirmationNotFound(String),

    #[error("confirmation expired: {0}")]
    ConfirmationExpired(String),

    #[error("external service: {0}")]
    ExternalService(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Sanitized message safe to return to an external caller — internal
    /// errors collapse to a generic message so implementation details
    /// (file paths, SQL, provider internals) never leak over the wire.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(m) => m.clone(),
            Error::SessionNotFound(m) => format!("session not found: {m}"),
            Error::AgentNotFound(m) => format!("agent not found: {m}"),
            Error::AttachmentValidation(m) => m.clone(),
            Error::ConfirmationNotFound(m) => format!("confirmation not found: {m}"),
            Error::ConfirmationExpired(m) => format!("confirmation expired: {m}"),
            Error::Auth(_) => "unauthorized".to_string(),
            Error::SkillNotFound(m) => format!("skill not found: {m}"),
            Error::ExternalService(_) => "an external service is unavailable".to_string(),
            _ => "internal error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
