use thiserror::Error;

#[derive(Debug, Error)]
pub enum AideError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Policy rejected message: {reason}")]
    PolicyRejected { reason: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM backend error: {0}")]
    Llm(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Mesh unreachable: {0}")]
    MeshUnreachable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AideError {
    /// Short error code string carried in HTTP error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            AideError::Config(_) => "config_error",
            AideError::AuthFailed(_) => "auth_failed",
            AideError::PolicyRejected { .. } => "policy_rejected",
            AideError::Database(_) => "database_error",
            AideError::Llm(_) => "llm_error",
            AideError::Queue(_) => "queue_error",
            AideError::Transport(_) => "transport_error",
            AideError::MeshUnreachable(_) => "mesh_unreachable",
            AideError::Serialization(_) => "serialization_error",
            AideError::Io(_) => "io_error",
            AideError::Internal(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, AideError>;
