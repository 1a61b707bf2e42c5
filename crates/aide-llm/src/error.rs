use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("timeout")]
    Timeout,

    #[error("http_error: {status}")]
    Api { status: u16, message: String },

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM response parse error: {0}")]
    Parse(String),
}

impl LlmError {
    /// Short code matching the operational error taxonomy.
    pub fn code(&self) -> String {
        match self {
            LlmError::Timeout => "timeout".to_string(),
            LlmError::Api { status, .. } => format!("http_error: {status}"),
            LlmError::Transport(_) => "transport_error".to_string(),
            LlmError::Parse(_) => "parse_error".to_string(),
        }
    }
}
