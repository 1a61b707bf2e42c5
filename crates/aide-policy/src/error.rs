use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("policy is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid policy value: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, PolicyError>;
