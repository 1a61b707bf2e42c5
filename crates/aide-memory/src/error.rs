use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("encrypted database required but encryption is unavailable: {0}")]
    EncryptionRequired(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid value: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
