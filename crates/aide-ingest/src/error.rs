use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("file is not valid UTF-8")]
    NotUtf8,

    #[error("store error: {0}")]
    Store(#[from] aide_memory::MemoryError),
}

pub type Result<T> = std::result::Result<T, IngestError>;
