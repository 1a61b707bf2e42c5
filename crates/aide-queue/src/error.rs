use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue_timeout")]
    Timeout,

    #[error("queue shut down")]
    Shutdown,

    #[error("{0}")]
    Handler(String),
}
