pub mod client;
pub mod error;

pub use client::{ChatMessage, ChatRole, LlmResponse, OllamaClient, TextGenerator};
pub use error::LlmError;
