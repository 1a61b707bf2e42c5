//! Persistent memory for the assistant: per-conversation message log,
//! long-term facts, rolling summaries, and the scoped knowledge index,
//! all in one SQLite file with FTS5 search, plus the count-based
//! consolidation engine that turns old messages into facts and summaries.

pub mod consolidation;
pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::MemoryError;
pub use store::MemoryStore;
