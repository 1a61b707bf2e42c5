//! Document ingestion for the knowledge index.
//!
//! Files land in `<root>/input/<scope>/` (dropped by the operator or
//! written from transport attachments) and each pass chunks, titles, and
//! indexes them under their scope, then marks them done.

pub mod chunk;
pub mod error;
pub mod pipeline;

pub use chunk::{chunk_text, extract_title};
pub use error::IngestError;
pub use pipeline::{process_pending, write_attachment, IngestSettings};
