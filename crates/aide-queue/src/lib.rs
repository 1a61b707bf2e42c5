//! Serialization primitives for the send path: the owner-first LLM request
//! queue, the outbound rate limiter, and the per-conversation send cooldown.

pub mod cooldown;
pub mod error;
pub mod limiter;
pub mod queue;

pub use cooldown::SendCooldown;
pub use error::QueueError;
pub use limiter::OutboundLimiter;
pub use queue::{QueuePriority, RequestQueue};
