//! Request authentication for the mesh ↔ assistant link.
//!
//! Every non-health request between the two processes carries three headers:
//! a fresh UUIDv4 nonce, an epoch-millisecond timestamp, and an HMAC-SHA256
//! hex digest over `nonce || timestamp || body` keyed by the shared secret.
//! Verification is fail-closed and ordered so that each failure maps to a
//! stable error code.

pub mod canonical;
pub mod error;
pub mod nonce;
pub mod secrets;
pub mod sign;

pub use error::AuthError;
pub use nonce::NonceStore;
pub use secrets::SecretState;

use aide_core::config::DEFAULT_TIMESTAMP_TOLERANCE_MS;

/// Verify a signed request. Steps, in order:
///
/// 1. fail closed when no secret is configured
/// 2. all three headers present
/// 3. timestamp parses as an integer
/// 4. |now - ts| within tolerance
/// 5. nonce unseen (and recorded)
/// 6. signature matches current secret, or the grace-period old secret
pub fn verify_request(
    nonce: Option<&str>,
    timestamp: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    secrets: &SecretState,
    nonces: &NonceStore,
    tolerance_ms: i64,
    now_ms: i64,
) -> Result<(), AuthError> {
    let candidates = secrets.verification_secrets(now_ms);
    if candidates.is_empty() {
        return Err(AuthError::NotConfigured);
    }

    let (nonce, timestamp, signature) = match (nonce, timestamp, signature) {
        (Some(n), Some(t), Some(s)) if !n.is_empty() && !t.is_empty() && !s.is_empty() => {
            (n, t, s)
        }
        _ => return Err(AuthError::MissingHeaders),
    };

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| AuthError::InvalidTimestamp)?;

    let tolerance = if tolerance_ms > 0 {
        tolerance_ms
    } else {
        DEFAULT_TIMESTAMP_TOLERANCE_MS
    };
    if (ts - now_ms).abs() > tolerance {
        return if ts > now_ms {
            Err(AuthError::SkewFuture)
        } else {
            Err(AuthError::SkewPast)
        };
    }

    nonces.check_and_store(nonce, now_ms)?;

    for secret in &candidates {
        if sign::verify_signature(nonce, ts, body, signature, secret) {
            return Ok(());
        }
    }
    Err(AuthError::InvalidSignature)
}
