use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no shared secret configured on receiver")]
    NotConfigured,

    #[error("one or more signing headers missing")]
    MissingHeaders,

    #[error("timestamp header is not an integer")]
    InvalidTimestamp,

    #[error("timestamp too far in the future")]
    SkewFuture,

    #[error("timestamp too far in the past")]
    SkewPast,

    #[error("nonce already seen")]
    Replay,

    #[error("signature does not match any valid key")]
    InvalidSignature,
}

impl AuthError {
    /// Stable error code carried in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::NotConfigured => "hmac_not_configured",
            AuthError::MissingHeaders => "hmac_missing_headers",
            AuthError::InvalidTimestamp => "hmac_invalid_timestamp",
            AuthError::SkewFuture => "timestamp_skew_future",
            AuthError::SkewPast => "timestamp_skew_past",
            AuthError::Replay => "replay_detected",
            AuthError::InvalidSignature => "hmac_invalid_signature",
        }
    }

    /// 503 when the receiver is unconfigured (fail closed), 401 otherwise.
    pub fn http_status(&self) -> u16 {
        match self {
            AuthError::NotConfigured => 503,
            _ => 401,
        }
    }
}
