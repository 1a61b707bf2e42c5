use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 over `nonce || decimal timestamp || raw body`.
pub fn compute_signature(nonce: &str, timestamp_ms: i64, body: &[u8], secret: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(nonce.as_bytes());
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time signature check via `Mac::verify_slice`.
pub fn verify_signature(
    nonce: &str,
    timestamp_ms: i64,
    body: &[u8],
    signature_hex: &str,
    secret: &[u8],
) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(nonce.as_bytes());
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Fresh signing headers for an outbound request body.
/// Returns (nonce, timestamp, signature) matching the X-* header triple.
pub fn signed_headers(body: &[u8], secret: &[u8], now_ms: i64) -> (String, String, String) {
    let nonce = uuid::Uuid::new_v4().to_string();
    let signature = compute_signature(&nonce, now_ms, body, secret);
    (nonce, now_ms.to_string(), signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let a = compute_signature("nonce", 12345, b"body", b"secret");
        let b = compute_signature("nonce", 12345, b"body", b"secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn any_component_changes_signature() {
        let base = compute_signature("nonce", 12345, b"body", b"secret");
        assert_ne!(base, compute_signature("nonc2", 12345, b"body", b"secret"));
        assert_ne!(base, compute_signature("nonce", 12346, b"body", b"secret"));
        assert_ne!(base, compute_signature("nonce", 12345, b"bodz", b"secret"));
        assert_ne!(base, compute_signature("nonce", 12345, b"body", b"secre2"));
    }

    #[test]
    fn verify_accepts_own_signature() {
        let sig = compute_signature("n", 1, b"b", b"k");
        assert!(verify_signature("n", 1, b"b", &sig, b"k"));
        assert!(!verify_signature("n", 1, b"b", &sig, b"other"));
        assert!(!verify_signature("n", 1, b"b", "zz-not-hex", b"k"));
    }

    #[test]
    fn headers_round_trip() {
        let (nonce, ts, sig) = signed_headers(b"payload", b"k", 1_700_000_000_000);
        let ts: i64 = ts.parse().unwrap();
        assert!(verify_signature(&nonce, ts, b"payload", &sig, b"k"));
    }
}
