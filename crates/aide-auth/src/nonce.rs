use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::error::AuthError;

/// Time-bounded set of recently seen signing nonces.
///
/// Entries live for the retention window (which must exceed twice the
/// timestamp tolerance, so a replayed request can never outlive its nonce).
/// The store is in-memory: nonces are lost on restart, which is acceptable
/// because the timestamp window bounds the exposure.
pub struct NonceStore {
    inner: Mutex<Inner>,
    retention_ms: i64,
    max_size: usize,
}

struct Inner {
    nonces: HashMap<String, i64>,
    last_cleanup_ms: i64,
}

impl NonceStore {
    pub fn new(retention_ms: i64, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nonces: HashMap::new(),
                last_cleanup_ms: 0,
            }),
            retention_ms,
            max_size,
        }
    }

    /// Record a nonce, rejecting it when already present.
    pub fn check_and_store(&self, nonce: &str, now_ms: i64) -> Result<(), AuthError> {
        let mut inner = self.inner.lock().unwrap();

        // Opportunistic cleanup at most once a minute.
        if now_ms - inner.last_cleanup_ms > 60_000 {
            inner.nonces.retain(|_, expires| *expires >= now_ms);
            inner.last_cleanup_ms = now_ms;
        }

        if inner.nonces.contains_key(nonce) {
            warn!(nonce = %&nonce[..nonce.len().min(8)], "replay detected");
            return Err(AuthError::Replay);
        }

        if inner.nonces.len() >= self.max_size {
            // Drop the soonest-to-expire entries to stay bounded.
            let mut by_expiry: Vec<(String, i64)> = inner
                .nonces
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            by_expiry.sort_by_key(|(_, exp)| *exp);
            for (k, _) in by_expiry.iter().take(inner.nonces.len() / 2) {
                inner.nonces.remove(k);
            }
        }

        inner.nonces.insert(nonce.to_string(), now_ms + self.retention_ms);
        Ok(())
    }

    /// Drop expired entries. Called from the scheduler.
    pub fn cleanup(&self, now_ms: i64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.nonces.len();
        inner.nonces.retain(|_, expires| *expires >= now_ms);
        inner.last_cleanup_ms = now_ms;
        before - inner.nonces.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().nonces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_accepted_second_rejected() {
        let store = NonceStore::new(900_000, 100);
        assert!(store.check_and_store("abc", 1000).is_ok());
        assert_eq!(store.check_and_store("abc", 2000), Err(AuthError::Replay));
    }

    #[test]
    fn expired_nonces_are_cleaned_up() {
        let store = NonceStore::new(900_000, 100);
        store.check_and_store("abc", 0).unwrap();
        assert_eq!(store.len(), 1);
        let removed = store.cleanup(900_001);
        assert_eq!(removed, 1);
        assert!(store.is_empty());
        // Beyond retention the nonce may be reused.
        assert!(store.check_and_store("abc", 900_002).is_ok());
    }

    #[test]
    fn store_stays_bounded() {
        let store = NonceStore::new(900_000, 10);
        for i in 0..50 {
            store.check_and_store(&format!("n{i}"), i).unwrap();
        }
        assert!(store.len() <= 11);
    }
}
