use std::path::Path;
use std::sync::Mutex;

use rand::RngCore;
use tracing::{info, warn};

/// Shared-secret state: the live signing key plus, during a rotation grace
/// window, the previous key for verification only.
///
/// Readers copy the secrets out under the lock; nothing holds the lock
/// across I/O.
pub struct SecretState {
    inner: Mutex<Inner>,
}

struct Inner {
    current: Option<Vec<u8>>,
    /// Previous secret and its expiry (epoch ms). Dropped silently once past.
    old: Option<(Vec<u8>, i64)>,
}

impl SecretState {
    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: None,
                old: None,
            }),
        }
    }

    pub fn with_secret(secret: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: Some(secret),
                old: None,
            }),
        }
    }

    /// Load the secret from config (hex or raw) or from the secret file.
    /// An absent secret leaves the state empty; verification then fails closed.
    pub fn load(configured: Option<&str>, secret_file: &str) -> Self {
        if let Some(raw) = configured {
            let secret = decode_secret(raw);
            if !secret.is_empty() {
                return Self::with_secret(secret);
            }
        }
        match std::fs::read_to_string(secret_file) {
            Ok(content) => {
                let secret = decode_secret(content.trim());
                if secret.is_empty() {
                    warn!(path = %secret_file, "secret file is empty");
                    Self::empty()
                } else {
                    info!(path = %secret_file, "loaded shared secret from file");
                    Self::with_secret(secret)
                }
            }
            Err(_) => Self::empty(),
        }
    }

    /// Current signing secret, if any.
    pub fn current(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().current.clone()
    }

    /// Secrets valid for verification right now: current first, then the
    /// old key while its grace window is open.
    pub fn verification_secrets(&self, now_ms: i64) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, expires)) = inner.old {
            if now_ms >= expires {
                inner.old = None;
            }
        }
        let mut out = Vec::with_capacity(2);
        if let Some(cur) = &inner.current {
            out.push(cur.clone());
        }
        if let Some((old, _)) = &inner.old {
            out.push(old.clone());
        }
        out
    }

    /// Install a rotated secret. The previous secret stays valid for
    /// verification until `now + grace_ms`; grace 0 drops it immediately.
    pub fn install(&self, new_secret: Vec<u8>, grace_ms: i64, now_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        if grace_ms > 0 {
            if let Some(prev) = inner.current.take() {
                inner.old = Some((prev, now_ms + grace_ms));
            }
        } else {
            inner.old = None;
        }
        inner.current = Some(new_secret);
    }

    /// Persist the current secret hex to disk atomically (temp + rename),
    /// so it survives a restart.
    pub fn persist(&self, secret_file: &str) -> std::io::Result<()> {
        let Some(current) = self.current() else {
            return Ok(());
        };
        let path = Path::new(secret_file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, hex::encode(&current))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        info!(path = %secret_file, "persisted rotated secret");
        Ok(())
    }
}

/// Generate a fresh 32-byte rotation secret.
pub fn generate_secret() -> Vec<u8> {
    let mut buf = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Secrets may arrive as 64-char hex (rotated keys) or as a raw passphrase
/// (operator-provisioned). Hex wins when it decodes cleanly.
fn decode_secret(raw: &str) -> Vec<u8> {
    let raw = raw.trim();
    if raw.len() == 64 {
        if let Ok(bytes) = hex::decode(raw) {
            return bytes;
        }
    }
    raw.as_bytes().to_vec()
}
