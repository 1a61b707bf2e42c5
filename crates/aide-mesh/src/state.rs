//! Mesh-side config state: the in-memory policy copy, its hash, and the
//! shared-secret state.
//!
//! The assistant is authoritative; the mesh only replaces what it is
//! pushed. The whole policy swaps atomically on each accepted push, and a
//! push may carry a key rotation that takes effect before the response
//! goes out.

use std::sync::RwLock;

use serde_json::Value;
use tracing::{info, warn};

use aide_auth::canonical::config_hash;
use aide_auth::SecretState;
use aide_core::types::now_ms;
use aide_policy::{InboundLimiter, PolicyConfig};

pub struct ConfigState {
    secret_file: String,
    pub secrets: SecretState,
    inner: RwLock<Inner>,
    /// Rebuilt whenever a push changes the inbound caps.
    limiter: RwLock<InboundLimiter>,
}

struct Inner {
    policy: Option<PolicyConfig>,
    hash: String,
    applied_at_ms: i64,
}

impl ConfigState {
    pub fn new(secrets: SecretState, secret_file: &str) -> Self {
        let defaults = PolicyConfig::default();
        Self {
            secret_file: secret_file.to_string(),
            secrets,
            limiter: RwLock::new(InboundLimiter::new(
                defaults.rate_limits.inbound.max_per_hour,
                defaults.rate_limits.inbound.max_per_minute,
            )),
            inner: RwLock::new(Inner {
                policy: None,
                hash: String::new(),
                applied_at_ms: 0,
            }),
        }
    }

    /// Current policy; None until the first push lands.
    pub fn policy(&self) -> Option<PolicyConfig> {
        self.inner.read().unwrap().policy.clone()
    }

    /// Hash of the last accepted push; empty on a fresh mesh.
    pub fn hash(&self) -> String {
        self.inner.read().unwrap().hash.clone()
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.inner
            .read()
            .unwrap()
            .policy
            .as_ref()
            .is_some_and(|p| p.security.kill_switch)
    }

    /// Run the per-sender inbound limiter.
    pub fn check_rate(&self, sender: &str, now_ms: i64) -> aide_policy::limiter::LimitResult {
        self.limiter.read().unwrap().check_and_add(sender, now_ms)
    }

    pub fn with_limiter<R>(&self, f: impl FnOnce(&InboundLimiter) -> R) -> R {
        f(&self.limiter.read().unwrap())
    }

    /// Apply a config push. The hash is computed over the canonical form of
    /// the body with `timestamp_ms` and `hmac_rotation` stripped; a carried
    /// rotation installs the new secret (old key valid through its grace
    /// window) and persists it for restart recovery.
    pub fn apply_push(&self, body: &[u8]) -> Result<String, String> {
        let mut value: Value =
            serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {e}"))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| "config must be a JSON object".to_string())?;

        obj.remove("timestamp_ms");
        let rotation = obj.remove("hmac_rotation");

        let hash = config_hash(&value);
        let policy: PolicyConfig = serde_json::from_value(value)
            .map_err(|e| format!("config does not match policy shape: {e}"))?;

        if let Some(rotation) = rotation {
            self.apply_rotation(&rotation)?;
        }

        let caps = (
            policy.rate_limits.inbound.max_per_hour,
            policy.rate_limits.inbound.max_per_minute,
        );
        {
            let mut inner = self.inner.write().unwrap();
            let caps_changed = inner
                .policy
                .as_ref()
                .map(|old| {
                    (
                        old.rate_limits.inbound.max_per_hour,
                        old.rate_limits.inbound.max_per_minute,
                    ) != caps
                })
                .unwrap_or(true);
            if caps_changed {
                *self.limiter.write().unwrap() = InboundLimiter::new(caps.0, caps.1);
            }
            inner.policy = Some(policy);
            inner.hash = hash.clone();
            inner.applied_at_ms = now_ms();
        }

        info!(hash = %hash[..16.min(hash.len())], "policy applied");
        Ok(hash)
    }

    fn apply_rotation(&self, rotation: &Value) -> Result<(), String> {
        let new_secret_hex = rotation["new_secret"]
            .as_str()
            .ok_or_else(|| "rotation missing new_secret".to_string())?;
        let new_secret =
            hex::decode(new_secret_hex).map_err(|_| "new_secret is not hex".to_string())?;
        let grace_ms = rotation["grace_period_ms"].as_i64().unwrap_or(0);

        self.secrets.install(new_secret, grace_ms, now_ms());
        if let Err(e) = self.secrets.persist(&self.secret_file) {
            warn!(error = %e, "rotated secret not persisted, restart will lose it");
        }
        info!(grace_ms, "HMAC rotation applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> ConfigState {
        ConfigState::new(
            SecretState::with_secret(b"initial-secret".to_vec()),
            "/nonexistent/hmac.key",
        )
    }

    fn push_body(extra: Value) -> Vec<u8> {
        let mut body = json!({
            "version": 1,
            "mode": "companion",
            "dm_group_knowledge": false,
            "identity": {"bot_name": "Aide", "allowed_senders": ["+1"], "groups": {}},
            "rate_limits": {"inbound": {"max_per_hour": 120, "max_per_minute": 20}},
            "validation": {"max_text_length": 1500, "max_timestamp_skew_ms": 300000},
            "security": {"privacy_mode": true, "kill_switch": false},
            "timestamp_ms": 1_700_000_000_000i64,
        });
        if let Value::Object(extra) = extra {
            body.as_object_mut().unwrap().extend(extra);
        }
        serde_json::to_vec(&body).unwrap()
    }

    #[test]
    fn fresh_state_reports_empty_hash() {
        let state = state();
        assert_eq!(state.hash(), "");
        assert!(state.policy().is_none());
    }

    #[test]
    fn push_replaces_policy_and_hash() {
        let state = state();
        let hash = state.apply_push(&push_body(json!({}))).unwrap();
        assert_eq!(hash.len(), 64);
        let policy = state.policy().unwrap();
        assert_eq!(policy.identity.allowed_senders, vec!["+1"]);
        assert_eq!(state.hash(), hash);
    }

    #[test]
    fn hash_ignores_timestamp_and_rotation_fields() {
        let state = state();
        let plain = state.apply_push(&push_body(json!({}))).unwrap();
        let with_rotation = state
            .apply_push(&push_body(json!({
                "hmac_rotation": {
                    "new_secret": "ab".repeat(32),
                    "effective_at_ms": 1i64,
                    "grace_period_ms": 60_000i64,
                }
            })))
            .unwrap();
        assert_eq!(plain, with_rotation);
    }

    #[test]
    fn rotation_installs_new_secret_with_grace() {
        let state = state();
        state
            .apply_push(&push_body(json!({
                "hmac_rotation": {
                    "new_secret": "cd".repeat(32),
                    "effective_at_ms": 1i64,
                    "grace_period_ms": 60_000i64,
                }
            })))
            .unwrap();
        let secrets = state.secrets.verification_secrets(now_ms());
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets[0], hex::decode("cd".repeat(32)).unwrap());
        assert_eq!(secrets[1], b"initial-secret".to_vec());
    }

    #[test]
    fn malformed_push_is_rejected() {
        let state = state();
        assert!(state.apply_push(b"not json").is_err());
        assert!(state.apply_push(b"[1,2,3]").is_err());
        // Policy shape mismatch (mode must be a known variant).
        let bad = serde_json::to_vec(&json!({"mode": "chaos"})).unwrap();
        assert!(state.apply_push(&bad).is_err());
        assert_eq!(state.hash(), "");
    }

    #[test]
    fn kill_switch_visibility() {
        let state = state();
        assert!(!state.is_kill_switch_active());
        let mut body: Value = serde_json::from_slice(&push_body(json!({}))).unwrap();
        body["security"]["kill_switch"] = json!(true);
        state.apply_push(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert!(state.is_kill_switch_active());
    }
}
