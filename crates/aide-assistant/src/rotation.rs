//! HMAC key rotation.
//!
//! The assistant drives rotation: a fresh 32-byte secret rides along with
//! a config push under `hmac_rotation`, signed with the *current* secret.
//! Once the mesh accepts, both sides keep the previous key valid for the
//! grace period; incident-response rotation uses grace 0 and cuts over
//! immediately. The new secret is persisted so it survives restarts.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use aide_auth::secrets::generate_secret;
use aide_core::config::DEFAULT_ROTATION_GRACE_MS;
use aide_core::types::now_ms;

use crate::app::AppState;

const ROTATION_INTERVAL_MS: i64 = 7 * 24 * 3600 * 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationState {
    pub last_rotation_ms: Option<i64>,
}

impl RotationState {
    pub fn load(path: &str) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &str) {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string(self) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(path, raw) {
                    error!(path, error = %e, "rotation state save failed");
                }
            }
            Err(e) => error!(error = %e, "rotation state serialize failed"),
        }
    }

    /// Weekly cadence, and only once an initial manual rotation has set a
    /// baseline.
    pub fn is_due(&self, now: i64) -> bool {
        self.last_rotation_ms
            .is_some_and(|last| now - last >= ROTATION_INTERVAL_MS)
    }
}

/// Execute a rotation. `grace = false` is the incident path: the previous
/// key is invalidated immediately on both sides.
pub async fn rotate(state: &AppState, grace: bool) -> Result<(), String> {
    let now = now_ms();
    let grace_ms = if grace { DEFAULT_ROTATION_GRACE_MS } else { 0 };

    if state.secrets.current().is_none() {
        return Err("no_current_secret".to_string());
    }

    info!(grace_ms, "starting HMAC key rotation");
    let new_secret = generate_secret();

    let mut payload = state.policy.config_for_push(now);
    payload["hmac_rotation"] = json!({
        "new_secret": hex::encode(&new_secret),
        "effective_at_ms": now + grace_ms,
        "grace_period_ms": grace_ms,
    });

    // Signed with the current (pre-rotation) secret; install only after the
    // mesh has accepted.
    let mesh_hash = state
        .mesh
        .push_config(&payload, &state.secrets)
        .await
        .map_err(|e| format!("mesh_rejected: {e}"))?;

    state.secrets.install(new_secret, grace_ms, now);
    if let Err(e) = state.secrets.persist(&state.config.auth.secret_file) {
        return Err(format!("failed_to_persist_secret: {e}"));
    }

    {
        let mut sync = state.sync.lock().unwrap();
        sync.last_push_hash = Some(mesh_hash);
        sync.last_push_ms = now;
    }
    {
        let mut rotation = state.rotation.lock().unwrap();
        rotation.last_rotation_ms = Some(now);
        rotation.save(&state.config.auth.rotation_state_file);
    }

    // These are our own writes; the tamper watcher must accept them.
    state
        .tamper
        .rebaseline(std::path::Path::new(&state.config.auth.secret_file));
    state
        .tamper
        .rebaseline(std::path::Path::new(&state.config.auth.rotation_state_file));

    info!("HMAC rotation complete, new key active");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_is_never_due_before_first_rotation() {
        let state = RotationState::default();
        assert!(!state.is_due(i64::MAX));
    }

    #[test]
    fn rotation_due_after_a_week() {
        let state = RotationState {
            last_rotation_ms: Some(0),
        };
        assert!(!state.is_due(ROTATION_INTERVAL_MS - 1));
        assert!(state.is_due(ROTATION_INTERVAL_MS));
    }

    #[test]
    fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotation.json");
        let path_str = path.to_str().unwrap();

        let state = RotationState {
            last_rotation_ms: Some(12345),
        };
        state.save(path_str);
        let loaded = RotationState::load(path_str);
        assert_eq!(loaded.last_rotation_ms, Some(12345));

        // Missing or corrupt files load as default.
        assert_eq!(RotationState::load("/nonexistent").last_rotation_ms, None);
    }
}
