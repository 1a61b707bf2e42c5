use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::{json, Value};
use tracing::{info, warn};

use aide_auth::canonical::config_hash;

use crate::error::Result;
use crate::types::{GroupConfig, Mode, PolicyConfig};

/// Authoritative policy store on the assistant side.
///
/// The document is persisted as JSON; every mutation re-hashes and re-saves.
/// The hash is computed over the canonical JSON form and compared against
/// what the mesh reports, so drift is detectable.
pub struct PolicyManager {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    config: PolicyConfig,
    hash: String,
}

impl PolicyManager {
    /// Load the policy from disk, creating the default document when absent.
    pub fn load(path: &str) -> Result<Self> {
        let path = PathBuf::from(path);
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PolicyConfig>(&raw) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded policy");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "policy file unreadable, using defaults");
                    PolicyConfig::default()
                }
            },
            Err(_) => {
                warn!(path = %path.display(), "policy file not found, writing defaults");
                let config = PolicyConfig::default();
                save_to(&path, &config)?;
                config
            }
        };
        let hash = hash_of(&config);
        Ok(Self {
            path,
            inner: Mutex::new(Inner { config, hash }),
        })
    }

    pub fn config(&self) -> PolicyConfig {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn hash(&self) -> String {
        self.inner.lock().unwrap().hash.clone()
    }

    pub fn bot_name(&self) -> String {
        self.inner.lock().unwrap().config.identity.bot_name.clone()
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.inner.lock().unwrap().config.security.kill_switch
    }

    pub fn is_privacy_mode(&self) -> bool {
        self.inner.lock().unwrap().config.security.privacy_mode
    }

    pub fn dm_group_knowledge_enabled(&self) -> bool {
        self.inner.lock().unwrap().config.dm_group_knowledge_enabled()
    }

    pub fn is_business_mode(&self) -> bool {
        self.inner.lock().unwrap().config.mode == Mode::Business
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .config
            .identity
            .groups
            .keys()
            .cloned()
            .collect()
    }

    /// Push payload: the full document plus a freshness timestamp. The
    /// timestamp is stripped before hashing on the receiving side.
    pub fn config_for_push(&self, now_ms: i64) -> Value {
        let config = self.config();
        let mut value = serde_json::to_value(&config).expect("policy serializes");
        value["timestamp_ms"] = json!(now_ms);
        value
    }

    // --- mutators ----------------------------------------------------------

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.mutate(|c| c.mode = mode)
    }

    pub fn set_kill_switch(&self, active: bool) -> Result<()> {
        if active {
            warn!("kill switch activated: outbound sends will be refused");
        } else {
            info!("kill switch deactivated");
        }
        self.mutate(|c| c.security.kill_switch = active)
    }

    pub fn set_privacy_mode(&self, enabled: bool) -> Result<()> {
        info!(enabled, "privacy mode updated");
        self.mutate(|c| c.security.privacy_mode = enabled)
    }

    pub fn set_dm_group_knowledge(&self, enabled: bool) -> Result<()> {
        self.mutate(|c| c.dm_group_knowledge = enabled)
    }

    pub fn add_allowed_sender(&self, sender: &str) -> Result<bool> {
        let mut added = false;
        self.mutate(|c| {
            if !c.identity.allowed_senders.iter().any(|s| s == sender) {
                c.identity.allowed_senders.push(sender.to_string());
                added = true;
            }
        })?;
        if added {
            info!(sender, "allowed sender added");
        }
        Ok(added)
    }

    pub fn remove_allowed_sender(&self, sender: &str) -> Result<bool> {
        let mut removed = false;
        self.mutate(|c| {
            let before = c.identity.allowed_senders.len();
            c.identity.allowed_senders.retain(|s| s != sender);
            removed = c.identity.allowed_senders.len() != before;
        })?;
        Ok(removed)
    }

    pub fn update_group(
        &self,
        group_id: &str,
        participants: Vec<String>,
        names: Vec<String>,
    ) -> Result<()> {
        self.mutate(|c| {
            c.identity.groups.insert(
                group_id.to_string(),
                GroupConfig {
                    participants,
                    names,
                },
            );
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut PolicyConfig)) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.config);
        inner.hash = hash_of(&inner.config);
        save_to(&self.path, &inner.config)
    }
}

fn hash_of(config: &PolicyConfig) -> String {
    let value = serde_json::to_value(config).expect("policy serializes");
    config_hash(&value)
}

fn save_to(path: &PathBuf, config: &PolicyConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, PolicyManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let mgr = PolicyManager::load(path.to_str().unwrap()).unwrap();
        (dir, mgr)
    }

    #[test]
    fn fresh_manager_writes_defaults() {
        let (_dir, mgr) = manager();
        assert_eq!(mgr.config().identity.bot_name, "Aide");
        assert_eq!(mgr.hash().len(), 64);
    }

    #[test]
    fn mutation_changes_hash_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let path_str = path.to_str().unwrap().to_string();

        let mgr = PolicyManager::load(&path_str).unwrap();
        let before = mgr.hash();
        mgr.add_allowed_sender("+15550001111").unwrap();
        let after = mgr.hash();
        assert_ne!(before, after);

        // A reload sees the same content and hash.
        let reloaded = PolicyManager::load(&path_str).unwrap();
        assert_eq!(reloaded.hash(), after);
        assert_eq!(
            reloaded.config().identity.allowed_senders,
            vec!["+15550001111"]
        );
    }

    #[test]
    fn identical_mutation_is_hash_stable() {
        let (_dir, mgr) = manager();
        mgr.add_allowed_sender("+1").unwrap();
        let h1 = mgr.hash();
        assert!(!mgr.add_allowed_sender("+1").unwrap());
        assert_eq!(mgr.hash(), h1);
    }

    #[test]
    fn push_payload_carries_timestamp_outside_hash() {
        let (_dir, mgr) = manager();
        let payload = mgr.config_for_push(1_700_000_000_000);
        assert_eq!(payload["timestamp_ms"], 1_700_000_000_000i64);

        // Hash over the payload minus the timestamp equals the local hash.
        let mut stripped = payload.clone();
        stripped.as_object_mut().unwrap().remove("timestamp_ms");
        assert_eq!(aide_auth::canonical::config_hash(&stripped), mgr.hash());
    }

    #[test]
    fn kill_switch_round_trip() {
        let (_dir, mgr) = manager();
        assert!(!mgr.is_kill_switch_active());
        mgr.set_kill_switch(true).unwrap();
        assert!(mgr.is_kill_switch_active());
    }
}
