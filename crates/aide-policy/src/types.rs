use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Operating mode. Companion hard-disables cross-conversation knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Companion,
    Business,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Companion
    }
}

/// The canonical policy document. Authoritative on the assistant, opaque on
/// the mesh; pushed whole and hashed over its canonical JSON form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub mode: Mode,
    /// Only honored in business mode.
    #[serde(default)]
    pub dm_group_knowledge: bool,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub validation: Validation,
    #[serde(default)]
    pub security: Security,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            mode: Mode::Companion,
            dm_group_knowledge: false,
            identity: Identity::default(),
            rate_limits: RateLimits::default(),
            validation: Validation::default(),
            security: Security::default(),
        }
    }
}

impl PolicyConfig {
    /// Cross-conversation knowledge is a business-mode feature only.
    pub fn dm_group_knowledge_enabled(&self) -> bool {
        self.mode == Mode::Business && self.dm_group_knowledge
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    /// group_id -> configured participants and answerable names.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            bot_name: default_bot_name(),
            allowed_senders: Vec::new(),
            groups: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimits {
    #[serde(default)]
    pub inbound: InboundLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundLimits {
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: usize,
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: usize,
}

impl Default for InboundLimits {
    fn default() -> Self {
        Self {
            max_per_hour: default_max_per_hour(),
            max_per_minute: default_max_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default = "default_max_skew")]
    pub max_timestamp_skew_ms: i64,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            max_text_length: default_max_text_length(),
            max_timestamp_skew_ms: default_max_skew(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    #[serde(default = "bool_true")]
    pub privacy_mode: bool,
    #[serde(default)]
    pub kill_switch: bool,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            privacy_mode: true,
            kill_switch: false,
        }
    }
}

fn default_version() -> u32 {
    1
}
fn default_bot_name() -> String {
    "Aide".to_string()
}
fn default_max_per_hour() -> usize {
    120
}
fn default_max_per_minute() -> usize {
    20
}
fn default_max_text_length() -> usize {
    1500
}
fn default_max_skew() -> i64 {
    300_000
}
fn bool_true() -> bool {
    true
}
