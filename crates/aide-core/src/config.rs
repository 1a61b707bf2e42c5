use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Signing headers; must match on both sides of the mesh <-> assistant link
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_SIGNATURE: &str = "x-hmac-sha256";

/// Timestamp tolerance for signed requests: 5 minutes.
pub const DEFAULT_TIMESTAMP_TOLERANCE_MS: i64 = 300_000;
/// Nonce retention: 15 minutes (must stay > 2x timestamp tolerance).
pub const NONCE_RETENTION_MS: i64 = 15 * 60 * 1000;
/// Grace period during key rotation: old key stays valid this long.
pub const DEFAULT_ROTATION_GRACE_MS: i64 = 60_000;
/// Mesh ↔ assistant request timeout.
pub const PEER_HTTP_TIMEOUT_SECS: u64 = 10;
/// Transport (signal-cli) RPC timeout.
pub const TRANSPORT_RPC_TIMEOUT_SECS: u64 = 30;

/// Exit code for detected config tampering (EX_CONFIG).
pub const EXIT_TAMPER: i32 = 78;

/// Assistant process config (aide.toml + AIDE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mesh: MeshLinkConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sending: SendingConfig,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            mesh: MeshLinkConfig::default(),
            llm: LlmConfig::default(),
            memory: MemoryConfig::default(),
            compaction: CompactionConfig::default(),
            prompts: PromptsConfig::default(),
            ingestion: IngestionConfig::default(),
            auth: AuthConfig::default(),
            scheduler: SchedulerConfig::default(),
            sending: SendingConfig::default(),
        }
    }
}

impl AssistantConfig {
    /// Load config from a TOML file with AIDE_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_assistant_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("AIDE_").split("_"))
            .extract()
            .map_err(|e| crate::error::AideError::Config(e.to_string()))
    }
}

/// Mesh process config (mesh.toml + MESH_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_mesh_http")]
    pub http: HttpConfig,
    /// Base URL of the assistant process.
    #[serde(default = "default_assistant_url")]
    pub assistant_url: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Fire-and-forget forwarder pool size.
    #[serde(default = "default_forward_workers")]
    pub forward_workers: usize,
    /// Seconds a forward may wait on the assistant (covers a full LLM turn).
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,
    /// Outbound text hard cap enforced before the transport RPC.
    #[serde(default = "default_outbound_max_text")]
    pub outbound_max_text: usize,
    /// Outbound sends allowed per recipient per hour.
    #[serde(default = "default_outbound_per_hour")]
    pub outbound_per_hour: usize,
    /// More permissive hourly bucket for escalated criticals.
    #[serde(default = "default_escalated_per_hour")]
    pub escalated_per_hour: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            http: default_mesh_http(),
            assistant_url: default_assistant_url(),
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            forward_workers: default_forward_workers(),
            forward_timeout_secs: default_forward_timeout(),
            outbound_max_text: default_outbound_max_text(),
            outbound_per_hour: default_outbound_per_hour(),
            escalated_per_hour: default_escalated_per_hour(),
        }
    }
}

impl MeshConfig {
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_mesh_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MESH_").split("_"))
            .extract()
            .map_err(|e| crate::error::AideError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_assistant_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_assistant_port(),
        }
    }
}

/// Assistant's view of the mesh peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshLinkConfig {
    #[serde(default = "default_mesh_url")]
    pub url: String,
    /// Authoritative policy file pushed to mesh.
    #[serde(default = "default_policy_path")]
    pub policy_path: String,
}

impl Default for MeshLinkConfig {
    fn default() -> Self {
        Self {
            url: default_mesh_url(),
            policy_path: default_policy_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Seconds; LLM calls can take a while on a single local GPU.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// 0 = model default context length.
    #[serde(default)]
    pub num_ctx: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            num_ctx: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Encryption key file; enables SQLCipher when compiled in.
    #[serde(default = "default_key_file")]
    pub key_file: String,
    /// Refuse to start without an encrypted store.
    #[serde(default)]
    pub require_encrypted: bool,
    /// Messages pulled into the chat context by default.
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            key_file: default_key_file(),
            require_encrypted: false,
            context_messages: default_context_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Context window C: compaction triggers when count > C.
    #[serde(default = "default_compact_window")]
    pub context_messages: usize,
    /// Batch B: oldest messages compacted per pass. 10 <= B < C/2.
    #[serde(default = "default_compact_batch")]
    pub batch_size: usize,
    /// Archive instead of hard-deleting compacted messages.
    #[serde(default)]
    pub archive: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_messages: default_compact_window(),
            batch_size: default_compact_batch(),
            archive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_prompts_dir")]
    pub dir: String,
    /// Append the current date/time to the system prompt.
    #[serde(default = "bool_true")]
    pub time_awareness: bool,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            dir: default_prompts_dir(),
            time_awareness: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_ingestion_dir")]
    pub dir: String,
    /// Move originals to done/ instead of marker-and-delete.
    #[serde(default)]
    pub keep_files: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
    /// Reject files larger than this many bytes.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            dir: default_ingestion_dir(),
            keep_files: false,
            chunk_size: default_chunk_size(),
            overlap: default_chunk_overlap(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret; overrides secret_file when set (hex or raw).
    #[serde(default)]
    pub secret: Option<String>,
    /// File holding the active secret, rewritten on rotation.
    #[serde(default = "default_secret_file")]
    pub secret_file: String,
    /// Rotation state (last rotation time) survives restarts here.
    #[serde(default = "default_rotation_state_file")]
    pub rotation_state_file: String,
    #[serde(default = "default_timestamp_tolerance")]
    pub timestamp_tolerance_ms: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            secret_file: default_secret_file(),
            rotation_state_file: default_rotation_state_file(),
            timestamp_tolerance_ms: default_timestamp_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    /// Files covered by the tamper check, in addition to the policy file.
    #[serde(default)]
    pub tamper_files: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            startup_delay_secs: default_startup_delay_secs(),
            tamper_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingConfig {
    /// Outbound messages per hour (critical bypasses).
    #[serde(default = "default_sends_per_hour")]
    pub max_per_hour: usize,
    /// Minimum delay between sends to the same DM, milliseconds.
    #[serde(default = "default_dm_cooldown")]
    pub dm_cooldown_ms: u64,
    /// Minimum delay between sends to the same group, milliseconds.
    #[serde(default = "default_group_cooldown")]
    pub group_cooldown_ms: u64,
}

impl Default for SendingConfig {
    fn default() -> Self {
        Self {
            max_per_hour: default_sends_per_hour(),
            dm_cooldown_ms: default_dm_cooldown(),
            group_cooldown_ms: default_group_cooldown(),
        }
    }
}

/// Transport child process (signal-cli in jsonRpc mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_bin")]
    pub binary: String,
    /// Account identifier passed to the transport (E.164 number).
    #[serde(default)]
    pub account: String,
    /// UUID the transport knows this account by; used for mention checks.
    #[serde(default)]
    pub account_uuid: String,
    /// Where the transport stores received attachment files.
    #[serde(default = "default_attachments_dir")]
    pub attachments_dir: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            binary: default_transport_bin(),
            account: String::new(),
            account_uuid: String::new(),
            attachments_dir: default_attachments_dir(),
            extra_args: Vec::new(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_assistant_port() -> u16 {
    8443
}
fn default_mesh_http() -> HttpConfig {
    HttpConfig {
        bind: default_bind(),
        port: 8380,
    }
}
fn default_assistant_url() -> String {
    "http://127.0.0.1:8443".to_string()
}
fn default_mesh_url() -> String {
    "http://127.0.0.1:8380".to_string()
}
fn default_policy_path() -> String {
    data_path("policy/mesh-policy.json")
}
fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3.1".to_string()
}
fn default_llm_timeout() -> u64 {
    180
}
fn default_db_path() -> String {
    data_path("memory.db")
}
fn default_key_file() -> String {
    data_path("memory.key")
}
fn default_context_messages() -> usize {
    10
}
fn default_compact_window() -> usize {
    50
}
fn default_compact_batch() -> usize {
    20
}
fn default_prompts_dir() -> String {
    data_path("prompts")
}
fn default_ingestion_dir() -> String {
    data_path("ingestion")
}
fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_max_file_bytes() -> usize {
    1024 * 1024
}
fn default_secret_file() -> String {
    data_path("hmac.key")
}
fn default_rotation_state_file() -> String {
    data_path("hmac-rotation-state.json")
}
fn default_timestamp_tolerance() -> i64 {
    DEFAULT_TIMESTAMP_TOLERANCE_MS
}
fn default_tick_secs() -> u64 {
    60
}
fn default_startup_delay_secs() -> u64 {
    15
}
fn default_sends_per_hour() -> usize {
    30
}
fn default_dm_cooldown() -> u64 {
    5_000
}
fn default_group_cooldown() -> u64 {
    2_000
}
fn default_forward_workers() -> usize {
    4
}
fn default_outbound_max_text() -> usize {
    2048
}
fn default_outbound_per_hour() -> usize {
    60
}
fn default_escalated_per_hour() -> usize {
    240
}
fn default_forward_timeout() -> u64 {
    200
}
fn default_transport_bin() -> String {
    "signal-cli".to_string()
}
fn default_attachments_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.local/share/signal-cli/attachments")
}

fn data_path(rel: &str) -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.aide/{rel}")
}
fn default_assistant_config_path() -> String {
    data_path("aide.toml")
}
fn default_mesh_config_path() -> String {
    data_path("mesh.toml")
}
