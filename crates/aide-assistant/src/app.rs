use std::sync::{Arc, Mutex};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use aide_auth::{NonceStore, SecretState};
use aide_core::config::{AssistantConfig, NONCE_RETENTION_MS};
use aide_llm::{OllamaClient, TextGenerator};
use aide_memory::MemoryStore;
use aide_policy::{MembershipCache, PolicyManager};
use aide_queue::{OutboundLimiter, RequestQueue, SendCooldown};

use crate::mesh_client::MeshClient;
use crate::prompt::PromptResolver;
use crate::rotation::RotationState;
use crate::tamper::TamperCheck;

/// Tracks what the assistant last pushed to the mesh, for drift detection.
#[derive(Debug, Default, Clone)]
pub struct SyncState {
    pub last_push_hash: Option<String>,
    pub last_push_ms: i64,
}

/// Central shared state, passed as Arc<AppState> to all Axum handlers and
/// the scheduler. Construction wires the dependencies explicitly: the
/// nonce store exists before the signing middleware, config state before
/// anything that pushes.
pub struct AppState {
    pub config: AssistantConfig,
    pub store: MemoryStore,
    pub llm: Arc<dyn TextGenerator>,
    pub policy: PolicyManager,
    pub prompts: PromptResolver,
    pub queue: RequestQueue,
    pub secrets: SecretState,
    pub nonces: NonceStore,
    pub cooldown: SendCooldown,
    pub out_limiter: OutboundLimiter,
    pub membership: MembershipCache,
    pub mesh: MeshClient,
    pub sync: Mutex<SyncState>,
    pub rotation: Mutex<RotationState>,
    pub tamper: TamperCheck,
}

impl AppState {
    pub fn new(config: AssistantConfig) -> anyhow::Result<Self> {
        let store = MemoryStore::open(
            &config.memory.db_path,
            &config.memory.key_file,
            config.memory.require_encrypted,
        )?;
        let policy = PolicyManager::load(&config.mesh.policy_path)?;
        let secrets = SecretState::load(config.auth.secret.as_deref(), &config.auth.secret_file);
        let nonces = NonceStore::new(NONCE_RETENTION_MS, 100_000);
        let llm: Arc<dyn TextGenerator> = Arc::new(OllamaClient::new(
            &config.llm.base_url,
            &config.llm.model,
            config.llm.timeout_secs,
            config.llm.num_ctx,
        ));
        let mesh = MeshClient::new(&config.mesh.url);
        let prompts = PromptResolver::new(&config.prompts.dir);
        let rotation = RotationState::load(&config.auth.rotation_state_file);
        let tamper = TamperCheck::new(tamper_file_list(&config, &prompts));

        Ok(Self {
            store,
            llm,
            policy,
            prompts,
            queue: RequestQueue::new(),
            secrets,
            nonces,
            cooldown: SendCooldown::new(
                config.sending.dm_cooldown_ms,
                config.sending.group_cooldown_ms,
            ),
            out_limiter: OutboundLimiter::new(config.sending.max_per_hour, usize::MAX / 2),
            membership: MembershipCache::new(15 * 60 * 1000),
            mesh,
            sync: Mutex::new(SyncState::default()),
            rotation: Mutex::new(rotation),
            tamper,
            config,
        })
    }

    /// Wait budget for a queued LLM turn: the LLM timeout plus slack for
    /// queueing and delivery.
    pub fn enqueue_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.llm.timeout_secs + 30)
    }
}

/// Files the tamper check watches: the policy file, key files, rotation
/// state, operator-listed extras, and every file in the prompt tree.
fn tamper_file_list(
    config: &AssistantConfig,
    prompts: &PromptResolver,
) -> Vec<std::path::PathBuf> {
    let mut files = vec![
        std::path::PathBuf::from(&config.mesh.policy_path),
        std::path::PathBuf::from(&config.memory.key_file),
        std::path::PathBuf::from(&config.auth.secret_file),
        std::path::PathBuf::from(&config.auth.rotation_state_file),
    ];
    for extra in &config.scheduler.tamper_files {
        files.push(std::path::PathBuf::from(extra));
    }
    files.extend(prompts.tamper_files());
    files.sort();
    files.dedup();
    files
}

/// Assemble the full Axum router. Signed routes share the HMAC middleware;
/// the admin surface is gated by source address instead (state-changing
/// admin routes re-check the signature inside their handlers).
pub fn build_router(state: Arc<AppState>) -> Router {
    let signed = Router::new()
        .route("/api/v1/message/inbound", post(crate::http::inbound::inbound_handler))
        .route("/api/v1/document/ingest", post(crate::http::ingest::ingest_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_signature,
        ));

    let admin = Router::new()
        .route("/admin/config/status", get(crate::http::admin::config_status))
        .route("/admin/config/push", post(crate::http::admin::config_push))
        .route("/admin/hmac/rotate", post(crate::http::admin::hmac_rotate))
        .route("/admin/hmac/status", get(crate::http::admin::hmac_status))
        .route("/admin/security/status", get(crate::http::admin::security_status))
        .route(
            "/admin/security/privacy-mode",
            post(crate::http::admin::set_privacy_mode),
        )
        .route(
            "/admin/security/kill-switch",
            post(crate::http::admin::set_kill_switch),
        )
        .route("/admin/rag/scopes", get(crate::http::admin::rag_scopes))
        .route("/admin/rag/search", get(crate::http::admin::rag_search))
        .layer(middleware::from_fn(crate::auth::require_local_source));

    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .merge(signed)
        .merge(admin)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
