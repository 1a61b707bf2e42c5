//! Admin surface. Reachable only from loopback or the VPN network (the
//! router layer enforces that); every state-changing route additionally
//! requires a valid request signature.

use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use aide_core::types::ApiResponse;

use crate::app::AppState;
use crate::auth::verify_signed;
use crate::rotation;
use crate::scheduler::config_sync;

/// GET /admin/config/status
pub async fn config_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    let sync = state.sync.lock().unwrap().clone();
    Json(ApiResponse::ok(json!({
        "config_hash": state.policy.hash(),
        "last_push_hash": sync.last_push_hash,
        "last_push_ms": sync.last_push_ms,
    })))
}

/// POST /admin/config/push: force a push regardless of drift state.
pub async fn config_push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = verify_signed(&state, &headers, &body) {
        return resp;
    }
    // Clear the recorded hash so the sync path pushes unconditionally.
    state.sync.lock().unwrap().last_push_hash = None;
    match config_sync(&state).await {
        Ok(_) => Json(ApiResponse::ok(json!({
            "pushed": true,
            "config_hash": state.policy.hash(),
        })))
        .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::error("mesh_unreachable", &e)),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct RotateParams {
    #[serde(default = "default_true")]
    grace: bool,
}

fn default_true() -> bool {
    true
}

/// POST /admin/hmac/rotate?grace=true|false
pub async fn hmac_rotate(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RotateParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = verify_signed(&state, &headers, &body) {
        return resp;
    }
    info!(grace = params.grace, "manual HMAC rotation requested");
    match rotation::rotate(&state, params.grace).await {
        Ok(()) => Json(ApiResponse::ok(json!({ "rotated": true, "grace": params.grace })))
            .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::error("rotation_failed", &e)),
        )
            .into_response(),
    }
}

/// GET /admin/hmac/status
pub async fn hmac_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    let rotation = state.rotation.lock().unwrap().clone();
    Json(ApiResponse::ok(json!({
        "configured": state.secrets.current().is_some(),
        "last_rotation_ms": rotation.last_rotation_ms,
    })))
}

/// GET /admin/security/status
pub async fn security_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    Json(ApiResponse::ok(json!({
        "privacy_mode": state.policy.is_privacy_mode(),
        "kill_switch": state.policy.is_kill_switch_active(),
        "mode": if state.policy.is_business_mode() { "business" } else { "companion" },
    })))
}

#[derive(Deserialize)]
pub struct PrivacyParams {
    enabled: bool,
}

/// POST /admin/security/privacy-mode?enabled=
pub async fn set_privacy_mode(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PrivacyParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = verify_signed(&state, &headers, &body) {
        return resp;
    }
    if let Err(e) = state.policy.set_privacy_mode(params.enabled) {
        return policy_error(e);
    }
    state.tamper.rebaseline(Path::new(&state.config.mesh.policy_path));
    // Propagate on the next sync cycle; privacy mode has no mesh effect.
    Json(ApiResponse::ok(json!({ "privacy_mode": params.enabled }))).into_response()
}

#[derive(Deserialize)]
pub struct KillSwitchParams {
    active: bool,
}

/// POST /admin/security/kill-switch?active=
///
/// The push happens before this returns: the kill switch only takes
/// user-visible effect once the mesh has the new policy.
pub async fn set_kill_switch(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KillSwitchParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = verify_signed(&state, &headers, &body) {
        return resp;
    }
    if let Err(e) = state.policy.set_kill_switch(params.active) {
        return policy_error(e);
    }
    state.tamper.rebaseline(Path::new(&state.config.mesh.policy_path));

    state.sync.lock().unwrap().last_push_hash = None;
    match config_sync(&state).await {
        Ok(_) => Json(ApiResponse::ok(json!({ "kill_switch": params.active, "pushed": true })))
            .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::error(
                "apply_failed",
                &format!("policy saved locally but push failed: {e}"),
            )),
        )
            .into_response(),
    }
}

/// GET /admin/rag/scopes: every (scope, source) with chunk counts.
pub async fn rag_scopes(State(state): State<Arc<AppState>>) -> Response {
    match state.store.knowledge_sources() {
        Ok(sources) => Json(ApiResponse::ok(json!({ "sources": sources }))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error("database_error", &e.to_string())),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct RagSearchParams {
    q: String,
    /// Absent scope = unrestricted search (this is the admin path).
    scope: Option<String>,
}

/// GET /admin/rag/search?q=&scope=
pub async fn rag_search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RagSearchParams>,
) -> Response {
    let scopes = params.scope.map(|s| vec![s]);
    match state.store.search_knowledge(&params.q, 10, scopes.as_deref()) {
        Ok(chunks) => Json(ApiResponse::ok(json!({ "chunks": chunks }))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error("database_error", &e.to_string())),
        )
            .into_response(),
    }
}

fn policy_error(e: aide_policy::PolicyError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error("policy_error", &e.to_string())),
    )
        .into_response()
}
