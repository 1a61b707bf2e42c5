use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde_json::json;
use tracing::warn;

use aide_core::types::{now_ms, ApiResponse};

use crate::app::MeshState;

/// POST /config/sync (signed): replace the in-memory policy with the pushed one.
/// The response carries the hash the mesh computed over the canonical
/// (timestamp- and rotation-stripped) body; the assistant compares it with
/// its own.
pub async fn sync_handler(
    State(state): State<Arc<MeshState>>,
    body: Bytes,
) -> (StatusCode, Json<ApiResponse>) {
    match state.state.apply_push(&body) {
        Ok(hash) => (
            StatusCode::OK,
            Json(ApiResponse::ok(json!({
                "config_hash": hash,
                "applied_at": now_ms(),
            }))),
        ),
        Err(e) => {
            warn!(error = %e, "config push rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error("apply_failed", &e)),
            )
        }
    }
}

/// GET /config/status: the current hash, empty string on a fresh mesh.
pub async fn status_handler(State(state): State<Arc<MeshState>>) -> Json<ApiResponse> {
    Json(ApiResponse::ok(json!({
        "config_hash": state.state.hash(),
    })))
}
