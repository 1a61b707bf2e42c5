use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;

use aide_core::types::ApiResponse;

use crate::app::AppState;

/// GET /health. The one unauthenticated endpoint.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    Json(ApiResponse::ok(json!({
        "service": "aide-assistant",
        "encrypted_store": state.store.is_encrypted(),
    })))
}
