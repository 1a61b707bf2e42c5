use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;

use aide_core::types::ApiResponse;

use crate::app::MeshState;

/// GET /health. Never authenticated.
pub async fn health_handler(State(state): State<Arc<MeshState>>) -> Json<ApiResponse> {
    Json(ApiResponse::ok(json!({
        "service": "aide-mesh",
        "policy_loaded": state.state.policy().is_some(),
        "tracked_deliveries": state.delivery.len(),
    })))
}
