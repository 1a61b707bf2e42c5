use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use base64::Engine;
use serde_json::json;
use tracing::{info, warn};

use aide_core::types::{now_ms, ApiResponse, DocumentIngest};
use aide_ingest::IngestSettings;

use crate::app::AppState;
use crate::prompt::sanitize_scope;

/// POST /api/v1/document/ingest (signed). A messenger attachment staged
/// into the ingestion area; the scheduler's next pass indexes it.
pub async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(doc): Json<DocumentIngest>,
) -> (StatusCode, Json<ApiResponse>) {
    let scope = sanitize_scope(&doc.scope);
    if scope.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("invalid_scope", "scope is required")),
        );
    }

    let bytes = match base64::engine::general_purpose::STANDARD.decode(&doc.content_base64) {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error("invalid_content", &format!("bad base64: {e}"))),
            )
        }
    };
    if bytes.len() > state.config.ingestion.max_file_bytes {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("file_too_large", "attachment exceeds size limit")),
        );
    }

    let mut settings = IngestSettings::new(&state.config.ingestion.dir);
    settings.max_file_bytes = state.config.ingestion.max_file_bytes;

    match aide_ingest::write_attachment(&settings, &scope, &doc.filename, &bytes, now_ms()) {
        Ok(path) => {
            info!(
                scope = %scope,
                sender = %doc.sender_id,
                file = %doc.filename,
                "attachment staged"
            );
            (
                StatusCode::OK,
                Json(ApiResponse::ok(json!({
                    "staged": path.file_name().and_then(|n| n.to_str()),
                    "scope": scope,
                }))),
            )
        }
        Err(e) => {
            warn!(error = %e, "attachment staging failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("io_error", &e.to_string())),
            )
        }
    }
}
