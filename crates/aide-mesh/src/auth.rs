//! HMAC verification middleware for the mesh's signed routes. The pure
//! ordered verification lives in aide-auth; this layer only buffers the
//! body and maps failures onto the response envelope.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use aide_core::config::{HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use aide_core::types::{now_ms, ApiResponse};

use crate::app::MeshState;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub async fn require_signature(
    State(state): State<Arc<MeshState>>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ApiResponse::error("body_too_large", "request body too large")),
            )
                .into_response()
        }
    };

    let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
    if let Err(e) = aide_auth::verify_request(
        header(HEADER_NONCE),
        header(HEADER_TIMESTAMP),
        header(HEADER_SIGNATURE),
        &bytes,
        &state.state.secrets,
        &state.nonces,
        state.config.auth.timestamp_tolerance_ms,
        now_ms(),
    ) {
        warn!(code = e.code(), path = %parts.uri.path(), "request authentication failed");
        return (
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::UNAUTHORIZED),
            Json(ApiResponse::error(e.code(), &e.to_string())),
        )
            .into_response();
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}
