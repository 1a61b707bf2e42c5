use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::info;

use aide_core::types::InboundMessage;

use crate::app::AppState;
use crate::handler::{handle_inbound, InboundOutcome};

/// POST /api/v1/message/inbound (signed). One forwarded envelope in, one
/// stored message (and possibly one reply) out.
///
/// Response contract: `{status, message_id?, error?}`.
pub async fn inbound_handler(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<InboundMessage>,
) -> (StatusCode, Json<Value>) {
    let message_id = msg.message_id.clone();
    info!(
        message_id = %message_id,
        conversation = %msg.conversation.id,
        store_only = msg.store_only,
        "inbound message received"
    );

    match handle_inbound(state, msg).await {
        InboundOutcome::Stored => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "message_id": message_id })),
        ),
        InboundOutcome::Replied(reply) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "message_id": message_id,
                "replied": true,
                "reply_chars": reply.len(),
            })),
        ),
        InboundOutcome::Rejected(code, message) => {
            let status = if code == "database_error" {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::BAD_REQUEST
            };
            (
                status,
                Json(json!({
                    "status": "error",
                    "message_id": message_id,
                    "error": { "code": code, "message": message },
                })),
            )
        }
    }
}
