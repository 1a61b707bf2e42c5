use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::json;
use tracing::{info, warn};

use aide_core::types::{now_ms, ApiResponse, ContentType, ConversationKind, OutboundMessage, Priority};

use crate::app::MeshState;

/// POST /api/v1/message/outbound (signed). One message from the assistant
/// onto the wire.
pub async fn outbound_handler(
    State(state): State<Arc<MeshState>>,
    Json(msg): Json<OutboundMessage>,
) -> (StatusCode, Json<ApiResponse>) {
    if state.state.is_kill_switch_active() {
        warn!("outbound refused, kill switch active");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error("kill_switch_active", "outbound sending is disabled")),
        );
    }

    if msg.transport != "signal" {
        return reject("invalid_content", "unsupported transport");
    }
    if msg.content.kind != ContentType::Text {
        return reject("unsupported_content_type", "only text can be sent");
    }
    let text = msg.content.text.clone();
    if text.is_empty() {
        return reject("invalid_text", "text content required");
    }
    if text.len() > state.config.outbound_max_text {
        return reject("text_too_long", "text exceeds outbound limit");
    }

    let critical = msg.priority == Priority::Critical;
    let recipient_key = msg.recipient.transport_id.clone();
    if !state
        .out_limiter
        .check_and_add(&recipient_key, critical, msg.escalated, now_ms())
    {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ApiResponse::error("rate_limited_hour", "outbound limit reached")),
        );
    }

    let mut params = json!({
        "account": state.config.transport.account,
        "message": text,
    });
    match msg.delivery.target {
        ConversationKind::Group => {
            let Some(group_id) = msg.delivery.group_id.clone() else {
                return reject("invalid_conversation", "group delivery requires group_id");
            };
            params["groupId"] = json!(group_id);
        }
        ConversationKind::Direct => {
            params["recipients"] = json!([msg.recipient.transport_id]);
        }
    }

    match state.rpc.call("send", params).await {
        Ok(result) => {
            // The transport echoes the timestamp that receipts will carry.
            let timestamp = result["timestamp"].as_i64().unwrap_or_else(now_ms);
            state.delivery.register(timestamp, now_ms());
            info!(
                recipient = %msg.recipient.transport_id,
                timestamp,
                critical,
                "message sent"
            );
            (
                StatusCode::OK,
                Json(ApiResponse::ok(json!({
                    "message_id": timestamp.to_string(),
                    "transport": "signal",
                    "sent_at": now_ms(),
                    "delivered": false,
                }))),
            )
        }
        Err(e) => {
            warn!(error = %e, "transport send failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::error("transport_error", &e.to_string())),
            )
        }
    }
}

fn reject(code: &str, message: &str) -> (StatusCode, Json<ApiResponse>) {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::error(code, message)))
}
