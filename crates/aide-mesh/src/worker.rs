//! The transport receive loop: classify, dedup, gate, forward.
//!
//! Runs on one task so messages are admitted (and later stored) in arrival
//! order. Forwarding and attachment staging are handed off so the loop
//! never waits on the assistant.

use std::sync::Arc;

use base64::Engine;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use aide_auth::sign;
use aide_core::config::{HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP, PEER_HTTP_TIMEOUT_SECS};
use aide_core::types::{now_ms, DocumentIngest, InboundMessage};
use aide_policy::evaluate_inbound;

use crate::app::MeshState;
use crate::envelope::{classify, AttachmentRef, DedupCache, OwnIdentity, TransportEvent};
use crate::forwarder::Forwarder;

/// At most one "slow down" notice per sender per minute.
const NOTICE_INTERVAL_MS: i64 = 60_000;

pub async fn receive_loop(
    state: Arc<MeshState>,
    mut notifications: mpsc::Receiver<Value>,
    forwarder: Forwarder,
) {
    let own = OwnIdentity {
        number: state.config.transport.account.clone(),
        uuid: state.config.transport.account_uuid.clone(),
    };
    let dedup = DedupCache::new(4096);
    let notice_times: DashMap<String, i64> = DashMap::new();
    let ingest_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(PEER_HTTP_TIMEOUT_SECS))
        .build()
        .unwrap_or_default();

    info!("transport receive loop started");
    while let Some(notification) = notifications.recv().await {
        match classify(&notification, &own) {
            TransportEvent::Receipt { kind, timestamps } => {
                state.delivery.mark(kind, &timestamps);
            }
            TransportEvent::Message {
                mut message,
                attachments,
            } => {
                if !dedup.insert(&message.message_id) {
                    debug!(message_id = %message.message_id, "duplicate envelope dropped");
                    continue;
                }
                handle_message(
                    &state,
                    &forwarder,
                    &notice_times,
                    &ingest_client,
                    &mut message,
                    attachments,
                )
                .await;
            }
            TransportEvent::Ignored => {}
        }
    }
    warn!("transport notification stream ended");
}

async fn handle_message(
    state: &Arc<MeshState>,
    forwarder: &Forwarder,
    notice_times: &DashMap<String, i64>,
    ingest_client: &reqwest::Client,
    message: &mut InboundMessage,
    attachments: Vec<AttachmentRef>,
) {
    let Some(policy) = state.state.policy() else {
        warn!("no policy yet, dropping inbound envelope");
        return;
    };

    let now = now_ms();
    let decision = state
        .state
        .with_limiter(|limiter| evaluate_inbound(&policy, message, limiter, now));

    if !decision.allowed {
        match decision.reason {
            "unknown_sender" => {
                // Logged un-redacted so the operator can allowlist.
                warn!(
                    "Dropping sender={} reason=unknown_sender",
                    message.sender.transport_id
                );
            }
            reason @ ("rate_limited_minute" | "rate_limited_hour") => {
                warn!(sender = %message.sender.transport_id, reason, "rate limited");
                send_slow_down(state, notice_times, &message.sender.transport_id, now).await;
            }
            reason => {
                warn!(
                    sender = %message.sender.transport_id,
                    reason,
                    "inbound rejected by policy"
                );
            }
        }
        return;
    }

    message.store_only = decision.store_only;
    // Kill switch: context keeps flowing, replies do not.
    if state.state.is_kill_switch_active() {
        message.store_only = true;
    }
    if let Some(group) = policy.identity.groups.get(&message.conversation.id) {
        message.group_names = Some(group.names.clone());
    }

    // Attachments are staged via the document endpoint, off this task.
    for attachment in attachments {
        stage_attachment(state, ingest_client, message, attachment);
    }

    // Pure-attachment envelopes carry no conversational content.
    if message.content.kind == aide_core::types::ContentType::Attachment {
        return;
    }

    forwarder.submit(message.clone());
}

/// One user-visible throttle notice per sender per minute.
async fn send_slow_down(
    state: &Arc<MeshState>,
    notice_times: &DashMap<String, i64>,
    sender: &str,
    now: i64,
) {
    let recent = notice_times
        .get(sender)
        .is_some_and(|last| now - *last < NOTICE_INTERVAL_MS);
    if recent {
        return;
    }
    notice_times.insert(sender.to_string(), now);

    let params = serde_json::json!({
        "account": state.config.transport.account,
        "recipients": [sender],
        "message": "You're sending messages faster than I can handle. Give me a minute to catch up.",
    });
    if let Err(e) = state.rpc.call("send", params).await {
        warn!(error = %e, "slow-down notice failed");
    }
}

/// Read the attachment the transport saved locally and hand it to the
/// assistant's ingest endpoint, signed, without blocking the receive loop.
fn stage_attachment(
    state: &Arc<MeshState>,
    client: &reqwest::Client,
    message: &InboundMessage,
    attachment: AttachmentRef,
) {
    // Only document types the ingestion pipeline understands.
    let lower = attachment.filename.to_lowercase();
    if !(lower.ends_with(".txt") || lower.ends_with(".md")) {
        debug!(file = %attachment.filename, "skipping non-document attachment");
        return;
    }

    let state = state.clone();
    let client = client.clone();
    let scope = message.conversation.id.clone();
    let sender_id = message.sender.transport_id.clone();
    tokio::spawn(async move {
        let path = std::path::Path::new(&state.config.transport.attachments_dir)
            .join(&attachment.id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(path = %path.display(), error = %e, "attachment file unreadable");
                return;
            }
        };

        let doc = DocumentIngest {
            filename: attachment.filename.clone(),
            content_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            content_type: attachment.content_type.clone(),
            scope,
            sender_id,
        };
        let body = match serde_json::to_vec(&doc) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "attachment payload serialization failed");
                return;
            }
        };

        let Some(secret) = state.state.secrets.current() else {
            warn!("no shared secret, attachment not forwarded");
            return;
        };
        let (nonce, timestamp, signature) = sign::signed_headers(&body, &secret, now_ms());
        let url = format!(
            "{}/api/v1/document/ingest",
            state.config.assistant_url.trim_end_matches('/')
        );

        match client
            .post(&url)
            .header("content-type", "application/json")
            .header(HEADER_NONCE, nonce)
            .header(HEADER_TIMESTAMP, timestamp)
            .header(HEADER_SIGNATURE, signature)
            .body(body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!(file = %attachment.filename, "attachment handed to assistant");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), file = %attachment.filename, "attachment rejected");
            }
            Err(e) => {
                error!(error = %e, file = %attachment.filename, "attachment forward failed");
            }
        }
    });
}
