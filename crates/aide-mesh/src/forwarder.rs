//! Bounded forwarder pool: fire-and-forget signed POSTs of admitted
//! inbound envelopes to the assistant.
//!
//! The receive loop never blocks on the assistant: submissions go through
//! a bounded channel drained by a small pool of workers, each of which may
//! wait out a full LLM turn. A full channel drops the envelope with a log
//! line rather than stalling the transport.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use aide_auth::sign;
use aide_core::config::{HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use aide_core::types::{now_ms, InboundMessage};

use crate::state::ConfigState;

pub struct Forwarder {
    tx: mpsc::Sender<InboundMessage>,
}

impl Forwarder {
    /// Start `workers` forwarding tasks. The config state is injected here
    /// so signing always uses the live (possibly rotated) secret.
    pub fn spawn(
        workers: usize,
        assistant_url: &str,
        forward_timeout_secs: u64,
        config_state: Arc<ConfigState>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<InboundMessage>(64);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let url = format!(
            "{}/api/v1/message/inbound",
            assistant_url.trim_end_matches('/')
        );
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(forward_timeout_secs))
            .build()
            .unwrap_or_default();

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let url = url.clone();
            let client = client.clone();
            let config_state = config_state.clone();
            tokio::spawn(async move {
                loop {
                    let message = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(message) = message else {
                        debug!(worker, "forwarder channel closed");
                        return;
                    };
                    forward_one(&client, &url, &config_state, message).await;
                }
            });
        }

        Self { tx }
    }

    /// Queue one envelope. Never blocks; a saturated pool drops it.
    pub fn submit(&self, message: InboundMessage) {
        if let Err(e) = self.tx.try_send(message) {
            warn!(error = %e, "forwarder queue full, envelope dropped");
        }
    }
}

async fn forward_one(
    client: &reqwest::Client,
    url: &str,
    config_state: &ConfigState,
    message: InboundMessage,
) {
    let message_id = message.message_id.clone();
    let body = match serde_json::to_vec(&message) {
        Ok(body) => body,
        Err(e) => {
            error!(message_id = %message_id, error = %e, "envelope serialization failed");
            return;
        }
    };

    let Some(secret) = config_state.secrets.current() else {
        warn!("no shared secret, cannot forward to assistant");
        return;
    };
    let (nonce, timestamp, signature) = sign::signed_headers(&body, &secret, now_ms());

    let request = client
        .post(url)
        .header("content-type", "application/json")
        .header(HEADER_NONCE, nonce)
        .header(HEADER_TIMESTAMP, timestamp)
        .header(HEADER_SIGNATURE, signature);

    match request.body(body).send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!(message_id = %message_id, "forwarded to assistant");
        }
        Ok(resp) => {
            let status = resp.status();
            let detail: Value = resp.json().await.unwrap_or(Value::Null);
            warn!(message_id = %message_id, %status, %detail, "assistant rejected forward");
        }
        Err(e) => {
            error!(message_id = %message_id, error = %e, "forward to assistant failed");
        }
    }
}
