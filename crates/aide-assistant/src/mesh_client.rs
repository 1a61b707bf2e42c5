//! Signed HTTP client for the mesh peer: outbound sends, config push, and
//! status polling.

use serde_json::Value;
use tracing::{debug, warn};

use aide_auth::{sign, SecretState};
use aide_core::config::{HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP, PEER_HTTP_TIMEOUT_SECS};
use aide_core::types::{now_ms, OutboundMessage};
use aide_core::AideError;

pub struct MeshClient {
    client: reqwest::Client,
    base_url: String,
}

impl MeshClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PEER_HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_signed(
        &self,
        path: &str,
        body: Vec<u8>,
        secrets: &SecretState,
    ) -> Result<Value, AideError> {
        let secret = secrets
            .current()
            .ok_or_else(|| AideError::AuthFailed("no signing secret configured".into()))?;
        let (nonce, timestamp, signature) = sign::signed_headers(&body, &secret, now_ms());

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header(HEADER_NONCE, nonce)
            .header(HEADER_TIMESTAMP, timestamp)
            .header(HEADER_SIGNATURE, signature)
            .body(body)
            .send()
            .await
            .map_err(|e| AideError::MeshUnreachable(e.to_string()))?;

        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .map_err(|e| AideError::MeshUnreachable(format!("bad response body: {e}")))?;

        if !status.is_success() || value["status"] != "ok" {
            let code = value["error"]["code"].as_str().unwrap_or("unknown");
            warn!(%status, code, path, "mesh rejected request");
            return Err(AideError::Internal(format!("mesh error: {code}")));
        }
        Ok(value)
    }

    /// Hand one outbound message to the mesh for delivery.
    pub async fn send_message(
        &self,
        message: &OutboundMessage,
        secrets: &SecretState,
    ) -> Result<Value, AideError> {
        let body = serde_json::to_vec(message)?;
        let value = self
            .post_signed("/api/v1/message/outbound", body, secrets)
            .await?;
        debug!(
            recipient = %message.recipient.transport_id,
            "outbound accepted by mesh"
        );
        Ok(value)
    }

    /// Push the full policy payload. Returns the hash the mesh computed.
    pub async fn push_config(
        &self,
        payload: &Value,
        secrets: &SecretState,
    ) -> Result<String, AideError> {
        let body = serde_json::to_vec(payload)?;
        let value = self.post_signed("/config/sync", body, secrets).await?;
        value["data"]["config_hash"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AideError::Internal("push response missing config_hash".into()))
    }

    /// The mesh's current policy hash; None when the mesh has none yet
    /// (fresh start).
    pub async fn fetch_status(&self, secrets: &SecretState) -> Result<Option<String>, AideError> {
        let secret = secrets
            .current()
            .ok_or_else(|| AideError::AuthFailed("no signing secret configured".into()))?;
        let (nonce, timestamp, signature) = sign::signed_headers(b"", &secret, now_ms());

        let url = format!("{}/config/status", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header(HEADER_NONCE, nonce)
            .header(HEADER_TIMESTAMP, timestamp)
            .header(HEADER_SIGNATURE, signature)
            .send()
            .await
            .map_err(|e| AideError::MeshUnreachable(e.to_string()))?;

        let value: Value = resp
            .json()
            .await
            .map_err(|e| AideError::MeshUnreachable(format!("bad response body: {e}")))?;
        let hash = value["data"]["config_hash"]
            .as_str()
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty());
        Ok(hash)
    }
}
