use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub done: bool,
}

/// Seam over the LLM backend so handlers and the consolidation engine can
/// run against a scripted fake in tests.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// One-shot completion (fact extraction, summaries, brief replies).
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        model: Option<&str>,
    ) -> Result<LlmResponse, LlmError>;

    /// Multi-turn chat with history.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        model: Option<&str>,
    ) -> Result<LlmResponse, LlmError>;
}

/// Non-streaming Ollama API client.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    /// 0 = model default context length.
    num_ctx: u32,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64, num_ctx: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            num_ctx,
        }
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status, body = %message, "LLM API error");
            return Err(LlmError::Api { status, message });
        }

        resp.json().await.map_err(|e| LlmError::Parse(e.to_string()))
    }

    fn options(&self) -> Option<serde_json::Value> {
        (self.num_ctx > 0).then(|| serde_json::json!({"num_ctx": self.num_ctx}))
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        model: Option<&str>,
    ) -> Result<LlmResponse, LlmError> {
        let use_model = model.unwrap_or(&self.model);
        let mut body = serde_json::json!({
            "model": use_model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        if let Some(options) = self.options() {
            body["options"] = options;
        }

        debug!(model = %use_model, prompt_len = prompt.len(), "generate request");
        let data = self.post("/api/generate", &body).await?;
        Ok(LlmResponse {
            text: data["response"].as_str().unwrap_or_default().to_string(),
            model: data["model"].as_str().unwrap_or(use_model).to_string(),
            done: data["done"].as_bool().unwrap_or(true),
        })
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system: Option<&str>,
        model: Option<&str>,
    ) -> Result<LlmResponse, LlmError> {
        let use_model = model.unwrap_or(&self.model);

        // When a system prompt is given, prepend it as a system message;
        // when absent the model's own baked-in prompt applies.
        let mut wire_messages: Vec<ChatMessage> = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            wire_messages.push(ChatMessage {
                role: ChatRole::System,
                content: system.to_string(),
            });
        }
        wire_messages.extend(messages.iter().cloned());

        let mut body = serde_json::json!({
            "model": use_model,
            "messages": wire_messages,
            "stream": false,
        });
        if let Some(options) = self.options() {
            body["options"] = options;
        }

        debug!(model = %use_model, turns = messages.len(), "chat request");
        let data = self.post("/api/chat", &body).await?;
        Ok(LlmResponse {
            text: data["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            model: data["model"].as_str().unwrap_or(use_model).to_string(),
            done: data["done"].as_bool().unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_messages_serialize_with_lowercase_roles() {
        let msg = ChatMessage {
            role: ChatRole::Assistant,
            content: "hi".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn error_codes_match_taxonomy() {
        assert_eq!(LlmError::Timeout.code(), "timeout");
        assert_eq!(
            LlmError::Api {
                status: 502,
                message: String::new()
            }
            .code(),
            "http_error: 502"
        );
    }
}
