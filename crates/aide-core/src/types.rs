//! Wire types for the mesh ↔ assistant HTTP contract.
//!
//! Both processes serialize these with serde; field names are the contract,
//! so renames here are wire-breaking.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Reaction,
    Attachment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSender {
    /// Logical id: "owner" for the primary user, otherwise opaque.
    pub id: String,
    /// Transport identity (phone number preferred, UUID fallback).
    pub transport_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConversation {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundContent {
    #[serde(rename = "type")]
    pub kind: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<String>,
    /// Transport-native payload carried through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_native: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRef {
    pub message_id: String,
}

/// Mesh → assistant: one normalized, policy-approved envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub transport: String,
    pub message_id: String,
    pub sender: InboundSender,
    pub conversation: InboundConversation,
    #[serde(default)]
    pub priority: Priority,
    pub content: InboundContent,
    /// Epoch milliseconds from the transport.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<QuoteRef>,
    /// Stored for context but never answered.
    #[serde(default)]
    pub store_only: bool,
    /// Display names the bot answers to in this group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_names: Option<Vec<String>>,
    /// Transport-level mention of the bot's identity.
    #[serde(default)]
    pub bot_mentioned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRecipient {
    pub id: String,
    pub transport_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundDelivery {
    pub target: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundContent {
    #[serde(rename = "type")]
    pub kind: ContentType,
    pub text: String,
}

/// Assistant → mesh: one message to put on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub transport: String,
    pub recipient: OutboundRecipient,
    #[serde(default)]
    pub priority: Priority,
    pub delivery: OutboundDelivery,
    pub content: OutboundContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default)]
    pub voice_response: bool,
}

/// Mesh → assistant: a document received as a transport attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIngest {
    pub filename: String,
    pub content_base64: String,
    pub content_type: String,
    pub scope: String,
    pub sender_id: String,
}

/// Stable response envelope used on every HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// Current epoch milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_round_trips() {
        let msg = InboundMessage {
            transport: "signal".into(),
            message_id: "m-1".into(),
            sender: InboundSender {
                id: "owner".into(),
                transport_id: "+15550001111".into(),
                display_name: Some("Pat".into()),
            },
            conversation: InboundConversation {
                kind: ConversationKind::Direct,
                id: "+15550001111".into(),
            },
            priority: Priority::Normal,
            content: InboundContent {
                kind: ContentType::Text,
                text: Some("hello".into()),
                reaction: None,
                transport_native: None,
            },
            timestamp: 1_700_000_000_000,
            quote: None,
            store_only: false,
            group_names: None,
            bot_mentioned: false,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"direct\""));
        assert!(json.contains("\"type\":\"text\""));
        let back: InboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_id, "m-1");
        assert_eq!(back.conversation.kind, ConversationKind::Direct);
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = r#"{
            "transport": "signal",
            "message_id": "m-2",
            "sender": {"id": "owner", "transport_id": "+1"},
            "conversation": {"type": "group", "id": "g1"},
            "content": {"type": "reaction", "reaction": "👍"},
            "timestamp": 1
        }"#;
        let msg: InboundMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.store_only);
        assert!(!msg.bot_mentioned);
        assert_eq!(msg.priority, Priority::Normal);
        assert_eq!(msg.content.kind, ContentType::Reaction);
    }

    #[test]
    fn error_envelope_shape() {
        let resp = ApiResponse::error("unknown_sender", "sender not allowed");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], "unknown_sender");
    }
}
