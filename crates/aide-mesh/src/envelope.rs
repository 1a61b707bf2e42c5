//! Normalization of transport notifications into the wire contract.
//!
//! signal-cli delivers `receive` notifications whose envelope may hold a
//! data message (text, reaction, attachments) or a receipt message. Sender
//! identity prefers the phone number over the account UUID; either form
//! appears in group membership. Duplicate envelopes (transport redelivery)
//! are dropped by message id.

use serde_json::Value;

use aide_core::types::{
    ContentType, ConversationKind, InboundContent, InboundConversation, InboundMessage,
    InboundSender, Priority, QuoteRef,
};

/// One attachment the transport stored locally.
#[derive(Debug, Clone)]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Delivery,
    Read,
    Viewed,
}

/// A normalized transport notification.
#[derive(Debug)]
pub enum TransportEvent {
    Message {
        message: InboundMessage,
        attachments: Vec<AttachmentRef>,
    },
    Receipt {
        kind: ReceiptKind,
        timestamps: Vec<i64>,
    },
    Ignored,
}

/// Identity of this bot account, for mention detection.
#[derive(Debug, Clone, Default)]
pub struct OwnIdentity {
    pub number: String,
    pub uuid: String,
}

/// Classify one `receive` notification.
pub fn classify(notification: &Value, own: &OwnIdentity) -> TransportEvent {
    if notification["method"].as_str() != Some("receive") {
        return TransportEvent::Ignored;
    }
    let envelope = &notification["params"]["envelope"];
    if envelope.is_null() {
        return TransportEvent::Ignored;
    }

    if let Some(receipt) = envelope.get("receiptMessage") {
        return classify_receipt(receipt);
    }

    let Some(data) = envelope.get("dataMessage") else {
        return TransportEvent::Ignored;
    };

    let Some(sender_id) = sender_transport_id(envelope) else {
        return TransportEvent::Ignored;
    };
    let sender_name = envelope["sourceName"].as_str().map(|s| s.to_string());
    let timestamp = data["timestamp"]
        .as_i64()
        .or_else(|| envelope["timestamp"].as_i64())
        .unwrap_or(0);

    let group_id = data["groupInfo"]["groupId"].as_str().map(|s| s.to_string());
    let conversation = match &group_id {
        Some(group_id) => InboundConversation {
            kind: ConversationKind::Group,
            id: group_id.clone(),
        },
        None => InboundConversation {
            kind: ConversationKind::Direct,
            id: sender_id.clone(),
        },
    };

    let bot_mentioned = data["mentions"]
        .as_array()
        .map(|mentions| {
            mentions.iter().any(|m| {
                let number = m["number"].as_str().unwrap_or("");
                let uuid = m["uuid"].as_str().unwrap_or("");
                (!own.number.is_empty() && number == own.number)
                    || (!own.uuid.is_empty() && uuid == own.uuid)
            })
        })
        .unwrap_or(false);

    // Quoted ids follow the same "{author}:{timestamp}" scheme our own
    // message ids use, keyed by the quoted author, not the current sender.
    let quote = data["quote"]["id"].as_i64().map(|id| {
        let author = ["authorNumber", "author", "authorUuid"]
            .iter()
            .find_map(|key| data["quote"][key].as_str().filter(|s| !s.is_empty()))
            .unwrap_or(sender_id.as_str());
        QuoteRef {
            message_id: format!("{author}:{id}"),
        }
    });

    let attachments: Vec<AttachmentRef> = data["attachments"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|a| {
                    Some(AttachmentRef {
                        id: a["id"].as_str()?.to_string(),
                        filename: a["filename"]
                            .as_str()
                            .unwrap_or("attachment")
                            .to_string(),
                        content_type: a["contentType"]
                            .as_str()
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let content = if let Some(reaction) = data.get("reaction") {
        InboundContent {
            kind: ContentType::Reaction,
            text: None,
            reaction: reaction["emoji"].as_str().map(|s| s.to_string()),
            transport_native: Some(reaction.clone()),
        }
    } else if let Some(text) = data["message"].as_str() {
        if text.is_empty() && attachments.is_empty() {
            return TransportEvent::Ignored;
        }
        InboundContent {
            kind: if text.is_empty() {
                ContentType::Attachment
            } else {
                ContentType::Text
            },
            text: (!text.is_empty()).then(|| text.to_string()),
            reaction: None,
            transport_native: None,
        }
    } else if !attachments.is_empty() {
        InboundContent {
            kind: ContentType::Attachment,
            text: None,
            reaction: None,
            transport_native: None,
        }
    } else {
        return TransportEvent::Ignored;
    };

    let message = InboundMessage {
        transport: "signal".to_string(),
        message_id: format!("{sender_id}:{timestamp}"),
        sender: InboundSender {
            id: if sender_id == own.number { "owner".into() } else { sender_id.clone() },
            transport_id: sender_id,
            display_name: sender_name,
        },
        conversation,
        priority: Priority::Normal,
        content,
        timestamp,
        quote,
        store_only: false,
        group_names: None,
        bot_mentioned,
    };

    TransportEvent::Message {
        message,
        attachments,
    }
}

fn classify_receipt(receipt: &Value) -> TransportEvent {
    let timestamps: Vec<i64> = receipt["timestamps"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default();
    if timestamps.is_empty() {
        return TransportEvent::Ignored;
    }
    let kind = if receipt["isViewed"].as_bool() == Some(true) {
        ReceiptKind::Viewed
    } else if receipt["isRead"].as_bool() == Some(true) {
        ReceiptKind::Read
    } else if receipt["isDelivery"].as_bool() == Some(true) {
        ReceiptKind::Delivery
    } else {
        return TransportEvent::Ignored;
    };
    TransportEvent::Receipt { kind, timestamps }
}

/// Phone number preferred, UUID fallback.
fn sender_transport_id(envelope: &Value) -> Option<String> {
    for key in ["sourceNumber", "source", "sourceUuid"] {
        if let Some(value) = envelope[key].as_str() {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Bounded set of recently seen message ids; transport redeliveries drop.
pub struct DedupCache {
    seen: std::sync::Mutex<std::collections::VecDeque<String>>,
    max: usize,
}

impl DedupCache {
    pub fn new(max: usize) -> Self {
        Self {
            seen: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(max)),
            max,
        }
    }

    /// True the first time an id is seen.
    pub fn insert(&self, message_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap();
        if seen.iter().any(|id| id == message_id) {
            return false;
        }
        if seen.len() >= self.max {
            seen.pop_front();
        }
        seen.push_back(message_id.to_string());
        true
    }
}
