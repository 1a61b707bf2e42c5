//! Inbound policy gate, evaluated on the mesh for every normalized envelope.
//!
//! Deny-by-default: a sender outside `allowed_senders` is dropped. Group
//! messages from allowed senders who are not configured participants of
//! that group are admitted store-only (kept for context, never answered).

use aide_core::types::{ContentType, ConversationKind, InboundMessage};

use crate::limiter::InboundLimiter;
use crate::types::PolicyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: &'static str,
    /// Store for context, do not respond.
    pub store_only: bool,
}

impl Decision {
    fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
            store_only: false,
        }
    }

    const ALLOW: Decision = Decision {
        allowed: true,
        reason: "ok",
        store_only: false,
    };

    const STORE_ONLY: Decision = Decision {
        allowed: true,
        reason: "store_only",
        store_only: true,
    };
}

pub fn evaluate_inbound(
    policy: &PolicyConfig,
    msg: &InboundMessage,
    limiter: &InboundLimiter,
    now_ms: i64,
) -> Decision {
    let sender = msg.sender.transport_id.as_str();
    if sender.is_empty() {
        return Decision::deny("invalid_sender");
    }

    if !policy.identity.allowed_senders.iter().any(|s| s == sender) {
        return Decision::deny("unknown_sender");
    }

    if msg.conversation.id.is_empty() {
        return Decision::deny("invalid_conversation");
    }

    if msg.conversation.kind == ConversationKind::Group {
        let Some(group) = policy.identity.groups.get(&msg.conversation.id) else {
            return Decision::deny("group_not_allowed");
        };
        // Allowed sender, but not a configured participant of this group:
        // keep the message for context without ever responding.
        if !group.participants.iter().any(|p| p == sender) {
            return Decision::STORE_ONLY;
        }
    }

    if let Some(decision) = validate_content(policy, msg) {
        return decision;
    }

    if (now_ms - msg.timestamp).abs() > policy.validation.max_timestamp_skew_ms {
        return Decision::deny("timestamp_out_of_window");
    }

    let limit = limiter.check_and_add(sender, now_ms);
    if !limit.allowed {
        return Decision::deny(limit.reason);
    }

    Decision::ALLOW
}

fn validate_content(policy: &PolicyConfig, msg: &InboundMessage) -> Option<Decision> {
    match msg.content.kind {
        ContentType::Text => {
            let text = msg.content.text.as_deref().unwrap_or("");
            if text.is_empty() {
                return Some(Decision::deny("invalid_text"));
            }
            if text.len() > policy.validation.max_text_length {
                return Some(Decision::deny("text_too_long"));
            }
        }
        ContentType::Reaction => {
            if msg.content.reaction.as_deref().unwrap_or("").is_empty() {
                return Some(Decision::deny("invalid_reaction"));
            }
        }
        ContentType::Attachment => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GroupConfig;
    use aide_core::types::{
        InboundContent, InboundConversation, InboundSender, Priority,
    };

    const NOW: i64 = 1_700_000_000_000;

    fn policy_with(senders: &[&str]) -> PolicyConfig {
        let mut p = PolicyConfig::default();
        p.identity.allowed_senders = senders.iter().map(|s| s.to_string()).collect();
        p
    }

    fn text_msg(sender: &str, kind: ConversationKind, convo: &str, text: &str) -> InboundMessage {
        InboundMessage {
            transport: "signal".into(),
            message_id: "m-1".into(),
            sender: InboundSender {
                id: "owner".into(),
                transport_id: sender.into(),
                display_name: None,
            },
            conversation: InboundConversation {
                kind,
                id: convo.into(),
            },
            priority: Priority::Normal,
            content: InboundContent {
                kind: ContentType::Text,
                text: Some(text.into()),
                reaction: None,
                transport_native: None,
            },
            timestamp: NOW,
            quote: None,
            store_only: false,
            group_names: None,
            bot_mentioned: false,
        }
    }

    fn limiter() -> InboundLimiter {
        InboundLimiter::new(120, 20)
    }

    #[test]
    fn unknown_sender_is_dropped() {
        let policy = policy_with(&["+10000000000"]);
        let msg = text_msg("+19990000000", ConversationKind::Direct, "+19990000000", "hi");
        let d = evaluate_inbound(&policy, &msg, &limiter(), NOW);
        assert!(!d.allowed);
        assert_eq!(d.reason, "unknown_sender");
    }

    #[test]
    fn allowed_direct_sender_passes() {
        let policy = policy_with(&["+10000000000"]);
        let msg = text_msg("+10000000000", ConversationKind::Direct, "+10000000000", "hi");
        let d = evaluate_inbound(&policy, &msg, &limiter(), NOW);
        assert!(d.allowed);
        assert!(!d.store_only);
    }

    #[test]
    fn unconfigured_group_is_dropped() {
        let policy = policy_with(&["+1"]);
        let msg = text_msg("+1", ConversationKind::Group, "group-x", "hi");
        let d = evaluate_inbound(&policy, &msg, &limiter(), NOW);
        assert_eq!(d.reason, "group_not_allowed");
    }

    #[test]
    fn non_participant_in_group_is_store_only() {
        let mut policy = policy_with(&["+1", "+2"]);
        policy.identity.groups.insert(
            "group-x".into(),
            GroupConfig {
                participants: vec!["+2".into()],
                names: vec![],
            },
        );
        let d = evaluate_inbound(
            &policy,
            &text_msg("+1", ConversationKind::Group, "group-x", "hi"),
            &limiter(),
            NOW,
        );
        assert!(d.allowed);
        assert!(d.store_only);

        let d = evaluate_inbound(
            &policy,
            &text_msg("+2", ConversationKind::Group, "group-x", "hi"),
            &limiter(),
            NOW,
        );
        assert!(d.allowed);
        assert!(!d.store_only);
    }

    #[test]
    fn oversized_text_is_rejected() {
        let policy = policy_with(&["+1"]);
        let long = "x".repeat(policy.validation.max_text_length + 1);
        let msg = text_msg("+1", ConversationKind::Direct, "+1", &long);
        let d = evaluate_inbound(&policy, &msg, &limiter(), NOW);
        assert_eq!(d.reason, "text_too_long");
    }

    #[test]
    fn empty_text_is_rejected() {
        let policy = policy_with(&["+1"]);
        let msg = text_msg("+1", ConversationKind::Direct, "+1", "");
        let d = evaluate_inbound(&policy, &msg, &limiter(), NOW);
        assert_eq!(d.reason, "invalid_text");
    }

    #[test]
    fn reaction_requires_emoji() {
        let policy = policy_with(&["+1"]);
        let mut msg = text_msg("+1", ConversationKind::Direct, "+1", "unused");
        msg.content = InboundContent {
            kind: ContentType::Reaction,
            text: None,
            reaction: None,
            transport_native: None,
        };
        let d = evaluate_inbound(&policy, &msg, &limiter(), NOW);
        assert_eq!(d.reason, "invalid_reaction");

        msg.content.reaction = Some("👍".into());
        let d = evaluate_inbound(&policy, &msg, &limiter(), NOW);
        assert!(d.allowed);
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let policy = policy_with(&["+1"]);
        let mut msg = text_msg("+1", ConversationKind::Direct, "+1", "hi");
        msg.timestamp = NOW - policy.validation.max_timestamp_skew_ms - 1;
        let d = evaluate_inbound(&policy, &msg, &limiter(), NOW);
        assert_eq!(d.reason, "timestamp_out_of_window");
    }

    #[test]
    fn rate_limit_denial_carries_window_reason() {
        let policy = policy_with(&["+1"]);
        let limiter = InboundLimiter::new(120, 2);
        let msg = text_msg("+1", ConversationKind::Direct, "+1", "hi");
        assert!(evaluate_inbound(&policy, &msg, &limiter, NOW).allowed);
        assert!(evaluate_inbound(&policy, &msg, &limiter, NOW + 1).allowed);
        let d = evaluate_inbound(&policy, &msg, &limiter, NOW + 2);
        assert_eq!(d.reason, "rate_limited_minute");
    }

    #[test]
    fn store_only_skips_rate_limit() {
        let mut policy = policy_with(&["+1"]);
        policy.identity.groups.insert(
            "g".into(),
            GroupConfig {
                participants: vec![],
                names: vec![],
            },
        );
        let limiter = InboundLimiter::new(1, 1);
        for i in 0..5 {
            let mut msg = text_msg("+1", ConversationKind::Group, "g", "hi");
            msg.timestamp = NOW + i;
            let d = evaluate_inbound(&policy, &msg, &limiter, NOW + i);
            assert!(d.allowed && d.store_only);
        }
    }
}
