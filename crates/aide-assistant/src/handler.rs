//! Inbound message pipeline: store, decide, respond.
//!
//! Every admitted message is stored (store-only ones too; they are
//! context). Responses are produced inside the priority queue so the LLM
//! handles one turn at a time globally, owner first. After each outbound
//! send the conversation is checked for compaction.

use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use aide_core::types::{
    now_ms, ContentType, ConversationKind, InboundMessage, OutboundContent, OutboundDelivery,
    OutboundMessage, OutboundRecipient, Priority,
};
use aide_llm::{ChatMessage, ChatRole};
use aide_memory::consolidation::Consolidator;
use aide_memory::types::{Direction, FactSource, NewMessage};
use aide_queue::QueueError;

use crate::app::AppState;

/// Reply shown when the LLM returns empty text, so the user is never left
/// hanging.
const EMPTY_REPLY_FALLBACK: &str = "Sorry, I lost my train of thought there. Could you say that again?";

/// Outcome of one inbound request, serialized into the response envelope.
pub enum InboundOutcome {
    Stored,
    Replied(String),
    Rejected(&'static str, String),
}

pub async fn handle_inbound(state: Arc<AppState>, msg: InboundMessage) -> InboundOutcome {
    match msg.content.kind {
        ContentType::Reaction => handle_reaction(state, msg).await,
        ContentType::Text => handle_text(state, msg).await,
        ContentType::Attachment => InboundOutcome::Rejected(
            "unsupported_content_type",
            "attachments arrive via the document ingest endpoint".to_string(),
        ),
    }
}

async fn handle_reaction(state: Arc<AppState>, msg: InboundMessage) -> InboundOutcome {
    let emoji = msg.content.reaction.clone().unwrap_or_default();
    let record = NewMessage {
        message_id: msg.message_id.clone(),
        content_type: "reaction".to_string(),
        content_text: Some(emoji.clone()),
        conversation_id: Some(msg.conversation.id.clone()),
        reply_to_id: resolve_quote(&state, &msg),
        sender_id: Some(msg.sender.transport_id.clone()),
        sender_name: msg.sender.display_name.clone(),
        timestamp: msg.timestamp,
    };
    match state.store.store_message(&record, Direction::Inbound) {
        Ok(true) => {}
        Ok(false) => {
            debug!(message_id = %msg.message_id, "duplicate reaction ignored");
            return InboundOutcome::Stored;
        }
        Err(e) => {
            warn!(message_id = %msg.message_id, error = %e, "reaction store failed");
            return InboundOutcome::Rejected("database_error", e.to_string());
        }
    }

    if msg.store_only {
        return InboundOutcome::Stored;
    }

    // A one-line acknowledgement, still serialized through the queue.
    let is_owner = msg.sender.id == "owner";
    let state_for_task = state.clone();
    let msg_for_task = msg.clone();
    let result = state
        .queue
        .enqueue(&msg.message_id, is_owner, state.enqueue_timeout(), async move {
            let name = msg_for_task
                .sender
                .display_name
                .clone()
                .unwrap_or_else(|| "the user".to_string());
            let prompt = format!(
                "{name} reacted with {emoji} to one of your messages. Reply with one very short, \
                 natural acknowledgement. No quotes, no explanations."
            );
            let text = match state_for_task.llm.generate(&prompt, None, None).await {
                Ok(r) if !r.text.trim().is_empty() => r.text.trim().to_string(),
                Ok(_) => format!("{emoji} noted!"),
                Err(e) => return Err(QueueError::Handler(e.code())),
            };
            deliver_reply(&state_for_task, &msg_for_task, &text).await?;
            Ok(text)
        })
        .await;

    match result {
        Ok(text) => InboundOutcome::Replied(text),
        Err(e) => InboundOutcome::Rejected("queue_error", e.to_string()),
    }
}

async fn handle_text(state: Arc<AppState>, msg: InboundMessage) -> InboundOutcome {
    let text = msg.content.text.clone().unwrap_or_default();
    if text.trim().is_empty() {
        return InboundOutcome::Rejected("invalid_text", "text content required".to_string());
    }

    // Stored unconditionally; store-only messages feed future context.
    let record = NewMessage {
        message_id: msg.message_id.clone(),
        content_type: "text".to_string(),
        content_text: Some(text.clone()),
        conversation_id: Some(msg.conversation.id.clone()),
        reply_to_id: resolve_quote(&state, &msg),
        sender_id: Some(msg.sender.transport_id.clone()),
        sender_name: msg.sender.display_name.clone(),
        timestamp: msg.timestamp,
    };
    match state.store.store_message(&record, Direction::Inbound) {
        Ok(false) => {
            // Duplicate delivery: exactly one stored row, one response.
            debug!(message_id = %msg.message_id, "duplicate inbound ignored");
            return InboundOutcome::Stored;
        }
        Ok(true) => {}
        Err(e) => return InboundOutcome::Rejected("database_error", e.to_string()),
    }

    if msg.store_only {
        return InboundOutcome::Stored;
    }

    // Explicit "remember ..." requests become high-confidence stated facts.
    if let Some(fact_text) = detect_remember(&text) {
        store_stated_fact(&state, &msg, &fact_text).await;
    }

    if !should_respond(&state, &msg, &text) {
        return InboundOutcome::Stored;
    }

    let is_owner = msg.sender.id == "owner";
    let state_for_task = state.clone();
    let msg_for_task = msg.clone();
    let result = state
        .queue
        .enqueue(&msg.message_id, is_owner, state.enqueue_timeout(), async move {
            respond_turn(state_for_task, msg_for_task).await
        })
        .await;

    match result {
        Ok(text) => InboundOutcome::Replied(text),
        Err(QueueError::Timeout) => {
            InboundOutcome::Rejected("queue_timeout", "response timed out".to_string())
        }
        Err(e) => InboundOutcome::Rejected("queue_error", e.to_string()),
    }
}

/// One full LLM turn, executed by the queue worker.
async fn respond_turn(state: Arc<AppState>, msg: InboundMessage) -> Result<String, QueueError> {
    let conversation_id = msg.conversation.id.clone();
    let kind = msg.conversation.kind;
    let sender_id = msg.sender.transport_id.clone();
    let is_group = kind == ConversationKind::Group;

    let context_size = state
        .prompts
        .context_size(kind, &conversation_id, &sender_id)
        .unwrap_or(state.config.memory.context_messages);

    let history = state
        .store
        .recent_messages(&conversation_id, context_size)
        .map_err(|e| QueueError::Handler(e.to_string()))?;

    let mut messages = Vec::with_capacity(history.len());
    for entry in &history {
        let content = entry.content_text.clone().unwrap_or_default();
        match entry.direction {
            Direction::Outbound => messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content,
            }),
            Direction::Inbound => {
                // In groups, keep speakers apart for the model.
                let content = if is_group {
                    let name = entry
                        .sender_name
                        .clone()
                        .or_else(|| entry.sender_id.clone())
                        .unwrap_or_else(|| "Someone".to_string());
                    format!("[{name}]: {content}")
                } else {
                    content
                };
                messages.push(ChatMessage {
                    role: ChatRole::User,
                    content,
                });
            }
        }
    }

    let model_override = state.prompts.model(kind, &conversation_id, &sender_id);
    let system = build_system_prompt(&state, &msg, model_override.is_some());

    let response = state
        .llm
        .chat(&messages, system.as_deref(), model_override.as_deref())
        .await
        .map_err(|e| QueueError::Handler(e.code()))?;

    let reply = {
        let trimmed = response.text.trim();
        if trimmed.is_empty() {
            EMPTY_REPLY_FALLBACK.to_string()
        } else {
            trimmed.to_string()
        }
    };

    deliver_reply(&state, &msg, &reply).await?;

    Ok(reply)
}

/// Send a reply through the mesh, respecting the outbound limiter and the
/// per-conversation cooldown, then store the outbound message and run the
/// conversation's compaction check. Every outbound send goes through here,
/// and always on the queue worker, so compaction's LLM calls stay
/// serialized too.
async fn deliver_reply(
    state: &AppState,
    inbound: &InboundMessage,
    text: &str,
) -> Result<(), QueueError> {
    let is_group = inbound.conversation.kind == ConversationKind::Group;
    let critical = inbound.priority == Priority::Critical;

    if state.policy.is_kill_switch_active() {
        warn!("kill switch active, refusing outbound send");
        return Err(QueueError::Handler("kill_switch_active".to_string()));
    }

    if !state.out_limiter.check_and_add("outbound", critical, false, now_ms()) {
        warn!(conversation = %inbound.conversation.id, "outbound limit reached, reply dropped");
        return Err(QueueError::Handler("rate_limited_hour".to_string()));
    }

    let outbound = OutboundMessage {
        transport: "signal".to_string(),
        recipient: OutboundRecipient {
            id: inbound.sender.id.clone(),
            transport_id: inbound.sender.transport_id.clone(),
        },
        priority: inbound.priority,
        delivery: OutboundDelivery {
            target: inbound.conversation.kind,
            group_id: is_group.then(|| inbound.conversation.id.clone()),
        },
        content: OutboundContent {
            kind: ContentType::Text,
            text: text.to_string(),
        },
        reply_to: Some(inbound.message_id.clone()),
        escalated: false,
        voice_response: false,
    };

    let sent = state
        .cooldown
        .pace(&inbound.conversation.id, is_group, async {
            state.mesh.send_message(&outbound, &state.secrets).await
        })
        .await;
    if let Err(e) = sent {
        return Err(QueueError::Handler(e.to_string()));
    }

    let record = NewMessage {
        message_id: format!("out-{}", uuid::Uuid::new_v4()),
        content_type: "text".to_string(),
        content_text: Some(text.to_string()),
        conversation_id: Some(inbound.conversation.id.clone()),
        reply_to_id: Some(inbound.message_id.clone()),
        sender_id: None,
        sender_name: None,
        timestamp: now_ms(),
    };
    if let Err(e) = state.store.store_message(&record, Direction::Outbound) {
        warn!(error = %e, "outbound store failed");
    }
    info!(conversation = %inbound.conversation.id, chars = text.len(), "reply sent");

    let conversation_id = &inbound.conversation.id;
    let prompts = state.prompts.consolidation_prompts(conversation_id);
    let consolidator = Consolidator::new(
        &state.store,
        state.llm.as_ref(),
        &state.policy.bot_name(),
        state.config.compaction.context_messages,
        state.config.compaction.batch_size,
        state.config.compaction.archive,
    );
    let outcome = consolidator
        .run_for_conversation(conversation_id, &prompts)
        .await;
    if outcome.ran {
        let _ = state.store.set_state("last_consolidation_at", &now_ms().to_string());
    }
    Ok(())
}

/// A quote may reference a message we never stored (pre-history, or a
/// compacted one); only keep the back-reference when the target exists.
fn resolve_quote(state: &AppState, msg: &InboundMessage) -> Option<String> {
    let quoted = msg.quote.as_ref()?.message_id.clone();
    match state.store.get_message(&quoted) {
        Ok(Some(_)) => Some(quoted),
        _ => None,
    }
}

/// Group messages only get a reply when the bot is addressed: a structured
/// mention from the transport, or an `@<name>` match in the text against
/// the configured group names or the bot name.
fn should_respond(state: &AppState, msg: &InboundMessage, text: &str) -> bool {
    if msg.conversation.kind == ConversationKind::Direct {
        return true;
    }
    if msg.bot_mentioned {
        return true;
    }

    let mut names: Vec<String> = msg.group_names.clone().unwrap_or_default();
    let policy = state.policy.config();
    if let Some(group) = policy.identity.groups.get(&msg.conversation.id) {
        names.extend(group.names.iter().cloned());
    }
    names.push(policy.identity.bot_name.clone());
    text_mentions_name(text, &names)
}

fn text_mentions_name(text: &str, names: &[String]) -> bool {
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let pattern = format!(r"(?i)(?:^|\s)@{}\b", regex::escape(name));
        if Regex::new(&pattern).map(|re| re.is_match(text)).unwrap_or(false) {
            return true;
        }
    }
    false
}

/// Detect explicit remember requests; returns the fact text.
pub fn detect_remember(text: &str) -> Option<String> {
    let re = Regex::new(
        r"(?i)^\s*(?:please\s+)?remember(?:\s+that)?[:,]?\s+(?P<fact>(?:i|my|i'm|im|we|our)\b.+)$",
    )
    .ok()?;
    re.captures(text.trim())
        .and_then(|c| c.name("fact"))
        .map(|m| m.as_str().trim().to_string())
        .filter(|f| f.len() >= 3)
}

/// Ask the LLM to structure a stated fact; fall back to a raw note when the
/// JSON does not parse. Stored at confidence 0.95, source `stated`.
async fn store_stated_fact(state: &AppState, msg: &InboundMessage, fact_text: &str) {
    let name = msg
        .sender
        .display_name
        .clone()
        .unwrap_or_else(|| msg.sender.transport_id.clone());
    let prompt = format!(
        "{name} asked you to remember: \"{fact_text}\"\n\n\
         Return ONLY a JSON object with fields \"category\" (one of: personal, preference, work, \
         health, skill, goal, routine, opinion, event, technical), \"key\" (short snake_case \
         identifier), and \"value\" (the fact as a complete sentence containing {name}'s name)."
    );

    let structured = match state.llm.generate(&prompt, None, None).await {
        Ok(r) => parse_fact_object(&r.text),
        Err(e) => {
            warn!(error = %e, "stated-fact structuring call failed");
            None
        }
    };

    let (category, key, value) = structured.unwrap_or_else(|| {
        let key: String = fact_text
            .split_whitespace()
            .take(4)
            .collect::<Vec<_>>()
            .join("_")
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .take(40)
            .collect();
        ("personal".to_string(), key, format!("{name} said: {fact_text}"))
    });

    match state.store.store_fact(
        &msg.conversation.id,
        &category,
        &key,
        &value,
        0.95,
        FactSource::Stated,
    ) {
        Ok(_) => info!(conversation = %msg.conversation.id, key, "stated fact stored"),
        Err(e) => warn!(error = %e, "stated fact store failed"),
    }
}

/// Parse a `{category, key, value}` object, tolerating surrounding prose.
fn parse_fact_object(response: &str) -> Option<(String, String, String)> {
    let trimmed = response.trim();
    let candidate = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end <= start {
            return None;
        }
        trimmed[start..=end].to_string()
    };
    let value: Value = serde_json::from_str(&candidate).ok()?;
    let category = value.get("category")?.as_str()?.trim().to_string();
    let key = value.get("key")?.as_str()?.trim().to_string();
    let fact = value.get("value")?.as_str()?.trim().to_string();
    (!category.is_empty() && !key.is_empty() && !fact.is_empty())
        .then_some((category, key, fact))
}

/// Assemble the enriched system prompt: base prompt (optional when a custom
/// model carries its own), facts, summaries, RAG context, current datetime.
/// Returns None when there is nothing at all to send.
fn build_system_prompt(
    state: &AppState,
    msg: &InboundMessage,
    has_custom_model: bool,
) -> Option<String> {
    let kind = msg.conversation.kind;
    let conversation_id = &msg.conversation.id;
    let sender_id = &msg.sender.transport_id;
    let query = msg.content.text.as_deref().unwrap_or("");

    let base = if has_custom_model {
        state
            .prompts
            .system_prompt_optional(kind, conversation_id, sender_id)
    } else {
        Some(state.prompts.system_prompt(kind, conversation_id, sender_id))
    };

    let mut sections: Vec<String> = Vec::new();
    if let Some(base) = base {
        sections.push(base);
    }

    if let Ok(facts) = state.store.facts_as_text(conversation_id, 0.5) {
        if !facts.is_empty() {
            sections.push(facts);
        }
    }
    if let Ok(summaries) = state.store.summaries_as_text(conversation_id, 7) {
        if !summaries.is_empty() {
            sections.push(summaries);
        }
    }

    let scopes = state.prompts.knowledge_scopes(
        kind,
        conversation_id,
        sender_id,
        state.policy.dm_group_knowledge_enabled(),
        &state.membership,
    );
    if let Ok(knowledge) = state.store.knowledge_as_context(query, Some(&scopes), 4000) {
        if !knowledge.is_empty() {
            sections.push(knowledge);
        }
    }

    if state.config.prompts.time_awareness {
        sections.push(format!(
            "Current date and time: {}",
            chrono::Local::now().format("%A, %Y-%m-%d %H:%M")
        ));
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_patterns_are_detected() {
        assert_eq!(
            detect_remember("Remember that I am allergic to peanuts"),
            Some("I am allergic to peanuts".to_string())
        );
        assert_eq!(
            detect_remember("please remember my birthday is in June"),
            Some("my birthday is in June".to_string())
        );
        assert_eq!(
            detect_remember("remember: I'm moving next month"),
            Some("I'm moving next month".to_string())
        );
        assert!(detect_remember("I remember the old days").is_none());
        assert!(detect_remember("can you look this up").is_none());
        // Must be about the speaker, not a bare imperative.
        assert!(detect_remember("remember the milk").is_none());
    }

    #[test]
    fn mention_matching_is_case_insensitive_and_bounded() {
        let names = vec!["Aide".to_string()];
        assert!(text_mentions_name("hey @aide what's up", &names));
        assert!(text_mentions_name("@Aide ping", &names));
        assert!(!text_mentions_name("email me at x@aide.example.com", &names));
        assert!(!text_mentions_name("plain aide without the at sign", &names));
        assert!(!text_mentions_name("@aidenotreally", &names));
    }

    #[test]
    fn fact_object_parses_with_and_without_prose() {
        let parsed = parse_fact_object(
            r#"{"category":"health","key":"allergy","value":"Pat is allergic to peanuts"}"#,
        );
        assert_eq!(
            parsed,
            Some((
                "health".to_string(),
                "allergy".to_string(),
                "Pat is allergic to peanuts".to_string()
            ))
        );
        let parsed = parse_fact_object(
            "Sure, here you go: {\"category\":\"goal\",\"key\":\"move\",\"value\":\"Pat moves in June\"} done!",
        );
        assert!(parsed.is_some());
        assert!(parse_fact_object("no json here at all").is_none());
        assert!(parse_fact_object(r#"{"category":"","key":"x","value":"y"}"#).is_none());
    }
}
