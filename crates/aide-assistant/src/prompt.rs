//! Per-conversation prompt, model, context, and knowledge-scope lookup.
//!
//! Everything lives under one prompts directory:
//!
//! ```text
//! prompts/
//! ├── default.txt            default system prompt
//! ├── default.model          default model override (optional)
//! ├── default.context        default context size (optional)
//! ├── default.consolidation  default consolidation model (optional)
//! ├── users/<id>.{txt,model,context,knowledge,consolidation,fact_prompt,summary_prompt}
//! └── groups/<id>.{txt,model,context,knowledge,consolidation,fact_prompt,summary_prompt}
//! ```
//!
//! DMs resolve under `users/` by sender id; groups under `groups/` by group
//! id; both fall back to the `default.*` file and then the built-in.

use std::path::{Path, PathBuf};

use tracing::warn;

use aide_core::types::ConversationKind;
use aide_memory::consolidation::{ConsolidationPrompts, DEFAULT_FACT_PROMPT, DEFAULT_SUMMARY_PROMPT};
use aide_policy::MembershipCache;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Aide, a helpful personal AI assistant. You are \
friendly, concise, and to the point. You communicate over a phone messenger, so keep replies \
reasonably short unless asked for detail.";

/// Sanitize a conversation id for filesystem and scope use. Group ids may
/// contain base64 characters; `/`, `\` and `+` are replaced and `..`
/// sequences collapsed to defeat traversal. Empty input stays empty, which
/// downstream means "no access".
pub fn sanitize_scope(scope: &str) -> String {
    if scope.trim().is_empty() {
        return String::new();
    }
    let mut result: String = scope
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            '+' => '-',
            other => other,
        })
        .collect();
    while result.contains("..") {
        result = result.replace("..", "_");
    }
    result
}

pub struct PromptResolver {
    dir: PathBuf,
}

impl PromptResolver {
    pub fn new(dir: &str) -> Self {
        Self {
            dir: PathBuf::from(dir),
        }
    }

    fn subdir(kind: ConversationKind) -> &'static str {
        match kind {
            ConversationKind::Group => "groups",
            ConversationKind::Direct => "users",
        }
    }

    /// Lookup id: the group id for groups, the sender for DMs.
    fn lookup_id(kind: ConversationKind, conversation_id: &str, sender_id: &str) -> String {
        match kind {
            ConversationKind::Group => sanitize_scope(conversation_id),
            ConversationKind::Direct => sanitize_scope(sender_id),
        }
    }

    fn scoped_file(&self, kind: ConversationKind, id: &str, ext: &str) -> PathBuf {
        self.dir.join(Self::subdir(kind)).join(format!("{id}.{ext}"))
    }

    fn default_file(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("default.{ext}"))
    }

    /// System prompt with the full fallback chain, ending at the built-in.
    pub fn system_prompt(
        &self,
        kind: ConversationKind,
        conversation_id: &str,
        sender_id: &str,
    ) -> String {
        self.system_prompt_optional(kind, conversation_id, sender_id)
            .or_else(|| read_trimmed(&self.default_file("txt")))
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    /// Conversation-specific prompt only, no default fallback. Used when a
    /// custom model embeds its own system prompt.
    pub fn system_prompt_optional(
        &self,
        kind: ConversationKind,
        conversation_id: &str,
        sender_id: &str,
    ) -> Option<String> {
        let id = Self::lookup_id(kind, conversation_id, sender_id);
        if id.is_empty() {
            return None;
        }
        read_trimmed(&self.scoped_file(kind, &id, "txt"))
    }

    /// Model override, falling back to `default.model`, then None (= the
    /// configured backend model).
    pub fn model(
        &self,
        kind: ConversationKind,
        conversation_id: &str,
        sender_id: &str,
    ) -> Option<String> {
        let id = Self::lookup_id(kind, conversation_id, sender_id);
        read_trimmed(&self.scoped_file(kind, &id, "model"))
            .or_else(|| read_trimmed(&self.default_file("model")))
    }

    /// True when any custom model file applies; the system prompt then
    /// becomes optional.
    pub fn has_custom_model(
        &self,
        kind: ConversationKind,
        conversation_id: &str,
        sender_id: &str,
    ) -> bool {
        self.model(kind, conversation_id, sender_id).is_some()
    }

    /// Context-size override from a `.context` file holding one integer.
    pub fn context_size(
        &self,
        kind: ConversationKind,
        conversation_id: &str,
        sender_id: &str,
    ) -> Option<usize> {
        let id = Self::lookup_id(kind, conversation_id, sender_id);
        let parse = |path: &Path| -> Option<usize> {
            let raw = read_trimmed(path)?;
            match raw.parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!(path = %path.display(), "context file is not a number");
                    None
                }
            }
        };
        parse(&self.scoped_file(kind, &id, "context")).or_else(|| parse(&self.default_file("context")))
    }

    /// Knowledge scopes for a conversation: always the conversation's own
    /// sanitized scope, plus any listed in the `.knowledge` file, plus (for
    /// DMs in business mode with dm_group_knowledge on) the sender's
    /// groups from the membership cache.
    pub fn knowledge_scopes(
        &self,
        kind: ConversationKind,
        conversation_id: &str,
        sender_id: &str,
        dm_group_knowledge: bool,
        membership: &MembershipCache,
    ) -> Vec<String> {
        let own = Self::lookup_id(kind, conversation_id, sender_id);
        if own.is_empty() {
            return Vec::new();
        }

        let mut scopes = vec![own.clone()];
        let listed = read_lines(&self.scoped_file(kind, &own, "knowledge"));
        for extra in listed {
            let safe = sanitize_scope(&extra);
            if !safe.is_empty() && !scopes.contains(&safe) {
                scopes.push(safe);
            }
        }

        if kind == ConversationKind::Direct && dm_group_knowledge {
            for group_id in membership.user_groups(sender_id) {
                let safe = sanitize_scope(&group_id);
                if !safe.is_empty() && !scopes.contains(&safe) {
                    scopes.push(safe);
                }
            }
        }
        scopes
    }

    /// Consolidation prompt/model overrides for one conversation. Group ids
    /// are recognized by not starting with `+` (DM ids are phone numbers).
    pub fn consolidation_prompts(&self, conversation_id: &str) -> ConsolidationPrompts {
        let kind = if conversation_id.starts_with('+') {
            ConversationKind::Direct
        } else {
            ConversationKind::Group
        };
        let id = sanitize_scope(conversation_id);

        let fact_prompt = read_trimmed(&self.scoped_file(kind, &id, "fact_prompt"))
            .or_else(|| read_trimmed(&self.default_file("fact_prompt")))
            .unwrap_or_else(|| DEFAULT_FACT_PROMPT.to_string());
        let summary_prompt = read_trimmed(&self.scoped_file(kind, &id, "summary_prompt"))
            .or_else(|| read_trimmed(&self.default_file("summary_prompt")))
            .unwrap_or_else(|| DEFAULT_SUMMARY_PROMPT.to_string());
        let model = read_trimmed(&self.scoped_file(kind, &id, "consolidation"))
            .or_else(|| read_trimmed(&self.default_file("consolidation")));

        ConsolidationPrompts {
            fact_prompt,
            summary_prompt,
            model,
        }
    }

    /// Files the tamper check should cover: every prompt-tree file.
    pub fn tamper_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for dir in [self.dir.clone(), self.dir.join("users"), self.dir.join("groups")] {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    if entry.path().is_file() {
                        files.push(entry.path());
                    }
                }
            }
        }
        files.sort();
        files
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let trimmed = raw.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        }
        Err(_) => None,
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|raw| {
            raw.lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> (tempfile::TempDir, PromptResolver) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("users")).unwrap();
        std::fs::create_dir_all(dir.path().join("groups")).unwrap();
        let resolver = PromptResolver::new(dir.path().to_str().unwrap());
        (dir, resolver)
    }

    #[test]
    fn sanitize_replaces_dangerous_characters() {
        assert_eq!(sanitize_scope("+15550001111"), "-15550001111");
        assert_eq!(sanitize_scope("group/id+x"), "group_id-x");
        assert_eq!(sanitize_scope("a\\b"), "a_b");
        let traversal = sanitize_scope("../../etc/passwd");
        assert!(!traversal.contains("..") && !traversal.contains('/'));
        assert!(!sanitize_scope("....//x").contains(".."));
        assert_eq!(sanitize_scope("   "), "");
        assert_eq!(sanitize_scope(""), "");
    }

    #[test]
    fn prompt_fallback_chain() {
        let (dir, resolver) = resolver();
        // Nothing on disk: built-in.
        assert_eq!(
            resolver.system_prompt(ConversationKind::Direct, "+1", "+1"),
            DEFAULT_SYSTEM_PROMPT
        );
        // default.txt beats the built-in.
        std::fs::write(dir.path().join("default.txt"), "Default prompt.").unwrap();
        assert_eq!(
            resolver.system_prompt(ConversationKind::Direct, "+1", "+1"),
            "Default prompt."
        );
        // users/<id>.txt beats default.
        std::fs::write(dir.path().join("users/-1.txt"), "Personal prompt.").unwrap();
        assert_eq!(
            resolver.system_prompt(ConversationKind::Direct, "+1", "+1"),
            "Personal prompt."
        );
        // Optional lookup has no default fallback.
        assert_eq!(
            resolver.system_prompt_optional(ConversationKind::Direct, "+2", "+2"),
            None
        );
    }

    #[test]
    fn group_prompts_use_group_id() {
        let (dir, resolver) = resolver();
        std::fs::write(dir.path().join("groups/family_chat.txt"), "Family prompt.").unwrap();
        assert_eq!(
            resolver.system_prompt(ConversationKind::Group, "family/chat", "+1"),
            "Family prompt."
        );
    }

    #[test]
    fn model_and_context_overrides() {
        let (dir, resolver) = resolver();
        assert_eq!(resolver.model(ConversationKind::Direct, "+1", "+1"), None);
        std::fs::write(dir.path().join("default.model"), "llama3.1:70b\n").unwrap();
        assert_eq!(
            resolver.model(ConversationKind::Direct, "+1", "+1"),
            Some("llama3.1:70b".to_string())
        );
        std::fs::write(dir.path().join("users/-1.model"), "mistral").unwrap();
        assert_eq!(
            resolver.model(ConversationKind::Direct, "+1", "+1"),
            Some("mistral".to_string())
        );

        std::fs::write(dir.path().join("users/-1.context"), "25").unwrap();
        assert_eq!(resolver.context_size(ConversationKind::Direct, "+1", "+1"), Some(25));
        std::fs::write(dir.path().join("users/-1.context"), "not-a-number").unwrap();
        assert_eq!(resolver.context_size(ConversationKind::Direct, "+1", "+1"), None);
    }

    #[test]
    fn knowledge_scopes_always_include_own() {
        let (dir, resolver) = resolver();
        let membership = MembershipCache::new(900_000);

        let scopes = resolver.knowledge_scopes(
            ConversationKind::Direct,
            "+1",
            "+1",
            false,
            &membership,
        );
        assert_eq!(scopes, vec!["-1".to_string()]);

        std::fs::write(dir.path().join("users/-1.knowledge"), "shared-docs\n\n+2\n").unwrap();
        let scopes = resolver.knowledge_scopes(
            ConversationKind::Direct,
            "+1",
            "+1",
            false,
            &membership,
        );
        assert_eq!(scopes, vec!["-1".to_string(), "shared-docs".to_string(), "-2".to_string()]);
    }

    #[test]
    fn dm_group_knowledge_unions_membership() {
        let (_dir, resolver) = resolver();
        let membership = MembershipCache::new(900_000);
        membership.update_group("team+chat", vec!["+1".to_string()]);

        let without = resolver.knowledge_scopes(
            ConversationKind::Direct,
            "+1",
            "+1",
            false,
            &membership,
        );
        assert_eq!(without.len(), 1);

        let with = resolver.knowledge_scopes(
            ConversationKind::Direct,
            "+1",
            "+1",
            true,
            &membership,
        );
        assert!(with.contains(&"team-chat".to_string()));
    }

    #[test]
    fn empty_sender_means_no_scopes() {
        let (_dir, resolver) = resolver();
        let membership = MembershipCache::new(900_000);
        let scopes =
            resolver.knowledge_scopes(ConversationKind::Direct, "", "  ", true, &membership);
        assert!(scopes.is_empty());
    }

    #[test]
    fn consolidation_prompts_fall_back_to_builtins() {
        let (dir, resolver) = resolver();
        let prompts = resolver.consolidation_prompts("+15550001111");
        assert_eq!(prompts.fact_prompt, DEFAULT_FACT_PROMPT);
        assert_eq!(prompts.model, None);

        std::fs::write(dir.path().join("default.consolidation"), "qwen2.5:3b").unwrap();
        let prompts = resolver.consolidation_prompts("+15550001111");
        assert_eq!(prompts.model, Some("qwen2.5:3b".to_string()));
    }
}
