use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::db;
use crate::error::Result;
use crate::types::*;

/// Maximum tokens fed into an FTS expression.
const MAX_FTS_TOKENS: usize = 20;

/// The assistant's single persistent store.
///
/// One mutexed connection per process; every operation is a short
/// transaction. The assistant is the only writer; the mesh never opens
/// this file.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    encrypted: bool,
}

impl MemoryStore {
    pub fn open(db_path: &str, key_file: &str, require_encrypted: bool) -> Result<Self> {
        let (conn, encrypted) = db::open(db_path, key_file, require_encrypted)?;
        Ok(Self {
            conn: Mutex::new(conn),
            encrypted,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(crate::db::SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            encrypted: false,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    // --- messages -----------------------------------------------------------

    /// Store a message. Duplicate `message_id`s are ignored, which makes
    /// double delivery idempotent. Returns true when a row was inserted.
    pub fn store_message(&self, msg: &NewMessage, direction: Direction) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages (
                message_id, direction, content_type, content_text,
                conversation_id, reply_to_id, sender_id, sender_name,
                timestamp, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                msg.message_id,
                direction.to_string(),
                msg.content_type,
                msg.content_text,
                msg.conversation_id,
                msg.reply_to_id,
                msg.sender_id,
                msg.sender_name,
                msg.timestamp,
                now,
            ],
        )?;

        if direction == Direction::Inbound && inserted > 0 {
            set_state_on(&conn, "last_interaction_at", &now.to_string())?;
        }
        debug!(message_id = %msg.message_id, %direction, inserted, "message stored");
        Ok(inserted > 0)
    }

    /// Most recent unarchived text messages, oldest first, for prompt context.
    pub fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, direction, content_type, content_text,
                    conversation_id, reply_to_id, sender_id, sender_name,
                    timestamp, created_at, archived
             FROM messages
             WHERE content_type = 'text' AND conversation_id = ?1 AND archived = 0
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let mut messages: Vec<StoredMessage> = stmt
            .query_map(params![conversation_id, limit], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        messages.reverse();
        Ok(messages)
    }

    /// Oldest unarchived text messages, for compaction.
    pub fn oldest_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, direction, content_type, content_text,
                    conversation_id, reply_to_id, sender_id, sender_name,
                    timestamp, created_at, archived
             FROM messages
             WHERE content_type = 'text' AND conversation_id = ?1 AND archived = 0
             ORDER BY timestamp ASC
             LIMIT ?2",
        )?;
        let messages = stmt
            .query_map(params![conversation_id, limit], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(messages)
    }

    /// Unarchived text-message count for a conversation (the compaction
    /// trigger input).
    pub fn message_count(&self, conversation_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?1 AND content_type = 'text' AND archived = 0",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn distinct_conversation_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id FROM messages
             WHERE conversation_id IS NOT NULL AND conversation_id != ''
                   AND archived = 0 AND content_type = 'text'
             GROUP BY conversation_id
             ORDER BY MAX(timestamp) DESC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, direction, content_type, content_text,
                    conversation_id, reply_to_id, sender_id, sender_name,
                    timestamp, created_at, archived
             FROM messages WHERE message_id = ?1",
        )?;
        let mut rows = stmt
            .query_map([message_id], row_to_message)?
            .filter_map(|r| r.ok());
        Ok(rows.next())
    }

    /// Hard-delete messages by message_id. Dangling `reply_to_id` references
    /// from surviving rows are nulled first so the graph stays consistent.
    pub fn delete_messages_by_ids(&self, message_ids: &[String]) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; message_ids.len()].join(",");
        let params = rusqlite::params_from_iter(message_ids.iter());

        conn.execute(
            &format!("UPDATE messages SET reply_to_id = NULL WHERE reply_to_id IN ({placeholders})"),
            rusqlite::params_from_iter(message_ids.iter()),
        )?;
        let deleted = conn.execute(
            &format!("DELETE FROM messages WHERE message_id IN ({placeholders})"),
            params,
        )?;
        if deleted > 0 {
            info!(deleted, "messages deleted by id");
        }
        Ok(deleted)
    }

    /// Soft-delete (archive) messages by message_id.
    pub fn archive_messages_by_ids(&self, message_ids: &[String]) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; message_ids.len()].join(",");
        let archived = conn.execute(
            &format!("UPDATE messages SET archived = 1 WHERE message_id IN ({placeholders})"),
            rusqlite::params_from_iter(message_ids.iter()),
        )?;
        if archived > 0 {
            info!(archived, "messages archived by id");
        }
        Ok(archived)
    }

    // --- system state -------------------------------------------------------

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM system_state WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .ok();
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        set_state_on(&conn, key, value)
    }

    pub fn last_interaction_ms(&self) -> Result<i64> {
        Ok(self
            .get_state("last_interaction_at")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    // --- user facts ---------------------------------------------------------

    /// Store or refresh a fact. The UPSERT key is
    /// (conversation_id, category, key, active=1); updates bump
    /// `updated_at` and `last_verified_at`.
    pub fn store_fact(
        &self,
        conversation_id: &str,
        category: &str,
        key: &str,
        value: &str,
        confidence: f64,
        source: FactSource,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        let updated = conn.execute(
            "UPDATE user_facts
             SET value = ?1, confidence = ?2, source = ?3,
                 last_verified_at = ?4, updated_at = ?4
             WHERE conversation_id = ?5 AND category = ?6 AND key = ?7 AND active = 1",
            params![value, confidence, source.to_string(), now, conversation_id, category, key],
        )?;

        if updated == 0 {
            conn.execute(
                "INSERT INTO user_facts (
                    conversation_id, category, key, value, confidence, source,
                    learned_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![conversation_id, category, key, value, confidence, source.to_string(), now],
            )?;
        }
        debug!(conversation_id, category, key, confidence, "fact stored");
        Ok(conn.last_insert_rowid())
    }

    pub fn get_facts(
        &self,
        conversation_id: &str,
        min_confidence: f64,
        limit: usize,
    ) -> Result<Vec<UserFact>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, category, key, value, confidence, source,
                    learned_at, last_verified_at
             FROM user_facts
             WHERE active = 1 AND confidence >= ?1 AND conversation_id = ?2
             ORDER BY category, confidence DESC
             LIMIT ?3",
        )?;
        let facts = stmt
            .query_map(params![min_confidence, conversation_id, limit], row_to_fact)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(facts)
    }

    /// All facts for a conversation rendered as a prompt block, grouped by
    /// category. Empty string when nothing is known.
    pub fn facts_as_text(&self, conversation_id: &str, min_confidence: f64) -> Result<String> {
        let facts = self.get_facts(conversation_id, min_confidence, 50)?;
        if facts.is_empty() {
            return Ok(String::new());
        }
        let mut lines = vec!["Known facts about the user:".to_string()];
        let mut current_category = String::new();
        for fact in &facts {
            if fact.category != current_category {
                lines.push(format!("\n{}:", capitalize(&fact.category)));
                current_category = fact.category.clone();
            }
            lines.push(format!("  - {}: {}", fact.key, fact.value));
        }
        Ok(lines.join("\n"))
    }

    /// BM25 fact search, capped to a character budget, for RAG context.
    pub fn facts_as_context(
        &self,
        query: &str,
        conversation_id: &str,
        max_chars: usize,
    ) -> Result<String> {
        let Some(fts) = fts_expression(query) else {
            return Ok(String::new());
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(
            "SELECT f.id, f.conversation_id, f.category, f.key, f.value, f.confidence,
                    f.source, f.learned_at, f.last_verified_at
             FROM user_facts f
             JOIN user_facts_fts fts ON f.id = fts.rowid
             WHERE user_facts_fts MATCH ?1
               AND f.active = 1 AND f.confidence >= 0.6 AND f.conversation_id = ?2
             ORDER BY bm25(user_facts_fts)
             LIMIT 20",
        ) {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!(error = %e, "facts FTS prepare failed");
                return Ok(String::new());
            }
        };
        let facts: Vec<UserFact> = match stmt.query_map(params![fts, conversation_id], row_to_fact)
        {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(e) => {
                warn!(error = %e, "facts FTS search failed");
                return Ok(String::new());
            }
        };
        if facts.is_empty() {
            return Ok(String::new());
        }

        let mut out = String::from("Relevant facts about the user:");
        for fact in &facts {
            let line = format!("\n  - {}: {}", fact.key, fact.value);
            if out.len() + line.len() > max_chars {
                break;
            }
            out.push_str(&line);
        }
        Ok(out)
    }

    // --- summaries ----------------------------------------------------------

    pub fn store_summary(
        &self,
        conversation_id: &str,
        summary_type: &str,
        period_start: i64,
        period_end: i64,
        summary_text: &str,
        message_count: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO context_summaries (
                conversation_id, summary_type, period_start, period_end,
                summary_text, message_count, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation_id,
                summary_type,
                period_start,
                period_end,
                summary_text,
                message_count,
                now_ms(),
            ],
        )?;
        info!(conversation_id, period_start, period_end, message_count, "summary stored");
        Ok(conn.last_insert_rowid())
    }

    /// Summaries whose period ended within the last `days`, newest first.
    pub fn recent_summaries(
        &self,
        conversation_id: &str,
        days: i64,
        limit: usize,
    ) -> Result<Vec<ContextSummary>> {
        let cutoff = now_ms() - days * 24 * 60 * 60 * 1000;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, summary_type, period_start, period_end,
                    summary_text, message_count, created_at
             FROM context_summaries
             WHERE conversation_id = ?1 AND period_end > ?2
             ORDER BY period_end DESC
             LIMIT ?3",
        )?;
        let summaries = stmt
            .query_map(params![conversation_id, cutoff, limit], row_to_summary)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(summaries)
    }

    /// Recent summaries rendered as a prompt block, oldest first with a
    /// date header per period.
    pub fn summaries_as_text(&self, conversation_id: &str, days: i64) -> Result<String> {
        let summaries = self.recent_summaries(conversation_id, days, 10)?;
        if summaries.is_empty() {
            return Ok(String::new());
        }
        let mut lines = vec!["Earlier in this conversation (already discussed):".to_string()];
        for summary in summaries.iter().rev() {
            lines.push(format!("\n[{}]", format_day(summary.period_end)));
            lines.push(summary.summary_text.clone());
        }
        Ok(lines.join("\n"))
    }

    pub fn summary_count(&self, conversation_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM context_summaries WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // --- knowledge (RAG) ----------------------------------------------------

    pub fn store_knowledge_chunk(
        &self,
        scope: &str,
        source: &str,
        title: &str,
        content: &str,
        chunk_index: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO knowledge_chunks (
                scope, source, title, content, chunk_index, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![scope, source, title, content, chunk_index, now_ms()],
        )?;
        debug!(scope, source, chunk_index, "knowledge chunk stored");
        Ok(conn.last_insert_rowid())
    }

    /// Scoped full-text search over the knowledge index.
    ///
    /// `scopes = None` applies no filter (admin path only). An empty scope
    /// set returns nothing, access never degrades to global. FTS syntax
    /// errors are logged and yield an empty result.
    pub fn search_knowledge(
        &self,
        query: &str,
        limit: usize,
        scopes: Option<&[String]>,
    ) -> Result<Vec<KnowledgeChunk>> {
        let Some(fts) = fts_expression(query) else {
            return Ok(Vec::new());
        };
        if let Some(scopes) = scopes {
            if scopes.is_empty() {
                return Ok(Vec::new());
            }
        }

        let conn = self.conn.lock().unwrap();
        let (scope_filter, mut params_vec): (String, Vec<Box<dyn rusqlite::types::ToSql>>) =
            match scopes {
                None => (String::new(), vec![Box::new(fts.clone())]),
                Some(scopes) => {
                    let placeholders = vec!["?"; scopes.len()].join(",");
                    let mut p: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(fts.clone())];
                    for scope in scopes {
                        p.push(Box::new(scope.clone()));
                    }
                    (format!("AND k.scope IN ({placeholders})"), p)
                }
            };
        params_vec.push(Box::new(limit as i64));

        let sql = format!(
            "SELECT k.id, k.scope, k.source, k.title, k.content, k.chunk_index, k.created_at
             FROM knowledge_chunks k
             JOIN knowledge_fts f ON k.id = f.rowid
             WHERE knowledge_fts MATCH ?
             {scope_filter}
             ORDER BY bm25(knowledge_fts)
             LIMIT ?",
        );

        let mut stmt = match conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!(error = %e, "knowledge FTS prepare failed");
                return Ok(Vec::new());
            }
        };
        let rows = stmt.query_map(
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            row_to_chunk,
        );
        match rows {
            Ok(rows) => Ok(rows.filter_map(|r| r.ok()).collect()),
            Err(e) => {
                warn!(error = %e, query = %fts, "knowledge FTS search failed");
                Ok(Vec::new())
            }
        }
    }

    /// Knowledge search rendered as a prompt block within a char budget.
    pub fn knowledge_as_context(
        &self,
        query: &str,
        scopes: Option<&[String]>,
        max_chars: usize,
    ) -> Result<String> {
        let chunks = self.search_knowledge(query, 10, scopes)?;
        if chunks.is_empty() {
            return Ok(String::new());
        }
        let mut out = String::from("Relevant knowledge:");
        for chunk in &chunks {
            let block = format!("\n[{}]\n{}", chunk.title, chunk.content);
            if out.len() + block.len() > max_chars {
                break;
            }
            out.push_str(&block);
        }
        Ok(out)
    }

    /// Drop every chunk of a (scope, source) pair before re-ingestion.
    pub fn delete_knowledge_source(&self, scope: &str, source: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM knowledge_chunks WHERE scope = ?1 AND source = ?2",
            params![scope, source],
        )?;
        if deleted > 0 {
            info!(scope, source, deleted, "knowledge source replaced");
        }
        Ok(deleted)
    }

    pub fn knowledge_sources(&self) -> Result<Vec<KnowledgeSource>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT scope, source, COUNT(*), MAX(created_at)
             FROM knowledge_chunks
             GROUP BY scope, source
             ORDER BY scope, source",
        )?;
        let sources = stmt
            .query_map([], |row| {
                Ok(KnowledgeSource {
                    scope: row.get(0)?,
                    source: row.get(1)?,
                    chunk_count: row.get(2)?,
                    last_updated: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(sources)
    }

    pub fn rescope_knowledge(&self, old_scope: &str, new_scope: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE knowledge_chunks SET scope = ?1 WHERE scope = ?2",
            params![new_scope, old_scope],
        )?;
        if updated > 0 {
            info!(old_scope, new_scope, updated, "knowledge rescoped");
        }
        Ok(updated)
    }
}

// --- helpers ----------------------------------------------------------------

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn format_day(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn set_state_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO system_state (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
        params![key, value, now_ms()],
    )?;
    Ok(())
}

/// Build a disjunctive FTS5 expression from free text: word characters
/// only, each token quoted, capped. Returns None for token-free input.
fn fts_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .take(MAX_FTS_TOKENS)
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().to_string() + chars.as_str(),
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let direction: String = row.get(2)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        direction: direction.parse().unwrap_or(Direction::Inbound),
        content_type: row.get(3)?,
        content_text: row.get(4)?,
        conversation_id: row.get(5)?,
        reply_to_id: row.get(6)?,
        sender_id: row.get(7)?,
        sender_name: row.get(8)?,
        timestamp: row.get(9)?,
        created_at: row.get(10)?,
        archived: row.get::<_, i64>(11)? != 0,
    })
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserFact> {
    let source: String = row.get(6)?;
    Ok(UserFact {
        id: row.get(0)?,
        conversation_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        category: row.get(2)?,
        key: row.get(3)?,
        value: row.get(4)?,
        confidence: row.get(5)?,
        source: source.parse().unwrap_or(FactSource::Inferred),
        learned_at: row.get(7)?,
        last_verified_at: row.get(8)?,
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextSummary> {
    Ok(ContextSummary {
        id: row.get(0)?,
        conversation_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        summary_type: row.get(2)?,
        period_start: row.get(3)?,
        period_end: row.get(4)?,
        summary_text: row.get(5)?,
        message_count: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
        created_at: row.get(7)?,
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeChunk> {
    Ok(KnowledgeChunk {
        id: row.get(0)?,
        scope: row.get(1)?,
        source: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        chunk_index: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    fn text_message(id: &str, convo: &str, ts: i64) -> NewMessage {
        NewMessage {
            message_id: id.to_string(),
            content_type: "text".to_string(),
            content_text: Some(format!("message {id}")),
            conversation_id: Some(convo.to_string()),
            reply_to_id: None,
            sender_id: Some("+15550001111".to_string()),
            sender_name: Some("Pat".to_string()),
            timestamp: ts,
        }
    }

    #[test]
    fn duplicate_message_id_is_ignored() {
        let store = store();
        let msg = text_message("m-1", "+1", 1000);
        assert!(store.store_message(&msg, Direction::Inbound).unwrap());
        assert!(!store.store_message(&msg, Direction::Inbound).unwrap());
        assert_eq!(store.message_count("+1").unwrap(), 1);
    }

    #[test]
    fn recent_messages_are_oldest_first_and_capped() {
        let store = store();
        for i in 0..10 {
            store
                .store_message(&text_message(&format!("m-{i}"), "+1", 1000 + i), Direction::Inbound)
                .unwrap();
        }
        let recent = store.recent_messages("+1", 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message_id, "m-7");
        assert_eq!(recent[2].message_id, "m-9");
    }

    #[test]
    fn delete_by_ids_nulls_dangling_replies() {
        let store = store();
        store
            .store_message(&text_message("m-1", "+1", 1000), Direction::Inbound)
            .unwrap();
        let mut reply = text_message("m-2", "+1", 2000);
        reply.reply_to_id = Some("m-1".to_string());
        store.store_message(&reply, Direction::Inbound).unwrap();

        let deleted = store.delete_messages_by_ids(&["m-1".to_string()]).unwrap();
        assert_eq!(deleted, 1);

        let survivor = store.get_message("m-2").unwrap().unwrap();
        assert_eq!(survivor.reply_to_id, None);
        assert_eq!(store.message_count("+1").unwrap(), 1);
    }

    #[test]
    fn archive_hides_from_counts_and_context() {
        let store = store();
        store
            .store_message(&text_message("m-1", "+1", 1000), Direction::Inbound)
            .unwrap();
        store.archive_messages_by_ids(&["m-1".to_string()]).unwrap();
        assert_eq!(store.message_count("+1").unwrap(), 0);
        assert!(store.recent_messages("+1", 10).unwrap().is_empty());
    }

    #[test]
    fn fact_upsert_updates_in_place() {
        let store = store();
        store
            .store_fact("+1", "preference", "coffee", "Pat prefers black coffee", 0.8, FactSource::Inferred)
            .unwrap();
        store
            .store_fact("+1", "preference", "coffee", "Pat now drinks espresso", 0.9, FactSource::Stated)
            .unwrap();

        let facts = store.get_facts("+1", 0.0, 10).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, "Pat now drinks espresso");
        assert_eq!(facts[0].source, FactSource::Stated);
        assert!(facts[0].last_verified_at.is_some());
    }

    #[test]
    fn facts_are_scoped_per_conversation() {
        let store = store();
        store
            .store_fact("+1", "personal", "name", "Pat lives in Oslo", 0.9, FactSource::Inferred)
            .unwrap();
        assert_eq!(store.get_facts("+2", 0.0, 10).unwrap().len(), 0);
        assert_eq!(store.get_facts("+1", 0.0, 10).unwrap().len(), 1);
    }

    #[test]
    fn facts_as_text_groups_by_category() {
        let store = store();
        store
            .store_fact("+1", "work", "profession", "Pat is a nurse", 0.9, FactSource::Inferred)
            .unwrap();
        store
            .store_fact("+1", "personal", "city", "Pat lives in Oslo", 0.9, FactSource::Inferred)
            .unwrap();
        let text = store.facts_as_text("+1", 0.5).unwrap();
        assert!(text.contains("Known facts about the user:"));
        assert!(text.contains("Personal:"));
        assert!(text.contains("Work:"));
        assert!(text.contains("Pat is a nurse"));
    }

    #[test]
    fn summaries_query_by_period_end() {
        let store = store();
        let now = now_ms();
        store
            .store_summary("+1", "conversation", now - 1000, now - 500, "Old chat about plants.", 10)
            .unwrap();
        let summaries = store.recent_summaries("+1", 7, 10).unwrap();
        assert_eq!(summaries.len(), 1);
        let text = store.summaries_as_text("+1", 7).unwrap();
        assert!(text.contains("Old chat about plants."));
        // A different conversation sees nothing.
        assert!(store.summaries_as_text("+2", 7).unwrap().is_empty());
    }

    #[test]
    fn knowledge_search_respects_scopes() {
        let store = store();
        store
            .store_knowledge_chunk("+A", "+A/alpha.md", "Alpha", "the shared_term appears here", 0)
            .unwrap();
        store
            .store_knowledge_chunk("+B", "+B/beta.md", "Beta", "the shared_term appears here too", 0)
            .unwrap();

        let scoped = store
            .search_knowledge("shared_term", 10, Some(&["+A".to_string()]))
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].scope, "+A");

        let all = store.search_knowledge("shared_term", 10, None).unwrap();
        assert_eq!(all.len(), 2);

        let none = store.search_knowledge("shared_term", 10, Some(&[])).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn fts_handles_special_characters() {
        let store = store();
        store
            .store_knowledge_chunk("+A", "+A/notes.md", "Notes", "quarterly report numbers", 0)
            .unwrap();
        // Query with FTS syntax characters must not error.
        let result = store
            .search_knowledge("report: \"numbers\" AND (quarterly)", 10, Some(&["+A".to_string()]))
            .unwrap();
        assert_eq!(result.len(), 1);
        // Pure punctuation yields nothing.
        assert!(store
            .search_knowledge("!!! ???", 10, Some(&["+A".to_string()]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reingestion_replaces_chunks() {
        let store = store();
        for i in 0..3 {
            store
                .store_knowledge_chunk("+A", "+A/doc.md", "Doc", &format!("chunk {i}"), i)
                .unwrap();
        }
        store.delete_knowledge_source("+A", "+A/doc.md").unwrap();
        for i in 0..2 {
            store
                .store_knowledge_chunk("+A", "+A/doc.md", "Doc", &format!("new chunk {i}"), i)
                .unwrap();
        }
        let sources = store.knowledge_sources().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].chunk_count, 2);
    }

    #[test]
    fn system_state_round_trips() {
        let store = store();
        assert_eq!(store.get_state("schema_version").unwrap().unwrap(), "4");
        store.set_state("last_consolidation_at", "12345").unwrap();
        assert_eq!(
            store.get_state("last_consolidation_at").unwrap().unwrap(),
            "12345"
        );
    }

    #[test]
    fn inbound_message_updates_last_interaction() {
        let store = store();
        assert_eq!(store.last_interaction_ms().unwrap(), 0);
        store
            .store_message(&text_message("m-1", "+1", 1000), Direction::Inbound)
            .unwrap();
        assert!(store.last_interaction_ms().unwrap() > 0);
    }
}
