//! Schema, migrations, and connection setup for the memory store.
//!
//! The schema is created idempotently on every startup; migrations run
//! first so older databases gain the newer columns before the CREATE IF
//! NOT EXISTS pass. FTS5 external-content tables stay in sync through
//! triggers and are rebuilt when a migration left them empty.

use std::path::Path;

use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::{MemoryError, Result};

pub const SCHEMA_VERSION: i64 = 4;

pub(crate) const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT UNIQUE NOT NULL,
    direction TEXT NOT NULL,
    content_type TEXT NOT NULL,
    content_text TEXT,
    conversation_id TEXT,
    reply_to_id TEXT,
    sender_id TEXT,
    sender_name TEXT,
    timestamp INTEGER NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    archived INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (reply_to_id) REFERENCES messages(message_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_archived ON messages(archived, timestamp DESC);

CREATE TABLE IF NOT EXISTS system_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

INSERT OR IGNORE INTO system_state (key, value) VALUES
    ('schema_version', '4'),
    ('last_interaction_at', '0'),
    ('last_consolidation_at', '0');

CREATE TABLE IF NOT EXISTS user_facts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.8,
    source TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    learned_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    last_verified_at INTEGER,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    UNIQUE(conversation_id, category, key, active)
);

CREATE INDEX IF NOT EXISTS idx_facts_conversation ON user_facts(conversation_id, active);
CREATE INDEX IF NOT EXISTS idx_facts_active ON user_facts(active, confidence DESC);

CREATE TABLE IF NOT EXISTS context_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL DEFAULT '',
    summary_type TEXT NOT NULL,
    period_start INTEGER NOT NULL,
    period_end INTEGER NOT NULL,
    summary_text TEXT NOT NULL,
    message_count INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

CREATE INDEX IF NOT EXISTS idx_summaries_conversation ON context_summaries(conversation_id, period_end DESC);

CREATE TABLE IF NOT EXISTS knowledge_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scope TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    chunk_index INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    UNIQUE(scope, source, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_knowledge_source ON knowledge_chunks(source);
CREATE INDEX IF NOT EXISTS idx_knowledge_scope ON knowledge_chunks(scope);

CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts USING fts5(
    title,
    content,
    content=knowledge_chunks,
    content_rowid=id
);

CREATE TRIGGER IF NOT EXISTS knowledge_ai AFTER INSERT ON knowledge_chunks BEGIN
    INSERT INTO knowledge_fts(rowid, title, content) VALUES (new.id, new.title, new.content);
END;

CREATE TRIGGER IF NOT EXISTS knowledge_ad AFTER DELETE ON knowledge_chunks BEGIN
    INSERT INTO knowledge_fts(knowledge_fts, rowid, title, content) VALUES('delete', old.id, old.title, old.content);
END;

CREATE TRIGGER IF NOT EXISTS knowledge_au AFTER UPDATE ON knowledge_chunks BEGIN
    INSERT INTO knowledge_fts(knowledge_fts, rowid, title, content) VALUES('delete', old.id, old.title, old.content);
    INSERT INTO knowledge_fts(rowid, title, content) VALUES (new.id, new.title, new.content);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS user_facts_fts USING fts5(
    key,
    value,
    content=user_facts,
    content_rowid=id
);

CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON user_facts BEGIN
    INSERT INTO user_facts_fts(rowid, key, value) VALUES (new.id, new.key, new.value);
END;

CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON user_facts BEGIN
    INSERT INTO user_facts_fts(user_facts_fts, rowid, key, value) VALUES('delete', old.id, old.key, old.value);
END;

CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE ON user_facts BEGIN
    INSERT INTO user_facts_fts(user_facts_fts, rowid, key, value) VALUES('delete', old.id, old.key, old.value);
    INSERT INTO user_facts_fts(rowid, key, value) VALUES (new.id, new.key, new.value);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS summaries_fts USING fts5(
    summary_text,
    content=context_summaries,
    content_rowid=id
);

CREATE TRIGGER IF NOT EXISTS summaries_ai AFTER INSERT ON context_summaries BEGIN
    INSERT INTO summaries_fts(rowid, summary_text) VALUES (new.id, new.summary_text);
END;

CREATE TRIGGER IF NOT EXISTS summaries_ad AFTER DELETE ON context_summaries BEGIN
    INSERT INTO summaries_fts(summaries_fts, rowid, summary_text) VALUES('delete', old.id, old.summary_text);
END;

CREATE TRIGGER IF NOT EXISTS summaries_au AFTER UPDATE ON context_summaries BEGIN
    INSERT INTO summaries_fts(summaries_fts, rowid, summary_text) VALUES('delete', old.id, old.summary_text);
    INSERT INTO summaries_fts(rowid, summary_text) VALUES (new.id, new.summary_text);
END;
";

/// Load the encryption key from file. Requirements: the file exists, holds
/// at least 32 chars, and (on unix) is not group/world readable; a looser
/// mode logs a warning but does not block.
pub fn load_encryption_key(key_file: &str) -> Option<String> {
    let path = Path::new(key_file);
    if !path.exists() {
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = path.metadata() {
            let mode = meta.permissions().mode() & 0o777;
            if mode > 0o600 {
                warn!(path = %key_file, mode = format!("{mode:o}"), "key file has permissive mode (expected 600 or stricter)");
            }
        }
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let key = raw.trim().to_string();
            if key.len() < 32 {
                warn!(path = %key_file, "encryption key shorter than 32 chars");
            }
            (!key.is_empty()).then_some(key)
        }
        Err(e) => {
            warn!(path = %key_file, error = %e, "cannot read encryption key, opening unencrypted");
            None
        }
    }
}

/// Open the database, applying the key when encryption is compiled in.
/// Returns the connection and whether the store is actually encrypted.
pub fn open(db_path: &str, key_file: &str, require_encrypted: bool) -> Result<(Connection, bool)> {
    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let key = load_encryption_key(key_file);
    let conn = Connection::open(db_path)?;

    #[allow(unused_mut)]
    let mut encrypted = false;
    #[cfg(feature = "encryption")]
    if let Some(key) = &key {
        conn.pragma_update(None, "key", key)?;
        // Fails here if the key is wrong for an existing encrypted file.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))?;
        encrypted = true;
    }
    #[cfg(not(feature = "encryption"))]
    if key.is_some() {
        warn!("encryption key present but this build has no SQLCipher support");
    }

    if require_encrypted && !encrypted {
        return Err(MemoryError::EncryptionRequired(
            "build with the `encryption` feature and provide a key file".to_string(),
        ));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    run_migrations(&conn)?;
    conn.execute_batch(SCHEMA_SQL)?;
    rebuild_fts_if_needed(&conn)?;

    info!(
        path = %db_path,
        encrypted,
        "memory store opened"
    );
    Ok((conn, encrypted))
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(names)
}

/// Additive migrations for databases created by earlier schema versions.
fn run_migrations(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "messages")? {
        return Ok(()); // fresh database
    }

    let columns = column_names(conn, "messages")?;
    for (column, ddl) in [
        (
            "archived",
            "ALTER TABLE messages ADD COLUMN archived INTEGER NOT NULL DEFAULT 0",
        ),
        ("sender_id", "ALTER TABLE messages ADD COLUMN sender_id TEXT"),
        (
            "sender_name",
            "ALTER TABLE messages ADD COLUMN sender_name TEXT",
        ),
    ] {
        if !columns.iter().any(|c| c == column) {
            info!(column, "migration: adding column to messages");
            conn.execute(ddl, [])?;
        }
    }

    if table_exists(conn, "user_facts")? {
        let columns = column_names(conn, "user_facts")?;
        if !columns.iter().any(|c| c == "conversation_id") {
            info!("migration: adding conversation_id to user_facts");
            conn.execute(
                "ALTER TABLE user_facts ADD COLUMN conversation_id TEXT NOT NULL DEFAULT ''",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_facts_conversation ON user_facts(conversation_id, active)",
                [],
            )?;
        }
    }

    if table_exists(conn, "context_summaries")? {
        let columns = column_names(conn, "context_summaries")?;
        if !columns.iter().any(|c| c == "conversation_id") {
            info!("migration: adding conversation_id to context_summaries");
            conn.execute(
                "ALTER TABLE context_summaries ADD COLUMN conversation_id TEXT NOT NULL DEFAULT ''",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_summaries_conversation ON context_summaries(conversation_id, period_end DESC)",
                [],
            )?;
        }
    }

    if table_exists(conn, "knowledge_chunks")? {
        let columns = column_names(conn, "knowledge_chunks")?;
        if !columns.iter().any(|c| c == "scope") {
            info!("migration: adding scope to knowledge_chunks");
            conn.execute(
                "ALTER TABLE knowledge_chunks ADD COLUMN scope TEXT NOT NULL DEFAULT ''",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_knowledge_scope ON knowledge_chunks(scope)",
                [],
            )?;
        }
    }

    Ok(())
}

/// Rebuild an FTS index when its main table has rows but the index has
/// none (e.g. the table predates the FTS migration).
fn rebuild_fts_if_needed(conn: &Connection) -> Result<()> {
    for (fts, main, filter) in [
        ("user_facts_fts", "user_facts", "WHERE active = 1"),
        ("summaries_fts", "context_summaries", ""),
        ("knowledge_fts", "knowledge_chunks", ""),
    ] {
        let fts_count: std::result::Result<i64, _> =
            conn.query_row(&format!("SELECT COUNT(*) FROM {fts}"), [], |row| row.get(0));
        let Ok(fts_count) = fts_count else {
            continue; // FTS table not created yet
        };
        let main_count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {main} {filter}"),
            [],
            |row| row.get(0),
        )?;
        if fts_count == 0 && main_count > 0 {
            info!(index = fts, rows = main_count, "migration: rebuilding FTS index");
            conn.execute(&format!("INSERT INTO {fts}({fts}) VALUES('rebuild')"), [])?;
        }
    }
    Ok(())
}
