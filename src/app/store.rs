// Convodex - app/store.rs
//
// Embedded relational store: file progress, conversation metadata,
// messages, and an FTS5 shadow index over message content.
//
// Connection discipline: one connection, WAL journal so readers are never
// blocked by the importer's write transaction, foreign keys enforced, hot
// paths through prepare_cached. The FTS shadow is kept synchronised by
// triggers; application code never writes it directly.

use crate::core::model::{MessageRow, Role, SearchHit};
use crate::util::constants::{
    DB_CACHE_SIZE_KIB, DB_MMAP_BYTES, DB_PAGE_SIZE, SEARCH_SNIPPET_TOKENS,
};
use crate::util::error::StoreError;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

/// Schema version stamped into `PRAGMA user_version`. Migration policy is a
/// monotonically increasing number: an empty database is initialised to the
/// current version, a newer-than-supported database is refused.
const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS source_files (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL,
    device_id INTEGER NOT NULL DEFAULT 0,
    inode INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER NOT NULL DEFAULT 0,
    last_line INTEGER NOT NULL DEFAULT 0,
    last_byte INTEGER NOT NULL DEFAULT 0,
    rotated INTEGER NOT NULL DEFAULT 0
);

-- One active (non-rotated) row per path; rotated history rows keep the
-- same path and stay addressable from their messages.
CREATE UNIQUE INDEX IF NOT EXISTS idx_source_files_active_path
    ON source_files(path) WHERE rotated = 0;

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    display_title TEXT,
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL,
    last_position INTEGER NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL DEFAULT 0,
    total_chars INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    source_file_id INTEGER NOT NULL REFERENCES source_files(id),
    line_no INTEGER NOT NULL,
    byte_start INTEGER NOT NULL,
    byte_end INTEGER NOT NULL,
    position INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp REAL,
    UNIQUE(source_file_id, line_no)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_position
    ON messages(conversation_id, position DESC);
CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(updated_at DESC);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    conversation_id UNINDEXED,
    content='messages',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, content, conversation_id)
    VALUES (new.id, new.content, new.conversation_id);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content, conversation_id)
    VALUES ('delete', old.id, old.content, old.conversation_id);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content, conversation_id)
    VALUES ('delete', old.id, old.content, old.conversation_id);
    INSERT INTO messages_fts(rowid, content, conversation_id)
    VALUES (new.id, new.content, new.conversation_id);
END;
"#;

// =============================================================================
// Row types
// =============================================================================

/// Progress row for one source file.
#[derive(Debug, Clone)]
pub struct SourceFileRow {
    pub id: i64,
    pub device_id: u64,
    pub inode: u64,
    pub last_line: u64,
    pub last_byte: u64,
}

/// Metadata row for one conversation.
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub last_position: i64,
    pub message_count: i64,
    pub total_chars: i64,
}

/// One message to insert, fully resolved by the importer.
#[derive(Debug)]
pub struct NewMessage<'a> {
    pub conversation_id: &'a str,
    pub source_file_id: i64,
    pub line_no: u64,
    pub byte_start: u64,
    pub byte_end: u64,
    pub position: i64,
    pub role: Role,
    pub content: &'a str,
    pub timestamp: Option<f64>,
}

// =============================================================================
// Store
// =============================================================================

/// The process-wide database handle.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and apply connection
    /// configuration and schema. The parent directory must already exist
    /// (the caller resolves and creates it at startup).
    pub fn open(path: &Path) -> Result<Store, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let store = Self::configure(conn).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(db = %path.display(), "Store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Store, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn).map_err(|source| StoreError::Query { source })
    }

    fn configure(conn: Connection) -> Result<Store, rusqlite::Error> {
        // Page size must be set before the first write on a fresh database.
        conn.pragma_update(None, "page_size", DB_PAGE_SIZE)?;
        // journal_mode returns the resulting mode as a row.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", DB_CACHE_SIZE_KIB)?;
        conn.pragma_update(None, "mmap_size", DB_MMAP_BYTES as i64)?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(SCHEMA_SQL)?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            }
            v if v == SCHEMA_VERSION => {}
            v => {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISMATCH),
                    Some(format!(
                        "database schema version {v} is newer than supported {SCHEMA_VERSION}"
                    )),
                ));
            }
        }

        Ok(Store { conn })
    }

    // -------------------------------------------------------------------------
    // Transactions (importer batches)
    // -------------------------------------------------------------------------

    /// Open an immediate write transaction.
    pub fn begin_batch(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    /// Commit the open batch.
    pub fn commit_batch(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the open batch, if any. Safe to call when none is open.
    pub fn rollback_batch(&self) {
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Rollback failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Source files
    // -------------------------------------------------------------------------

    /// Fetch the active row for `path`, creating one if absent.
    pub fn get_or_create_source_file(
        &self,
        path: &str,
        device_id: u64,
        inode: u64,
        size_bytes: u64,
        mtime: i64,
    ) -> Result<SourceFileRow, StoreError> {
        let existing = self
            .conn
            .prepare_cached(
                "SELECT id, device_id, inode, last_line, last_byte FROM source_files
                 WHERE path = ?1 AND rotated = 0",
            )?
            .query_row(params![path], |row| {
                Ok(SourceFileRow {
                    id: row.get(0)?,
                    device_id: row.get::<_, i64>(1)? as u64,
                    inode: row.get::<_, i64>(2)? as u64,
                    last_line: row.get::<_, i64>(3)? as u64,
                    last_byte: row.get::<_, i64>(4)? as u64,
                })
            })
            .optional()?;

        if let Some(row) = existing {
            return Ok(row);
        }

        self.conn
            .prepare_cached(
                "INSERT INTO source_files (path, device_id, inode, size_bytes, mtime)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![path, device_id as i64, inode as i64, size_bytes as i64, mtime])?;

        Ok(SourceFileRow {
            id: self.conn.last_insert_rowid(),
            device_id,
            inode,
            last_line: 0,
            last_byte: 0,
        })
    }

    /// Flag a row as rotated. Its messages stay addressable; the path is
    /// free for a fresh active row.
    pub fn mark_source_rotated(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .prepare_cached("UPDATE source_files SET rotated = 1 WHERE id = ?1")?
            .execute(params![id])?;
        Ok(())
    }

    /// Advance the progress cursor after a successful commit.
    pub fn update_source_progress(
        &self,
        id: i64,
        last_line: u64,
        last_byte: u64,
        size_bytes: u64,
        mtime: i64,
    ) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(
                "UPDATE source_files
                 SET last_line = ?2, last_byte = ?3, size_bytes = ?4, mtime = ?5
                 WHERE id = ?1",
            )?
            .execute(params![
                id,
                last_line as i64,
                last_byte as i64,
                size_bytes as i64,
                mtime
            ])?;
        Ok(())
    }

    /// Number of source-file rows ever created. Non-zero means an index has
    /// been built at some point.
    pub fn source_file_count(&self) -> Result<i64, StoreError> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM source_files", [], |row| row.get(0))?;
        Ok(n)
    }

    // -------------------------------------------------------------------------
    // Conversations
    // -------------------------------------------------------------------------

    /// Fetch a conversation, creating it with `last_position = 0` on first
    /// sight.
    pub fn get_or_create_conversation(
        &self,
        id: &str,
        now: f64,
    ) -> Result<ConversationRow, StoreError> {
        if let Some(row) = self.conversation(id)? {
            return Ok(row);
        }

        self.conn
            .prepare_cached(
                "INSERT INTO conversations (id, created_at, updated_at)
                 VALUES (?1, ?2, ?2)",
            )?
            .execute(params![id, now])?;

        Ok(ConversationRow {
            id: id.to_string(),
            last_position: 0,
            message_count: 0,
            total_chars: 0,
        })
    }

    /// Look up a conversation by id.
    pub fn conversation(&self, id: &str) -> Result<Option<ConversationRow>, StoreError> {
        let row = self
            .conn
            .prepare_cached(
                "SELECT id, last_position, message_count, total_chars
                 FROM conversations WHERE id = ?1",
            )?
            .query_row(params![id], |row| {
                Ok(ConversationRow {
                    id: row.get(0)?,
                    last_position: row.get(1)?,
                    message_count: row.get(2)?,
                    total_chars: row.get(3)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Apply the statistics delta for messages committed in one batch.
    pub fn update_conversation_stats(
        &self,
        id: &str,
        last_position: i64,
        added_messages: i64,
        added_chars: i64,
        now: f64,
    ) -> Result<(), StoreError> {
        self.conn
            .prepare_cached(
                "UPDATE conversations
                 SET last_position = ?2,
                     message_count = message_count + ?3,
                     total_chars = total_chars + ?4,
                     updated_at = ?5
                 WHERE id = ?1",
            )?
            .execute(params![id, last_position, added_messages, added_chars, now])?;
        Ok(())
    }

    /// Total number of conversations.
    pub fn conversation_count(&self) -> Result<i64, StoreError> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        Ok(n)
    }

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    /// Insert one message. Returns false when the `(source_file_id,
    /// line_no)` uniqueness constraint reports the line as already imported
    /// (idempotent replay).
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<bool, StoreError> {
        let inserted = self
            .conn
            .prepare_cached(
                "INSERT OR IGNORE INTO messages
                 (conversation_id, source_file_id, line_no, byte_start, byte_end,
                  position, role, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?
            .execute(params![
                msg.conversation_id,
                msg.source_file_id,
                msg.line_no as i64,
                msg.byte_start as i64,
                msg.byte_end as i64,
                msg.position,
                msg.role.as_str(),
                msg.content,
                msg.timestamp,
            ])?;
        Ok(inserted > 0)
    }

    /// Keyset-paginated page: up to `limit` messages with
    /// `position < before_position`, newest first.
    pub fn get_messages_before(
        &self,
        conversation_id: &str,
        before_position: i64,
        limit: usize,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT position, role, content, timestamp FROM messages
             WHERE conversation_id = ?1 AND position < ?2
             ORDER BY position DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![conversation_id, before_position, limit as i64],
            |row| {
                Ok(MessageRow {
                    position: row.get(0)?,
                    role: Role::from_raw(&row.get::<_, String>(1)?),
                    content: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            },
        )?;

        let mut page = Vec::new();
        for row in rows {
            page.push(row?);
        }
        Ok(page)
    }

    /// The newest active source file that has contributed messages to this
    /// conversation, for driving the tail overlay.
    pub fn get_latest_source_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<(i64, String, u64)>, StoreError> {
        let row = self
            .conn
            .prepare_cached(
                "SELECT sf.id, sf.path, sf.last_byte FROM source_files sf
                 WHERE sf.rotated = 0 AND EXISTS (
                     SELECT 1 FROM messages m
                     WHERE m.source_file_id = sf.id AND m.conversation_id = ?1
                 )
                 ORDER BY sf.id DESC LIMIT 1",
            )?
            .query_row(params![conversation_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            })
            .optional()?;
        Ok(row)
    }

    // -------------------------------------------------------------------------
    // Search
    // -------------------------------------------------------------------------

    /// Full-text search over message content, best rank first.
    ///
    /// `query` is user text; it is normalised into quoted FTS phrase terms
    /// so MATCH syntax can never error. `rank` is bm25 (lower is better).
    pub fn search(
        &self,
        query: &str,
        conversation_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let match_expr = fts_match_expression(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT m.id, m.conversation_id, m.position, m.timestamp,
                    bm25(messages_fts) AS rank,
                    snippet(messages_fts, 0, '[', ']', '…', {SEARCH_SNIPPET_TOKENS})
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.rowid
             WHERE messages_fts MATCH ?1 {filter}
             ORDER BY rank LIMIT ?{limit_idx}",
            filter = if conversation_filter.is_some() {
                "AND m.conversation_id = ?2"
            } else {
                ""
            },
            limit_idx = if conversation_filter.is_some() { 3 } else { 2 },
        );

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(SearchHit {
                message_id: row.get(0)?,
                conversation_id: row.get(1)?,
                position: row.get(2)?,
                timestamp: row.get(3)?,
                rank: row.get(4)?,
                snippet: row.get(5)?,
            })
        };

        let mut hits = Vec::new();
        match conversation_filter {
            Some(conv) => {
                let rows = stmt.query_map(params![match_expr, conv, limit as i64], map_row)?;
                for row in rows {
                    hits.push(row?);
                }
            }
            None => {
                let rows = stmt.query_map(params![match_expr, limit as i64], map_row)?;
                for row in rows {
                    hits.push(row?);
                }
            }
        }
        Ok(hits)
    }

    /// True per-conversation hit totals for `query`, independent of any
    /// result-page limit. A page of hits is capped; these counts are not,
    /// so a session's total never shrinks just because other sessions
    /// crowded the page.
    pub fn search_match_counts(&self, query: &str) -> Result<HashMap<String, i64>, StoreError> {
        let match_expr = fts_match_expression(query);
        if match_expr.is_empty() {
            return Ok(HashMap::new());
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT m.conversation_id, COUNT(*)
             FROM messages_fts
             JOIN messages m ON m.id = messages_fts.rowid
             WHERE messages_fts MATCH ?1
             GROUP BY m.conversation_id",
        )?;
        let rows = stmt.query_map(params![match_expr], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (conversation_id, count) = row?;
            counts.insert(conversation_id, count);
        }
        Ok(counts)
    }

    /// Merge the FTS b-tree after a bulk import.
    pub fn fts_optimize(&self) -> Result<(), StoreError> {
        self.conn
            .execute("INSERT INTO messages_fts(messages_fts) VALUES('optimize')", [])?;
        Ok(())
    }
}

/// Quote each whitespace-separated token as an FTS5 phrase so user input
/// containing operators or punctuation cannot break the MATCH parser.
fn fts_match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Tests
// =============================================================================
