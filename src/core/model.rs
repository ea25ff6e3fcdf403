// Convodex - core/model.rs
//
// Core data model types. Pure data definitions with no I/O, no protocol,
// no platform dependencies.
//
// These types are the shared vocabulary across all layers.

use serde::Serialize;
use std::path::{Path, PathBuf};

// =============================================================================
// Role
// =============================================================================

/// Who produced a message.
///
/// Source records carry free-form role strings; anything that is not
/// `user` or `assistant` is normalised to `System`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Normalise a raw role string. Unknown values map to `System`.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::System,
        }
    }

    /// Stable string form used in the database and the protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Parsed message (output of extraction)
// =============================================================================

/// A message extracted from one JSONL record, before it is assigned a
/// conversation position or committed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    /// Normalised role.
    pub role: Role,

    /// Extracted text content. Never raw JSON: string content is taken
    /// verbatim, block-array content is flattened (`text` blocks joined by
    /// newlines, `tool_use` blocks rendered as `[Tool: <name>]`).
    pub content: String,

    /// Record timestamp in epoch seconds, when the record carried one.
    pub timestamp: Option<f64>,
}

// =============================================================================
// Conversation identity
// =============================================================================

/// Derive the conversation id for a source file.
///
/// The id is the file's basename with its extension stripped
/// (`/logs/a.jsonl` -> `a`). Every call site goes through this function so
/// the derivation can be swapped in one place.
pub fn conversation_id_for_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unnamed")
        .to_string()
}

// =============================================================================
// Scan entry (output of the filesystem scan)
// =============================================================================

/// Metadata about one candidate log file found by the scan.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    /// Absolute path to the file.
    pub path: PathBuf,

    /// File size in bytes at scan time.
    pub size: u64,

    /// Last modification time in epoch seconds (0 when unavailable).
    pub mtime: i64,
}

// =============================================================================
// Query rows
// =============================================================================

/// One message in a paginated conversation view, newest-first.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    /// 1-based position within the conversation.
    pub position: i64,

    /// Normalised role string.
    pub role: Role,

    /// Extracted text content.
    pub content: String,

    /// Epoch-second timestamp, when the source record carried one.
    pub timestamp: Option<f64>,
}

/// One full-text search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Row id of the matching message.
    pub message_id: i64,

    /// Conversation the message belongs to.
    pub conversation_id: String,

    /// 1-based position within the conversation.
    pub position: i64,

    /// Epoch-second timestamp, when present.
    pub timestamp: Option<f64>,

    /// FTS engine rank (bm25; lower is better, typically negative).
    pub rank: f64,

    /// Highlighted context around the hit.
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_normalisation() {
        assert_eq!(Role::from_raw("user"), Role::User);
        assert_eq!(Role::from_raw("assistant"), Role::Assistant);
        assert_eq!(Role::from_raw("system"), Role::System);
        // Unknown roles map to system.
        assert_eq!(Role::from_raw("tool"), Role::System);
        assert_eq!(Role::from_raw(""), Role::System);
    }

    #[test]
    fn test_conversation_id_strips_extension() {
        assert_eq!(conversation_id_for_path(Path::new("/logs/a.jsonl")), "a");
        assert_eq!(
            conversation_id_for_path(Path::new("/deep/dir/chat-2024.jsonl")),
            "chat-2024"
        );
        // No extension: basename as-is.
        assert_eq!(conversation_id_for_path(Path::new("/logs/bare")), "bare");
    }

    #[test]
    fn test_role_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }
}
