// Convodex - core/extract.rs
//
// Extraction of one message from one JSONL record. Pure function over
// bytes: no I/O, no store access. Records that do not yield a role and a
// content value are rejected with `None`; the caller skips them without
// aborting the file.
//
// Accepted record shapes, tried in order:
//   1. { "type": ..., "message": { "role": ..., "content": ... } }
//   2. { "message": { "role": ..., "content": ... } }
//   3. { "role": ..., "content": ... }
// plus the observed hybrid { "type": ..., "content": ... } where the
// top-level `type` stands in for the role.

use crate::core::model::{ParsedMessage, Role};
use serde_json::Value;

/// Extract role, content, and timestamp from a raw JSONL line.
///
/// Returns `None` for anything that is not a JSON object carrying a role
/// (or `type`) and a content value. Content is flattened to text: string
/// content verbatim; block arrays concatenate `text` blocks with newlines
/// and render `tool_use` blocks as `[Tool: <name>]`.
pub fn extract_message(line: &[u8]) -> Option<ParsedMessage> {
    let value: Value = serde_json::from_slice(line).ok()?;
    let object = value.as_object()?;

    let message = object.get("message").and_then(Value::as_object);

    let role_raw = message
        .and_then(|m| m.get("role"))
        .and_then(Value::as_str)
        .or_else(|| object.get("role").and_then(Value::as_str))
        .or_else(|| object.get("type").and_then(Value::as_str))?;

    let content = message
        .and_then(|m| m.get("content"))
        .or_else(|| object.get("content"))?;
    let content = flatten_content(content)?;

    let timestamp = object.get("created_at").and_then(Value::as_f64);

    Some(ParsedMessage {
        role: Role::from_raw(role_raw),
        content,
        timestamp,
    })
}

/// Flatten a content value to plain text.
///
/// Strings pass through. Arrays are walked in order: `text`-typed blocks
/// contribute their `text` field, `tool_use`-typed blocks contribute a
/// `[Tool: <name>]` marker, anything else contributes nothing. Other value
/// shapes are rejected.
fn flatten_content(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let mut parts: Vec<String> = Vec::new();
            for block in blocks {
                let Some(block) = block.as_object() else {
                    continue;
                };
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let name = block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        parts.push(format!("[Tool: {name}]"));
                    }
                    _ => {}
                }
            }
            Some(parts.join("\n"))
        }
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
