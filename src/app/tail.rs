// Convodex - app/tail.rs
//
// Live tail overlay: serves messages appended to a log file since the last
// import commit by parsing the unindexed byte range straight from the
// mapped file at query time, merged ahead of the store page.
//
// The overlay range starts strictly beyond the store's committed cursor,
// so an overlay message can never duplicate a stored one; the next import
// run makes the same messages durable.
//
// Failures here degrade, never break, a query: if the file is gone or was
// rotated since the cursor was recorded, the overlay is skipped and the
// store page is returned alone.

use crate::app::importer::Importer;
use crate::app::store::Store;
use crate::core::extract::extract_message;
use crate::core::mapped_file::MapChange;
use crate::core::model::{conversation_id_for_path, MessageRow};
use crate::util::constants::MAX_LINE_BYTES;
use crate::util::error::StoreError;
use std::path::Path;

/// One merged page: tail-derived rows first, then stored rows, newest
/// first throughout.
#[derive(Debug)]
pub struct OverlayPage {
    pub messages: Vec<MessageRow>,

    /// Highest live position in the conversation, tail entries included.
    /// The next page's `before_position` cursor and `has_more` derive from
    /// the page itself; this is the page-1 anchor.
    pub newest_position: i64,
}

/// Fetch up to `limit` messages with `position < before_position`,
/// overlaying any bytes appended past the last committed import.
pub fn get_messages_with_tail(
    store: &Store,
    importer: &mut Importer,
    conversation_id: &str,
    before_position: i64,
    limit: usize,
) -> Result<OverlayPage, StoreError> {
    let Some(conv) = store.conversation(conversation_id)? else {
        return Ok(OverlayPage {
            messages: Vec::new(),
            newest_position: 0,
        });
    };

    let stored = store.get_messages_before(conversation_id, before_position, limit)?;

    let mut tail = Vec::new();
    if let Some((_, path, last_byte)) = store.get_latest_source_for_conversation(conversation_id)? {
        let path = Path::new(&path);
        // Only lines whose derived conversation id matches may overlay.
        // The id derivation is per-file, so the check hoists out of the
        // line loop.
        if conversation_id_for_path(path) == conversation_id {
            tail = tail_messages(importer, path, last_byte, conv.last_position);
        }
    }

    let newest_position = conv.last_position + tail.len() as i64;

    // Tail rows are newer than anything stored; emit them first, newest
    // first, still honouring the page cursor and size.
    let mut messages: Vec<MessageRow> = tail
        .into_iter()
        .rev()
        .filter(|m| m.position < before_position)
        .chain(stored)
        .take(limit)
        .collect();
    messages.shrink_to_fit();

    Ok(OverlayPage {
        messages,
        newest_position,
    })
}

/// Parse the overlay range `[last_byte, size)` of `path`, oldest first,
/// assigning synthetic positions after `last_position`.
fn tail_messages(
    importer: &mut Importer,
    path: &Path,
    last_byte: u64,
    last_position: i64,
) -> Vec<MessageRow> {
    let (mapped, change) = match importer.refreshed_mapped(path) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::debug!(file = %path.display(), error = %e, "Tail overlay unavailable");
            return Vec::new();
        }
    };

    // A rotated file no longer contains the bytes the cursor describes;
    // the next import restarts it from zero. No overlay until then.
    if change == MapChange::Rotated || mapped.len() <= last_byte {
        return Vec::new();
    }

    let mut rows = Vec::new();
    for line in mapped.find_lines(last_byte, mapped.len()) {
        if line.content.is_empty() || line.content.len() > MAX_LINE_BYTES {
            continue;
        }
        let Some(parsed) = extract_message(line.content) else {
            continue;
        };
        rows.push(MessageRow {
            position: last_position + rows.len() as i64 + 1,
            role: parsed.role,
            content: parsed.content,
            timestamp: parsed.timestamp,
        });
    }

    if !rows.is_empty() {
        tracing::debug!(
            file = %path.display(),
            from_byte = last_byte,
            entries = rows.len(),
            "Tail overlay active"
        );
    }
    rows
}

// =============================================================================
// Tests
// =============================================================================
