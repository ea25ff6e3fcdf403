// Convodex - app/importer.rs
//
// Incremental, idempotent import of one log file into the store.
//
// Per file: bring the mapped view up to date, resolve the resumption
// cursor (the smaller of the store's and the sidecar's last byte, so no
// line is ever skipped), then walk complete lines assigning contiguous
// positions, committing in bounded batches. Progress is written inside
// the same transaction as the messages it covers, so a crash replays the
// uncommitted tail and the (source_file, line_no) uniqueness constraint
// absorbs the duplicates.
//
// Commit order: database first, sidecar second. A sidecar that fails to
// persist is merely stale and is re-derived on the next run.
//
// The importer owns the process-wide registry of per-path mapped files and
// block indexes; both live for the process lifetime and are closed on
// shutdown.

use crate::app::store::{NewMessage, Store};
use crate::core::block_index::BlockIndex;
use crate::core::extract::extract_message;
use crate::core::mapped_file::{MapChange, MappedFile};
use crate::core::model::{conversation_id_for_path, ParsedMessage};
use crate::util::constants::{IMPORT_BATCH_SIZE, MAX_LINE_BYTES};
use crate::util::error::{ImportError, MapError, StoreError};
use chrono::Utc;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// =============================================================================
// Outcome
// =============================================================================

/// Counters for one `import_file` run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImportOutcome {
    /// Complete lines walked this run (inserted + replayed + skipped).
    pub lines: u64,

    /// Messages newly committed.
    pub inserted: u64,

    /// Lines the uniqueness constraint reported as already imported.
    pub replayed: u64,

    /// Empty, oversized, or unparseable lines passed over.
    pub skipped: u64,

    /// True when this run observed a rotation and started a fresh
    /// source-file row at byte 0.
    pub rotated: bool,
}

// =============================================================================
// Importer
// =============================================================================

struct FileHandles {
    mapped: MappedFile,
    index: BlockIndex,
}

/// Registry of live mapped files and block indexes, one pair per path.
pub struct Importer {
    registry: HashMap<PathBuf, FileHandles>,
}

impl Importer {
    pub fn new() -> Self {
        Self {
            registry: HashMap::new(),
        }
    }

    /// Get-or-open the handles for `path` and bring the mapping up to date.
    /// Returns the observed change (always `None` on first open).
    fn refresh(&mut self, path: &Path) -> Result<(&mut FileHandles, MapChange), MapError> {
        match self.registry.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => {
                let handles = entry.into_mut();
                let change = handles.mapped.remap_if_changed()?;
                Ok((handles, change))
            }
            Entry::Vacant(entry) => {
                let mapped = MappedFile::open(path)?;
                let index = BlockIndex::load_or_empty(path);
                Ok((entry.insert(FileHandles { mapped, index }), MapChange::None))
            }
        }
    }

    /// Current mapped view for `path`, remapped first so appended bytes are
    /// visible. Used by the tail overlay; does not touch the store.
    pub fn refreshed_mapped(&mut self, path: &Path) -> Result<(&MappedFile, MapChange), MapError> {
        let (handles, change) = self.refresh(path)?;
        Ok((&handles.mapped, change))
    }

    /// Release every mapping. Called once at shutdown.
    pub fn close_all(&mut self) {
        for handles in self.registry.values_mut() {
            handles.mapped.close();
        }
        self.registry.clear();
    }

    /// Import everything appended to `path` since the last committed run.
    pub fn import_file(&mut self, store: &Store, path: &Path) -> Result<ImportOutcome, ImportError> {
        let path_str = path.to_string_lossy().into_owned();
        let map_err = |source: MapError| ImportError::Map {
            path: path.to_path_buf(),
            source,
        };
        let store_err = |source: StoreError| ImportError::Store {
            path: path.to_path_buf(),
            source,
        };

        let (handles, change) = self.refresh(path).map_err(map_err)?;
        let mapped = &handles.mapped;
        let index = &mut handles.index;

        let (device_id, inode) = mapped.identity();
        let (size_bytes, mtime) = stat_for_progress(path, mapped.len());

        let mut row = store
            .get_or_create_source_file(&path_str, device_id, inode, size_bytes, mtime)
            .map_err(store_err)?;

        // Rotation: the path now names a different file object, or the file
        // shrank below the committed cursor. Retire the old row (history
        // stays addressable) and restart from byte 0 on a fresh one.
        let rotated = row.last_byte > 0
            && (change == MapChange::Rotated
                || (row.device_id, row.inode) != (device_id, inode)
                || mapped.len() < row.last_byte);
        if rotated {
            tracing::info!(file = %path.display(), old_id = row.id, "Rotation detected");
            store.mark_source_rotated(row.id).map_err(store_err)?;
            row = store
                .get_or_create_source_file(&path_str, device_id, inode, size_bytes, mtime)
                .map_err(store_err)?;
            index.reset();
        } else if !index.verify_against(mapped) {
            // Sidecar no longer describes this file's prefix. Rebuild it;
            // replay below is deduplicated by the uniqueness constraint.
            tracing::warn!(file = %path.display(), "Sidecar checksum mismatch; rebuilding");
            index.reset();
        }

        // Resumption cursor: the smaller of the two recorded cursors wins,
        // paired with its matching line count.
        let (start_byte, start_line) = if row.last_byte <= index.last_byte() {
            (row.last_byte, row.last_line)
        } else {
            (index.last_byte(), index.total_lines())
        };

        let mut outcome = ImportOutcome {
            rotated,
            ..ImportOutcome::default()
        };

        let conversation_id = conversation_id_for_path(path);
        let now = epoch_now();

        store.begin_batch().map_err(store_err)?;
        let result = run_batches(
            store,
            mapped,
            &conversation_id,
            row.id,
            start_byte,
            start_line,
            size_bytes,
            mtime,
            now,
            &mut outcome,
        );
        if let Err(source) = result {
            store.rollback_batch();
            return Err(store_err(source));
        }

        // Database is committed; now let the sidecar catch up. A failure
        // here is not an import failure: the next run re-derives it.
        if let Err(e) = index.append_incremental(mapped) {
            tracing::warn!(file = %path.display(), error = %e, "Sidecar persist failed");
        }

        tracing::info!(
            file = %path.display(),
            lines = outcome.lines,
            inserted = outcome.inserted,
            replayed = outcome.replayed,
            skipped = outcome.skipped,
            rotated = outcome.rotated,
            "Import complete"
        );

        Ok(outcome)
    }
}

impl Default for Importer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Batch loop
// =============================================================================

/// Per-conversation cursor cached for the duration of one file import.
struct ConvCursor {
    last_position: i64,
    added_messages: i64,
    added_chars: i64,
}

/// Walk complete lines from the cursor, inserting in batches. A batch
/// commit always covers the conversation statistics and the source-file
/// progress for every line it contains.
#[allow(clippy::too_many_arguments)]
fn run_batches(
    store: &Store,
    mapped: &MappedFile,
    conversation_id: &str,
    source_file_id: i64,
    start_byte: u64,
    start_line: u64,
    size_bytes: u64,
    mtime: i64,
    now: f64,
    outcome: &mut ImportOutcome,
) -> Result<(), StoreError> {
    let mut convs: HashMap<String, ConvCursor> = HashMap::new();
    let mut cursor_byte = start_byte;
    let mut cursor_line = start_line;
    let mut batch_inserted = 0usize;

    for line in mapped.find_lines(start_byte, mapped.len()) {
        cursor_line += 1;
        cursor_byte = line.end;
        outcome.lines += 1;

        match classify_line(line.content) {
            LineKind::Skip => {
                outcome.skipped += 1;
                continue;
            }
            LineKind::Message(parsed) => {
                let cursor = match convs.entry(conversation_id.to_string()) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(v) => {
                        let conv = store.get_or_create_conversation(conversation_id, now)?;
                        v.insert(ConvCursor {
                            last_position: conv.last_position,
                            added_messages: 0,
                            added_chars: 0,
                        })
                    }
                };

                let position = cursor.last_position + 1;
                let inserted = store.insert_message(&NewMessage {
                    conversation_id,
                    source_file_id,
                    line_no: cursor_line,
                    byte_start: line.start,
                    byte_end: line.end,
                    position,
                    role: parsed.role,
                    content: &parsed.content,
                    timestamp: parsed.timestamp,
                })?;

                if inserted {
                    cursor.last_position = position;
                    cursor.added_messages += 1;
                    cursor.added_chars += parsed.content.chars().count() as i64;
                    outcome.inserted += 1;
                    batch_inserted += 1;
                } else {
                    outcome.replayed += 1;
                }
            }
        }

        if batch_inserted >= IMPORT_BATCH_SIZE {
            flush_stats(store, &mut convs, now)?;
            store.update_source_progress(source_file_id, cursor_line, cursor_byte, size_bytes, mtime)?;
            store.commit_batch()?;
            store.begin_batch()?;
            batch_inserted = 0;
        }
    }

    if outcome.lines == 0 {
        // Nothing to do; close the empty transaction without touching
        // progress.
        store.rollback_batch();
        return Ok(());
    }

    flush_stats(store, &mut convs, now)?;
    store.update_source_progress(source_file_id, cursor_line, cursor_byte, size_bytes, mtime)?;
    store.commit_batch()?;
    Ok(())
}

fn flush_stats(
    store: &Store,
    convs: &mut HashMap<String, ConvCursor>,
    now: f64,
) -> Result<(), StoreError> {
    for (id, cursor) in convs.iter_mut() {
        if cursor.added_messages > 0 {
            store.update_conversation_stats(
                id,
                cursor.last_position,
                cursor.added_messages,
                cursor.added_chars,
                now,
            )?;
            cursor.added_messages = 0;
            cursor.added_chars = 0;
        }
    }
    Ok(())
}

enum LineKind {
    Skip,
    Message(ParsedMessage),
}

/// Empty, oversized, and unparseable lines are all skipped without
/// aborting the batch; the cursor still advances past them.
fn classify_line(content: &[u8]) -> LineKind {
    if content.is_empty() || content.len() > MAX_LINE_BYTES {
        return LineKind::Skip;
    }
    match extract_message(content) {
        Some(parsed) => LineKind::Message(parsed),
        None => LineKind::Skip,
    }
}

fn stat_for_progress(path: &Path, fallback_size: u64) -> (u64, i64) {
    match std::fs::metadata(path) {
        Ok(m) => {
            let mtime = m
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<Utc>::from(t).timestamp())
                .unwrap_or(0);
            (m.len(), mtime)
        }
        Err(_) => (fallback_size, 0),
    }
}

/// Current wall clock as fractional epoch seconds.
fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// =============================================================================
// Tests
// =============================================================================
