// Convodex - app/scan.rs
//
// Filesystem scan: enumerate candidate log files under a root directory.
//
// Contract: returns absolute paths of `*.jsonl` files under the root,
// sorted by modification time descending (most recent first). The protocol
// layer derives `session_N` ids from positions in this ordering.
//
// Per-entry I/O errors are non-fatal: logged, counted, skipped. Only an
// invalid root or the file-count cap aborts the scan.

use crate::core::model::ScanEntry;
use crate::util::constants::{MAX_SCAN_FILES, SCAN_INCLUDE_PATTERN, SCAN_MAX_DEPTH};
use crate::util::error::ScanError;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Resolve the effective scan root.
///
/// `None` means the configured default; a relative path is resolved
/// against the default root rather than the working directory.
pub fn resolve_root(requested: Option<&str>, default_root: &Path) -> PathBuf {
    match requested {
        None => default_root.to_path_buf(),
        Some(r) => {
            let p = Path::new(r);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                default_root.join(p)
            }
        }
    }
}

/// Scan `root` for log files, most recently modified first.
pub fn scan_logs(root: &Path) -> Result<Vec<ScanEntry>, ScanError> {
    if !root.exists() {
        return Err(ScanError::RootNotFound {
            path: root.to_path_buf(),
        });
    }
    if !root.is_dir() {
        return Err(ScanError::NotADirectory {
            path: root.to_path_buf(),
        });
    }

    // The include pattern is a compile-time literal; the unit tests cover it.
    let include = glob::Pattern::new(SCAN_INCLUDE_PATTERN).expect("literal include pattern");

    tracing::debug!(root = %root.display(), "Scan starting");

    let mut entries: Vec<ScanEntry> = Vec::new();
    let mut skipped = 0usize;

    let walker = walkdir::WalkDir::new(root)
        .max_depth(SCAN_MAX_DEPTH)
        .follow_links(false);

    for entry_result in walker {
        let entry = match entry_result {
            Ok(e) => e,
            Err(e) => {
                // Inaccessible entry: non-fatal.
                tracing::debug!(error = %e, "Scan: cannot access entry");
                skipped += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let file_name = match entry.file_name().to_str() {
            Some(n) => n,
            None => {
                tracing::debug!(path = %entry.path().display(), "Scan: non-UTF-8 filename");
                skipped += 1;
                continue;
            }
        };
        if !include.matches(file_name) {
            continue;
        }

        if entries.len() >= MAX_SCAN_FILES {
            return Err(ScanError::MaxFilesExceeded {
                max: MAX_SCAN_FILES,
            });
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %entry.path().display(), error = %e, "Scan: cannot stat");
                skipped += 1;
                continue;
            }
        };

        let mtime = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).timestamp())
            .unwrap_or(0);

        entries.push(ScanEntry {
            path: entry.path().to_path_buf(),
            size: metadata.len(),
            mtime,
        });
    }

    // Most recent first; path as tiebreaker for a stable ordering.
    entries.sort_by(|a, b| b.mtime.cmp(&a.mtime).then_with(|| a.path.cmp(&b.path)));

    tracing::debug!(files = entries.len(), skipped, "Scan complete");
    Ok(entries)
}

// =============================================================================
// Tests
// =============================================================================
