// Convodex - core/mapped_file.rs
//
// Read-only memory-mapped view of a log file that is still being written by
// another process. Presents the current on-disk bytes as a contiguous slice
// with a line iterator, and detects growth, rotation (identity change), and
// truncation so the caller can remap.
//
// The producing process owns the file; we open with sharing flags that
// permit concurrent readers, writers, and deletion, and never write.

use crate::util::error::MapError;
use memmap2::{Mmap, MmapOptions};
use std::fs::{File, Metadata};
use std::io;
use std::path::{Path, PathBuf};

// =============================================================================
// File identity
// =============================================================================

/// Identifies the underlying file object, independent of its path.
///
/// A change in identity under an unchanged path means the file was rotated:
/// the old object was renamed or deleted and a new one created in its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    device: u64,
    file_id: u64,
}

#[cfg(unix)]
fn identity_of(metadata: &Metadata) -> FileIdentity {
    use std::os::unix::fs::MetadataExt;
    FileIdentity {
        device: metadata.dev(),
        file_id: metadata.ino(),
    }
}

#[cfg(windows)]
fn identity_of(metadata: &Metadata) -> FileIdentity {
    // std exposes no file index on Windows; creation time is the closest
    // stable per-object marker available without winapi. A rotated file has
    // a fresh creation time, which is what this check needs to observe.
    use std::os::windows::fs::MetadataExt;
    FileIdentity {
        device: 0,
        file_id: metadata.creation_time(),
    }
}

// =============================================================================
// Change report
// =============================================================================

/// What `remap_if_changed` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapChange {
    /// Nothing changed; the existing slice is still current.
    None,

    /// The file grew and was remapped in place; same identity, new length.
    Grew,

    /// The file was rotated (identity change) or truncated below the mapped
    /// length; the mapping was reopened from scratch.
    Rotated,
}

// =============================================================================
// Mapped file
// =============================================================================

/// A read-only mapping of one log file.
///
/// The exposed slice is valid until the next `remap_if_changed` call that
/// reports a change, or until `close`.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    /// Kept open across growth remaps so the mapping survives concurrent
    /// renames of the path (growth never changes identity).
    file: Option<File>,
    /// `None` for zero-length files and after `close`.
    map: Option<Mmap>,
    len: u64,
    identity: FileIdentity,
    generation: u64,
}

impl MappedFile {
    /// Open `path` for shared read and map its current contents.
    pub fn open(path: &Path) -> Result<MappedFile, MapError> {
        let file = open_shared(path)?;
        let metadata = file.metadata().map_err(|source| MapError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let len = metadata.len();
        let identity = identity_of(&metadata);
        let map = map_file(path, &file, len)?;

        tracing::debug!(file = %path.display(), len, "Mapped file opened");

        Ok(MappedFile {
            path: path.to_path_buf(),
            file: Some(file),
            map,
            len,
            identity,
            generation: 0,
        })
    }

    /// The mapped bytes. Empty after `close` or for a zero-length file.
    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when no bytes are mapped.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Opaque counter incremented every time the slice is invalidated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Platform identity of the underlying file object, as a
    /// (device, file id) pair. Stored with import progress so rotation is
    /// detected across process restarts too.
    pub fn identity(&self) -> (u64, u64) {
        (self.identity.device, self.identity.file_id)
    }

    /// Path this mapping was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stat the path and bring the mapping up to date.
    ///
    /// - Identity change, or size below the mapped length: the file was
    ///   rotated or truncated. Reopens from scratch and reports `Rotated`.
    /// - Size above the mapped length: remaps from the still-open handle
    ///   and reports `Grew`.
    /// - Otherwise reports `None`.
    ///
    /// On error the previous mapping is left untouched and remains valid.
    pub fn remap_if_changed(&mut self) -> Result<MapChange, MapError> {
        let metadata = std::fs::metadata(&self.path).map_err(|source| stat_error(&self.path, source))?;
        let disk_len = metadata.len();
        let disk_identity = identity_of(&metadata);

        if disk_identity != self.identity || disk_len < self.len {
            // Rotated, or truncated in place. Either way the old bytes are
            // gone; start over with a fresh handle and mapping.
            let file = open_shared(&self.path)?;
            let fresh = file.metadata().map_err(|source| MapError::Io {
                path: self.path.clone(),
                source,
            })?;
            let len = fresh.len();
            let map = map_file(&self.path, &file, len)?;

            tracing::info!(
                file = %self.path.display(),
                old_len = self.len,
                new_len = len,
                "File rotated or truncated; remapped from scratch"
            );

            self.file = Some(file);
            self.map = map;
            self.len = len;
            self.identity = identity_of(&fresh);
            self.generation += 1;
            return Ok(MapChange::Rotated);
        }

        if disk_len > self.len {
            // Same identity, more bytes: remap using the handle we already
            // hold. The handle survives growth; only the view is replaced.
            // After `close` there is no handle, so reopen first.
            if self.file.is_none() {
                self.file = Some(open_shared(&self.path)?);
            }
            let file = self.file.as_ref().expect("handle ensured above");
            let map = map_file(&self.path, file, disk_len)?;

            tracing::debug!(
                file = %self.path.display(),
                old_len = self.len,
                new_len = disk_len,
                "File grew; remapped"
            );

            self.map = map;
            self.len = disk_len;
            self.generation += 1;
            return Ok(MapChange::Grew);
        }

        Ok(MapChange::None)
    }

    /// Lazily iterate complete newline-terminated lines in `[start, end)`.
    ///
    /// `end` is clamped to the mapped length. Each line's content slice has
    /// the trailing LF removed and a single optional preceding CR stripped;
    /// its `end` offset includes the LF. A trailing partial line (no LF) is
    /// not emitted.
    pub fn find_lines(&self, start: u64, end: u64) -> LineIter<'_> {
        let data = self.as_slice();
        let end = end.min(data.len() as u64) as usize;
        let start = (start as usize).min(end);
        LineIter {
            data,
            pos: start,
            end,
        }
    }

    /// Release the mapping and the file handle. Idempotent.
    pub fn close(&mut self) {
        self.map = None;
        self.file = None;
        self.len = 0;
        self.generation += 1;
    }
}

// =============================================================================
// Line iterator
// =============================================================================

/// One complete line from a mapped file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line<'a> {
    /// Line content without the terminating LF and without an optional
    /// preceding CR.
    pub content: &'a [u8],

    /// Byte offset of the first content byte.
    pub start: u64,

    /// Byte offset one past the terminating LF.
    pub end: u64,
}

/// Single-pass, allocation-free iterator over complete lines.
pub struct LineIter<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Iterator for LineIter<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Line<'a>> {
        if self.pos >= self.end {
            return None;
        }
        let window = &self.data[self.pos..self.end];
        let nl = window.iter().position(|&b| b == b'\n')?;

        let start = self.pos;
        let line_end = self.pos + nl + 1;
        let mut content = &self.data[start..start + nl];
        if content.last() == Some(&b'\r') {
            content = &content[..content.len() - 1];
        }
        self.pos = line_end;

        Some(Line {
            content,
            start: start as u64,
            end: line_end as u64,
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Open with sharing flags that keep the producer unblocked: other handles
/// may read, write, and delete the file while we hold ours.
fn open_shared(path: &Path) -> Result<File, MapError> {
    open_os(path).map_err(|source| stat_error(path, source))
}

#[cfg(windows)]
fn open_os(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    // FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
    std::fs::OpenOptions::new()
        .read(true)
        .share_mode(0x1 | 0x2 | 0x4)
        .open(path)
}

#[cfg(not(windows))]
fn open_os(path: &Path) -> io::Result<File> {
    File::open(path)
}

fn stat_error(path: &Path, source: io::Error) -> MapError {
    match source.kind() {
        io::ErrorKind::NotFound => MapError::FileMissing {
            path: path.to_path_buf(),
        },
        io::ErrorKind::PermissionDenied => MapError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        },
        _ => MapError::Io {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Map `len` bytes of `file`. Zero-length files are represented as `None`
/// (mapping an empty file is rejected by some platforms).
fn map_file(path: &Path, file: &File, len: u64) -> Result<Option<Mmap>, MapError> {
    if len == 0 {
        return Ok(None);
    }
    // Safety: the mapping is read-only and the producer is append-only by
    // contract; bytes below `len` are never rewritten in place. Truncation
    // is detected by `remap_if_changed` before the next read.
    let map = unsafe { MmapOptions::new().len(len as usize).map(file) };
    map.map(Some).map_err(|source| MapError::MapFailed {
        path: path.to_path_buf(),
        source,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn temp_log(content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.jsonl");
        fs::write(&path, content).expect("write log");
        (dir, path)
    }

    #[test]
    fn test_open_and_slice() {
        let (_dir, path) = temp_log(b"one\ntwo\n");
        let mapped = MappedFile::open(&path).unwrap();
        assert_eq!(mapped.len(), 8);
        assert_eq!(mapped.as_slice(), b"one\ntwo\n");
        assert_eq!(mapped.generation(), 0);
    }

    #[test]
    fn test_open_empty_file() {
        let (_dir, path) = temp_log(b"");
        let mapped = MappedFile::open(&path).unwrap();
        assert!(mapped.is_empty());
        assert_eq!(mapped.as_slice(), b"");
        assert_eq!(mapped.find_lines(0, 0).count(), 0);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = MappedFile::open(&dir.path().join("absent.jsonl"));
        assert!(matches!(result, Err(MapError::FileMissing { .. })));
    }

    #[test]
    fn test_line_iteration_offsets() {
        let (_dir, path) = temp_log(b"alpha\nbeta\n");
        let mapped = MappedFile::open(&path).unwrap();
        let lines: Vec<_> = mapped.find_lines(0, mapped.len()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].content, b"alpha");
        assert_eq!((lines[0].start, lines[0].end), (0, 6));
        assert_eq!(lines[1].content, b"beta");
        assert_eq!((lines[1].start, lines[1].end), (6, 11));
    }

    #[test]
    fn test_crlf_normalised_but_offsets_keep_cr() {
        let (_dir, path) = temp_log(b"a\r\nb\n");
        let mapped = MappedFile::open(&path).unwrap();
        let lines: Vec<_> = mapped.find_lines(0, mapped.len()).collect();
        assert_eq!(lines[0].content, b"a");
        // end includes both CR and LF bytes.
        assert_eq!((lines[0].start, lines[0].end), (0, 3));
        assert_eq!(lines[1].content, b"b");
        assert_eq!((lines[1].start, lines[1].end), (3, 5));
    }

    #[test]
    fn test_partial_trailing_line_not_emitted() {
        let (_dir, path) = temp_log(b"full\npartial");
        let mapped = MappedFile::open(&path).unwrap();
        let lines: Vec<_> = mapped.find_lines(0, mapped.len()).collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].content, b"full");
    }

    #[test]
    fn test_find_lines_from_offset() {
        let (_dir, path) = temp_log(b"one\ntwo\nthree\n");
        let mapped = MappedFile::open(&path).unwrap();
        let lines: Vec<_> = mapped.find_lines(4, mapped.len()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].content, b"two");
        assert_eq!(lines[0].start, 4);
    }

    #[test]
    fn test_growth_remaps_and_bumps_generation() {
        let (_dir, path) = temp_log(b"one\n");
        let mut mapped = MappedFile::open(&path).unwrap();
        assert_eq!(mapped.remap_if_changed().unwrap(), MapChange::None);

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"two\n").unwrap();
        f.flush().unwrap();
        drop(f);

        assert_eq!(mapped.remap_if_changed().unwrap(), MapChange::Grew);
        assert_eq!(mapped.len(), 8);
        assert_eq!(mapped.as_slice(), b"one\ntwo\n");
        assert_eq!(mapped.generation(), 1);
    }

    #[test]
    fn test_truncation_reports_rotated() {
        let (_dir, path) = temp_log(b"one\ntwo\n");
        let mut mapped = MappedFile::open(&path).unwrap();

        // Shrink in place: same identity, smaller size.
        let f = fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(4).unwrap();
        drop(f);

        assert_eq!(mapped.remap_if_changed().unwrap(), MapChange::Rotated);
        assert_eq!(mapped.len(), 4);
    }

    #[test]
    fn test_replacement_file_reports_rotated() {
        let (_dir, path) = temp_log(b"old contents\n");
        let mut mapped = MappedFile::open(&path).unwrap();

        fs::remove_file(&path).unwrap();
        fs::write(&path, b"new contents that are longer\n").unwrap();

        assert_eq!(mapped.remap_if_changed().unwrap(), MapChange::Rotated);
        assert_eq!(mapped.as_slice(), b"new contents that are longer\n");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_dir, path) = temp_log(b"one\n");
        let mut mapped = MappedFile::open(&path).unwrap();
        mapped.close();
        mapped.close();
        assert!(mapped.is_empty());
        assert_eq!(mapped.as_slice(), b"");
    }
}
