// Convodex - core/block_index.rs
//
// On-disk sidecar (`<log-file>.bix`) recording byte offsets at every 256th
// line of a log file, so a line number resolves to a byte offset in O(1).
// Updated incrementally as the log grows; persisted atomically via
// temp-file + rename so readers never observe a half-written index.
//
// File format (little-endian), fixed 64-byte header then a dense offset
// array:
//
//   [0..4)    magic "BIX1"
//   [4]       version (1)
//   [5..7)    block_size (lines per block, u16)
//   [7]       reserved (0)
//   [8..16)   total_lines (u64)
//   [16..24)  last_byte (u64, end offset of the last indexed line)
//   [24..28)  checksum (crc32 over log bytes [0, last_byte))
//   [28..64)  reserved (zero)
//
// The body holds total_lines / block_size offsets; entry k is the start
// byte of line (k+1) * block_size, appended the moment the line count
// reaches that multiple.

use crate::core::mapped_file::MappedFile;
use crate::util::constants::{BIX_BLOCK_SIZE, BIX_EXTENSION, BIX_HEADER_LEN, BIX_MAGIC, BIX_VERSION};
use crate::util::error::SidecarError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// In-memory block index for one log file.
#[derive(Debug)]
pub struct BlockIndex {
    /// Sidecar path (`<log-file>.bix`).
    path: PathBuf,
    block_size: u16,
    total_lines: u64,
    last_byte: u64,
    checksum: u32,
    /// Start offsets of lines `block_size`, `2*block_size`, ...
    offsets: Vec<u64>,
}

impl BlockIndex {
    /// Sidecar path for a log file: the log's file name with `.bix` appended.
    pub fn sidecar_path(log_path: &Path) -> PathBuf {
        let mut name = log_path.as_os_str().to_os_string();
        name.push(".");
        name.push(BIX_EXTENSION);
        PathBuf::from(name)
    }

    /// Load the sidecar for `log_path`, or return an empty index when the
    /// sidecar is missing or fails validation. Corruption is never fatal;
    /// the index is simply rebuilt from byte 0 on the next append.
    pub fn load_or_empty(log_path: &Path) -> BlockIndex {
        let path = Self::sidecar_path(log_path);
        match Self::read(&path) {
            Some(index) => index,
            None => {
                tracing::debug!(
                    sidecar = %path.display(),
                    "Sidecar missing or invalid; starting empty"
                );
                Self::empty(path)
            }
        }
    }

    fn empty(path: PathBuf) -> BlockIndex {
        BlockIndex {
            path,
            block_size: BIX_BLOCK_SIZE,
            total_lines: 0,
            last_byte: 0,
            checksum: 0,
            offsets: Vec::new(),
        }
    }

    fn read(path: &Path) -> Option<BlockIndex> {
        let bytes = fs::read(path).ok()?;
        if bytes.len() < BIX_HEADER_LEN {
            return None;
        }

        if bytes[0..4] != BIX_MAGIC || bytes[4] != BIX_VERSION {
            return None;
        }
        let block_size = u16::from_le_bytes([bytes[5], bytes[6]]);
        if block_size == 0 {
            return None;
        }
        let total_lines = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        let last_byte = u64::from_le_bytes(bytes[16..24].try_into().ok()?);
        let checksum = u32::from_le_bytes(bytes[24..28].try_into().ok()?);

        // The body must hold exactly one offset per completed block.
        let expected = (total_lines / u64::from(block_size)) as usize;
        let body = &bytes[BIX_HEADER_LEN..];
        if body.len() != expected * 8 {
            return None;
        }

        let mut offsets = Vec::with_capacity(expected);
        for chunk in body.chunks_exact(8) {
            offsets.push(u64::from_le_bytes(chunk.try_into().ok()?));
        }

        Some(BlockIndex {
            path: path.to_path_buf(),
            block_size,
            total_lines,
            last_byte,
            checksum,
            offsets,
        })
    }

    /// Count of complete lines indexed so far.
    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    /// End offset (exclusive) of the last indexed line.
    pub fn last_byte(&self) -> u64 {
        self.last_byte
    }

    /// Rolling crc32 over log bytes `[0, last_byte)`.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Start byte of the block containing `line_no` (0-based line index).
    ///
    /// `Some(0)` for line 0; `None` when the containing block has not been
    /// completed yet. Used for seeking; the importer does not depend on it.
    pub fn line_offset(&self, line_no: u64) -> Option<u64> {
        let block = line_no / u64::from(self.block_size);
        if block == 0 {
            return Some(0);
        }
        self.offsets.get(block as usize - 1).copied()
    }

    /// Check the recorded progress against the current mapped bytes.
    ///
    /// False when `last_byte` exceeds the file, or when the checksum over
    /// `[0, last_byte)` no longer matches; both mean the prefix this index
    /// summarises has been replaced and the index must be rebuilt.
    pub fn verify_against(&self, mapped: &MappedFile) -> bool {
        if self.last_byte == 0 {
            return true;
        }
        if self.last_byte > mapped.len() {
            return false;
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&mapped.as_slice()[..self.last_byte as usize]);
        hasher.finalize() == self.checksum
    }

    /// Discard all progress (the log was rotated). The sidecar on disk is
    /// rewritten on the next successful `append_incremental`.
    pub fn reset(&mut self) {
        self.total_lines = 0;
        self.last_byte = 0;
        self.checksum = 0;
        self.offsets.clear();
    }

    /// Index all complete lines appended since `last_byte`, extending the
    /// rolling checksum and recording one offset per completed block, then
    /// persist atomically. Returns the number of newly indexed lines.
    ///
    /// On persist failure the in-memory state is rolled back so the next
    /// attempt retries from the same position.
    pub fn append_incremental(&mut self, mapped: &MappedFile) -> Result<u64, SidecarError> {
        let rollback = (self.total_lines, self.last_byte, self.checksum, self.offsets.len());

        let data = mapped.as_slice();
        let mut hasher = crc32fast::Hasher::new_with_initial(self.checksum);
        let mut new_lines = 0u64;

        for line in mapped.find_lines(self.last_byte, mapped.len()) {
            // Checksum covers the full line span, terminator included.
            hasher.update(&data[line.start as usize..line.end as usize]);
            self.total_lines += 1;
            new_lines += 1;
            if self.total_lines % u64::from(self.block_size) == 0 {
                self.offsets.push(line.end);
            }
            self.last_byte = line.end;
        }

        if new_lines == 0 {
            return Ok(0);
        }
        self.checksum = hasher.finalize();

        if let Err(e) = self.persist_atomic() {
            let (lines, byte, sum, offs) = rollback;
            self.total_lines = lines;
            self.last_byte = byte;
            // The pre-append checksum state is still what is on disk.
            self.checksum = sum;
            self.offsets.truncate(offs);
            return Err(e);
        }

        tracing::debug!(
            sidecar = %self.path.display(),
            new_lines,
            total_lines = self.total_lines,
            last_byte = self.last_byte,
            "Sidecar advanced"
        );

        Ok(new_lines)
    }

    /// Write header + body to `{path}.tmp`, flush, rename over the target.
    fn persist_atomic(&self) -> Result<(), SidecarError> {
        let mut buf = Vec::with_capacity(BIX_HEADER_LEN + self.offsets.len() * 8);
        buf.extend_from_slice(&BIX_MAGIC);
        buf.push(BIX_VERSION);
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.total_lines.to_le_bytes());
        buf.extend_from_slice(&self.last_byte.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.resize(BIX_HEADER_LEN, 0);
        for offset in &self.offsets {
            buf.extend_from_slice(&offset.to_le_bytes());
        }

        let tmp = self.path.with_extension(format!("{BIX_EXTENSION}.tmp"));
        let persist = |tmp: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
            fs::rename(tmp, &self.path)
        };

        persist(&tmp).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            SidecarError::Persist {
                path: self.path.clone(),
                source,
            }
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
