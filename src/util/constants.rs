// Convodex - util/constants.rs
//
// Single source of truth for all named constants, limits, and defaults.

// =============================================================================
// Application metadata
// =============================================================================

/// Application display name.
pub const APP_NAME: &str = "Convodex";

/// Application identifier used for config/data directories.
pub const APP_ID: &str = "Convodex";

/// Current application version (reported in the protocol `hello`).
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version reported in the `hello` object.
pub const PROTOCOL_VERSION: u32 = 1;

/// Methods advertised in the `hello` capabilities list.
pub const CAPABILITIES: &[&str] = &[
    "build_index",
    "list_sessions",
    "list",
    "search",
    "extract",
    "cancel",
];

// =============================================================================
// Default locations
// =============================================================================

/// Directory under the user's home that holds the database and log roots.
pub const HOME_DATA_DIR_NAME: &str = ".claude";

/// Database file name inside the data directory.
pub const DATABASE_FILE_NAME: &str = "extractor.db";

/// Default scan root, relative to the data directory.
pub const PROJECTS_DIR_NAME: &str = "projects";

/// Default directory for exported conversations, inside the data directory.
pub const EXTRACTS_DIR_NAME: &str = "extracts";

/// Configuration file name (in the platform config directory).
pub const CONFIG_FILE_NAME: &str = "config.toml";

// =============================================================================
// Block index sidecar
// =============================================================================

/// Magic bytes at the start of a `.bix` sidecar.
pub const BIX_MAGIC: [u8; 4] = *b"BIX1";

/// Sidecar format version.
pub const BIX_VERSION: u8 = 1;

/// Fixed sidecar header size in bytes.
pub const BIX_HEADER_LEN: usize = 64;

/// Lines per block: one offset is recorded every this many lines.
pub const BIX_BLOCK_SIZE: u16 = 256;

/// Sidecar file extension, appended to the log file name.
pub const BIX_EXTENSION: &str = "bix";

// =============================================================================
// Import limits
// =============================================================================

/// Maximum length of a single JSONL line. Longer lines are skipped without
/// aborting the file.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024; // 8 MiB

/// Message inserts per write transaction. Committing at least this often
/// bounds write-lock hold time.
pub const IMPORT_BATCH_SIZE: usize = 5_000;

/// Maximum number of files accepted from a single scan.
pub const MAX_SCAN_FILES: usize = 10_000;

/// Include glob for the filesystem scan.
pub const SCAN_INCLUDE_PATTERN: &str = "*.jsonl";

/// Maximum directory recursion depth during the scan.
pub const SCAN_MAX_DEPTH: usize = 10;

// =============================================================================
// Store configuration
// =============================================================================

/// SQLite page size in bytes.
pub const DB_PAGE_SIZE: u32 = 8_192;

/// SQLite cache size; negative values are KiB (64 MiB here).
pub const DB_CACHE_SIZE_KIB: i64 = -65_536;

/// SQLite mmap window in bytes (256 MiB).
pub const DB_MMAP_BYTES: u64 = 256 * 1024 * 1024;

// =============================================================================
// Query defaults
// =============================================================================

/// Default page size for `extract` view mode.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Hard cap on a single page, whatever the caller asks for.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// Default result count for `search`.
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Hard cap on `search` results.
pub const MAX_SEARCH_LIMIT: usize = 200;

/// Tokens shown either side of a hit in FTS snippets.
pub const SEARCH_SNIPPET_TOKENS: u32 = 12;

// =============================================================================
// Protocol progress stages
// =============================================================================

/// Fixed progress values for the `build_index` stage events. Per-file import
/// progress is interpolated between `PROGRESS_IMPORT` and `PROGRESS_INDEX`.
pub const PROGRESS_SCAN: f64 = 0.0;
pub const PROGRESS_IMPORT: f64 = 0.2;
pub const PROGRESS_INDEX: f64 = 0.8;
pub const PROGRESS_COMPLETE: f64 = 1.0;

// =============================================================================
// Logging
// =============================================================================

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";
