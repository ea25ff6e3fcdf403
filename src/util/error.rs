// Convodex - util/error.rs
//
// Typed error hierarchy with context-preserving error chains.
// No string-based error propagation; all errors preserve the causal chain
// for diagnostic logging.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Top-level error type for all Convodex operations.
/// Errors are categorised by the subsystem that produced them.
#[derive(Debug)]
pub enum ConvodexError {
    /// Memory-mapped file open/remap failed.
    Map(MapError),

    /// Block-index sidecar read/write failed.
    Sidecar(SidecarError),

    /// Database operation failed.
    Store(StoreError),

    /// Import of a source file failed.
    Import(ImportError),

    /// Filesystem scan failed.
    Scan(ScanError),

    /// Export serialisation failed.
    Export(ExportError),

    /// Configuration loading or validation failed.
    Config(ConfigError),

    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: io::Error,
    },
}

impl fmt::Display for ConvodexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(e) => write!(f, "Mapped file error: {e}"),
            Self::Sidecar(e) => write!(f, "Block index error: {e}"),
            Self::Store(e) => write!(f, "Store error: {e}"),
            Self::Import(e) => write!(f, "Import error: {e}"),
            Self::Scan(e) => write!(f, "Scan error: {e}"),
            Self::Export(e) => write!(f, "Export error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Io {
                path,
                operation,
                source,
            } => write!(
                f,
                "I/O error during {operation} on '{}': {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for ConvodexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Map(e) => Some(e),
            Self::Sidecar(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Import(e) => Some(e),
            Self::Scan(e) => Some(e),
            Self::Export(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Io { source, .. } => Some(source),
        }
    }
}

// ---------------------------------------------------------------------------
// Mapped-file errors
// ---------------------------------------------------------------------------

/// Errors from opening and remapping log files.
#[derive(Debug)]
pub enum MapError {
    /// The file does not exist.
    FileMissing { path: PathBuf },

    /// Permission denied opening the file.
    PermissionDenied { path: PathBuf, source: io::Error },

    /// Any other I/O failure around open/stat.
    Io { path: PathBuf, source: io::Error },

    /// The OS refused to create the mapping.
    MapFailed { path: PathBuf, source: io::Error },
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileMissing { path } => {
                write!(f, "'{}' does not exist", path.display())
            }
            Self::PermissionDenied { path, source } => {
                write!(f, "Permission denied for '{}': {source}", path.display())
            }
            Self::Io { path, source } => {
                write!(f, "'{}': I/O error: {source}", path.display())
            }
            Self::MapFailed { path, source } => {
                write!(f, "Cannot map '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PermissionDenied { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
            Self::MapFailed { source, .. } => Some(source),
            Self::FileMissing { .. } => None,
        }
    }
}

impl From<MapError> for ConvodexError {
    fn from(e: MapError) -> Self {
        Self::Map(e)
    }
}

// ---------------------------------------------------------------------------
// Sidecar errors
// ---------------------------------------------------------------------------

/// Errors from the `.bix` block-index sidecar.
///
/// Load failures are not errors: a missing or invalid sidecar silently
/// degrades to an empty index and is rebuilt.
#[derive(Debug)]
pub enum SidecarError {
    /// The temp-file + rename persist step failed.
    Persist { path: PathBuf, source: io::Error },
}

impl fmt::Display for SidecarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persist { path, source } => {
                write!(f, "Cannot persist '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for SidecarError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persist { source, .. } => Some(source),
        }
    }
}

impl From<SidecarError> for ConvodexError {
    fn from(e: SidecarError) -> Self {
        Self::Sidecar(e)
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from the embedded database.
#[derive(Debug)]
pub enum StoreError {
    /// The database file could not be opened or configured.
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// A statement or transaction failed.
    Query { source: rusqlite::Error },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { path, source } => {
                write!(f, "Cannot open database '{}': {source}", path.display())
            }
            Self::Query { source } => write!(f, "Query failed: {source}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } | Self::Query { source } => Some(source),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Query { source }
    }
}

impl From<StoreError> for ConvodexError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<rusqlite::Error> for ConvodexError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Store(StoreError::Query { source })
    }
}

// ---------------------------------------------------------------------------
// Import errors
// ---------------------------------------------------------------------------

/// Errors that abort the import of one source file.
///
/// Per-line parse failures are NOT errors: they are skipped and counted
/// (see `ImportOutcome::skipped_lines`).
#[derive(Debug)]
pub enum ImportError {
    /// Mapped-file failure for the file being imported.
    Map { path: PathBuf, source: MapError },

    /// Database failure; the open batch was rolled back.
    Store { path: PathBuf, source: StoreError },
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map { path, source } => {
                write!(f, "'{}': {source}", path.display())
            }
            Self::Store { path, source } => {
                write!(f, "'{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Map { source, .. } => Some(source),
            Self::Store { source, .. } => Some(source),
        }
    }
}

impl From<ImportError> for ConvodexError {
    fn from(e: ImportError) -> Self {
        Self::Import(e)
    }
}

// ---------------------------------------------------------------------------
// Scan errors
// ---------------------------------------------------------------------------

/// Errors related to the filesystem scan.
#[derive(Debug)]
pub enum ScanError {
    /// The scan root does not exist.
    RootNotFound { path: PathBuf },

    /// The scan root is not a directory.
    NotADirectory { path: PathBuf },

    /// Maximum file count exceeded during the scan.
    MaxFilesExceeded { max: usize },
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RootNotFound { path } => {
                write!(f, "Scan path '{}' does not exist", path.display())
            }
            Self::NotADirectory { path } => {
                write!(f, "Scan path '{}' is not a directory", path.display())
            }
            Self::MaxFilesExceeded { max } => {
                write!(
                    f,
                    "Scan stopped: exceeded maximum of {max} files. \
                     Narrow the scan root."
                )
            }
        }
    }
}

impl std::error::Error for ScanError {}

impl From<ScanError> for ConvodexError {
    fn from(e: ScanError) -> Self {
        Self::Scan(e)
    }
}

// ---------------------------------------------------------------------------
// Export errors
// ---------------------------------------------------------------------------

/// Errors related to export operations.
#[derive(Debug)]
pub enum ExportError {
    /// I/O error writing the export file.
    Io { path: PathBuf, source: io::Error },

    /// JSON serialisation error.
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "Export I/O error '{}': {source}", path.display())
            }
            Self::Json { path, source } => {
                write!(f, "JSON export error '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json { source, .. } => Some(source),
        }
    }
}

impl From<ExportError> for ConvodexError {
    fn from(e: ExportError) -> Self {
        Self::Export(e)
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Errors related to configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// TOML parsing failed.
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// I/O error reading the config file.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TomlParse { path, source } => {
                write!(f, "Config parse error '{}': {source}", path.display())
            }
            Self::Io { path, source } => {
                write!(f, "Config I/O error '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TomlParse { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
        }
    }
}

impl From<ConfigError> for ConvodexError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// Convenience type alias for Convodex results.
pub type Result<T> = std::result::Result<T, ConvodexError>;
