// Convodex - platform/config.rs
//
// Platform path resolution and optional configuration file.
//
// The database and default scan root live under `<home>/.claude/` for
// compatibility with the log producer; the config file follows platform
// convention (XDG on Linux, AppData on Windows, Library on macOS) via the
// `directories` crate.
//
// Bad configuration never aborts startup: an unreadable or unparseable
// config file logs a warning and falls back to defaults. Startup fails
// only when the database itself cannot be opened.

use crate::util::constants;
use directories::{ProjectDirs, UserDirs};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// =============================================================================
// Config file
// =============================================================================

/// Contents of the optional `config.toml`. Every field is optional;
/// unknown keys are ignored.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub scan: ScanConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Overrides the default `<home>/.claude/extractor.db`.
    pub database_path: Option<PathBuf>,

    /// Overrides the default `<home>/.claude/extracts/`.
    pub extract_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Overrides the default `<home>/.claude/projects/`.
    pub projects_root: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level when RUST_LOG and --debug are absent.
    pub level: Option<String>,
}

/// Platform-conventional location of the config file.
pub fn config_file_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", constants::APP_ID)
        .map(|dirs| dirs.config_dir().join(constants::CONFIG_FILE_NAME))
}

/// Load the config file, falling back to defaults on any failure.
pub fn load_config() -> Config {
    let Some(path) = config_file_path() else {
        tracing::debug!("No platform config directory; using defaults");
        return Config::default();
    };
    load_config_from(&path)
}

fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(text) => match toml::from_str::<Config>(&text) {
            Ok(config) => {
                tracing::debug!(config = %path.display(), "Configuration loaded");
                config
            }
            Err(e) => {
                tracing::warn!(
                    config = %path.display(),
                    error = %e,
                    "Invalid config file; using defaults"
                );
                Config::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            tracing::warn!(
                config = %path.display(),
                error = %e,
                "Cannot read config file; using defaults"
            );
            Config::default()
        }
    }
}

// =============================================================================
// Resolved paths
// =============================================================================

/// Fully resolved filesystem locations for this run.
#[derive(Debug, Clone)]
pub struct PlatformPaths {
    /// SQLite database file.
    pub database_path: PathBuf,

    /// Default scan root when a request names none.
    pub projects_root: PathBuf,

    /// Destination directory for exported conversations.
    pub extract_dir: PathBuf,
}

impl PlatformPaths {
    /// Resolve paths with precedence: CLI override > config file > default.
    ///
    /// Falls back to the current directory when no home directory can be
    /// determined.
    pub fn resolve(config: &Config, cli_database: Option<&Path>) -> Self {
        let data_dir = UserDirs::new()
            .map(|dirs| dirs.home_dir().join(constants::HOME_DATA_DIR_NAME))
            .unwrap_or_else(|| {
                tracing::warn!("Could not determine home directory, using current directory");
                PathBuf::from(".").join(constants::HOME_DATA_DIR_NAME)
            });

        let database_path = cli_database
            .map(Path::to_path_buf)
            .or_else(|| config.storage.database_path.clone())
            .unwrap_or_else(|| data_dir.join(constants::DATABASE_FILE_NAME));

        let projects_root = config
            .scan
            .projects_root
            .clone()
            .unwrap_or_else(|| data_dir.join(constants::PROJECTS_DIR_NAME));

        let extract_dir = config
            .storage
            .extract_dir
            .clone()
            .unwrap_or_else(|| data_dir.join(constants::EXTRACTS_DIR_NAME));

        tracing::debug!(
            database = %database_path.display(),
            projects = %projects_root.display(),
            extracts = %extract_dir.display(),
            "Platform paths resolved"
        );

        PlatformPaths {
            database_path,
            projects_root,
            extract_dir,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
