// Convodex - main.rs
//
// CLI wrapper around the protocol server. Handles:
// 1. CLI argument parsing
// 2. Configuration and platform path resolution
// 3. Logging initialisation (stderr; stdout is the protocol channel)
// 4. Store open and the stdin reader thread
//
// Exit codes: 0 on clean stdin EOF; 1 on startup failure (before `hello`)
// or on a broken output channel. Protocol-level errors never terminate the
// process.

use clap::Parser;
use convodex::app::server::Server;
use convodex::app::store::Store;
use convodex::platform::config::{load_config, PlatformPaths};
use convodex::util::{constants, logging};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;

/// Convodex - incremental indexer and search server for JSONL
/// conversation logs.
///
/// Watches a directory of append-only JSONL logs, maintains a searchable
/// SQLite index, and answers line-delimited JSON requests on stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "convodex", version, about)]
struct Cli {
    /// Default scan root (overrides the configured projects directory).
    root: Option<PathBuf>,

    /// Database file location.
    #[arg(long = "db")]
    db: Option<PathBuf>,

    /// Enable debug logging (equivalent to RUST_LOG=debug).
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    // Config first so its log level can feed the filter; config loading
    // itself only logs at debug, nothing is lost before init.
    let config = load_config();
    logging::init(cli.debug, config.logging.level.as_deref());

    tracing::info!(
        version = constants::APP_VERSION,
        debug = cli.debug,
        "Convodex starting"
    );

    let mut paths = PlatformPaths::resolve(&config, cli.db.as_deref());
    if let Some(root) = cli.root {
        paths.projects_root = root;
    }

    // Startup failures end the process before `hello` is emitted.
    if let Some(parent) = paths.database_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(dir = %parent.display(), error = %e, "Cannot create data directory");
            eprintln!("Error: cannot create '{}': {e}", parent.display());
            std::process::exit(1);
        }
    }

    let store = match Store::open(&paths.database_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Cannot open database");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // Reader thread: one raw line per channel message, closing the channel
    // on stdin EOF. The server thread owns everything else.
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Stdin read error; closing input");
                    break;
                }
            }
        }
    });

    let mut server = match Server::new(store, paths, rx, std::io::stdout()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Server startup failed");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        tracing::error!(error = %e, "Server terminated abnormally");
        std::process::exit(1);
    }
}
