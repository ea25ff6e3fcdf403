// Convodex - app/server.rs
//
// Line-delimited JSON protocol on stdin/stdout.
//
// One request is served at a time, to completion, in submission order. A
// dedicated reader thread (spawned by main) feeds raw lines through a
// channel; while a long-running request is in flight the handler drains
// that channel at coarse intervals so a `cancel` can interrupt it, and
// every other request received early is queued for its turn.
//
// Stdout carries protocol objects only; diagnostics go to stderr via
// tracing.

use crate::app::export::{self, ExportFormat};
use crate::app::importer::Importer;
use crate::app::scan::{self, resolve_root};
use crate::app::store::Store;
use crate::app::tail::get_messages_with_tail;
use crate::core::model::{conversation_id_for_path, ScanEntry, SearchHit};
use crate::platform::config::PlatformPaths;
use crate::util::constants::{
    APP_VERSION, CAPABILITIES, DEFAULT_PAGE_SIZE, DEFAULT_SEARCH_LIMIT, MAX_PAGE_SIZE,
    MAX_SEARCH_LIMIT, PROGRESS_COMPLETE, PROGRESS_IMPORT, PROGRESS_INDEX, PROGRESS_SCAN,
    PROTOCOL_VERSION,
};
use crate::util::error::{ConvodexError, ImportError, ScanError};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};

// =============================================================================
// Error codes (protocol taxonomy)
// =============================================================================

mod code {
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    pub const INDEX_REQUIRED: &str = "INDEX_REQUIRED";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const CANCELLED: &str = "CANCELLED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

// =============================================================================
// Session registry
// =============================================================================

/// Protocol-visible alias for one scanned file: `session_N` is the index
/// into the most-recent-first scan ordering.
#[derive(Debug, Clone)]
struct SessionEntry {
    path: PathBuf,
    name: String,
    conversation_id: String,
    size: u64,
    mtime: i64,
}

// =============================================================================
// Server
// =============================================================================

/// The protocol server. Generic over the output sink so tests can drive it
/// against an in-memory buffer.
pub struct Server<W: Write> {
    store: Store,
    importer: Importer,
    paths: PlatformPaths,
    out: W,
    input: Receiver<String>,
    /// Requests received while another request was being served.
    queue: VecDeque<String>,
    /// Single-bit cancellation state polled by long-running operations.
    cancel: AtomicBool,
    sessions: Vec<SessionEntry>,
    index_built: bool,
}

impl<W: Write> Server<W> {
    /// Build a server over an open store. `input` receives one raw request
    /// line per message and closes when stdin does.
    pub fn new(
        store: Store,
        paths: PlatformPaths,
        input: Receiver<String>,
        out: W,
    ) -> Result<Self, ConvodexError> {
        // A previously built index keeps serving searches after a restart.
        let index_built = store.source_file_count()? > 0;
        Ok(Server {
            store,
            importer: Importer::new(),
            paths,
            out,
            input,
            queue: VecDeque::new(),
            cancel: AtomicBool::new(false),
            sessions: Vec::new(),
            index_built,
        })
    }

    /// Emit `hello`, then serve requests until the input channel closes.
    pub fn run(&mut self) -> Result<(), ConvodexError> {
        self.emit_hello()?;
        while let Some(line) = self.next_line() {
            self.handle_line(&line)?;
        }
        self.importer.close_all();
        tracing::info!("Input closed; server shutting down");
        Ok(())
    }

    fn next_line(&mut self) -> Option<String> {
        if let Some(queued) = self.queue.pop_front() {
            return Some(queued);
        }
        self.input.recv().ok()
    }

    // -------------------------------------------------------------------------
    // Output
    // -------------------------------------------------------------------------

    fn emit(&mut self, value: &Value) -> Result<(), ConvodexError> {
        let io_err = |source| ConvodexError::Io {
            path: PathBuf::from("<stdout>"),
            operation: "write response",
            source,
        };
        let line = serde_json::to_string(value).map_err(|e| ConvodexError::Io {
            path: PathBuf::from("<stdout>"),
            operation: "serialise response",
            source: std::io::Error::other(e),
        })?;
        writeln!(self.out, "{line}").map_err(io_err)?;
        self.out.flush().map_err(io_err)
    }

    fn emit_hello(&mut self) -> Result<(), ConvodexError> {
        self.emit(&json!({
            "type": "hello",
            "core_version": APP_VERSION,
            "protocol": PROTOCOL_VERSION,
            "capabilities": CAPABILITIES,
        }))
    }

    fn emit_event(&mut self, id: &Value, stage: &str, progress: f64) -> Result<(), ConvodexError> {
        self.emit(&json!({
            "id": id, "type": "event", "stage": stage, "progress": progress,
        }))
    }

    fn emit_result(&mut self, id: &Value, data: Value) -> Result<(), ConvodexError> {
        self.emit(&json!({ "id": id, "type": "result", "data": data }))
    }

    fn emit_error(&mut self, id: &Value, code: &str, message: &str) -> Result<(), ConvodexError> {
        tracing::debug!(code, message, "Request failed");
        self.emit(&json!({
            "id": id, "type": "error",
            "error": { "code": code, "message": message },
        }))
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Serve exactly one raw request line to completion: any progress
    /// events first, then the terminal result or error. `run` calls this
    /// for every line; callers that need to mutate the filesystem between
    /// requests can drive it directly.
    pub fn handle_line(&mut self, line: &str) -> Result<(), ConvodexError> {
        if line.trim().is_empty() {
            return Ok(());
        }

        let envelope: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                return self.emit_error(&Value::Null, code::BAD_REQUEST, &format!("invalid JSON: {e}"));
            }
        };

        // Correlate by the original id; integer ids are coerced to their
        // decimal string form where a string key is needed.
        let id = envelope.get("id").cloned().unwrap_or(Value::Null);
        if !(id.is_string() || id.is_i64() || id.is_u64()) {
            return self.emit_error(&Value::Null, code::BAD_REQUEST, "missing or invalid 'id'");
        }

        let Some(method) = envelope.get("method").and_then(Value::as_str).map(String::from) else {
            return self.emit_error(&id, code::BAD_REQUEST, "missing or invalid 'method'");
        };

        let params = match envelope.get("params") {
            None | Some(Value::Null) => Value::Null,
            Some(p @ Value::Object(_)) => p.clone(),
            Some(_) => {
                return self.emit_error(&id, code::BAD_REQUEST, "'params' must be an object");
            }
        };

        tracing::debug!(method = %method, "Request received");

        // A stale cancellation must not leak into the request now starting.
        if method != "cancel" {
            self.cancel.store(false, Ordering::SeqCst);
        }

        match method.as_str() {
            "build_index" => self.handle_build_index(&id, &params),
            "list_sessions" | "list" => self.handle_list_sessions(&id, &params),
            "search" => self.handle_search(&id, &params),
            "extract" => self.handle_extract(&id, &params),
            "cancel" => {
                self.cancel.store(true, Ordering::SeqCst);
                self.emit_result(&id, json!("cancelled"))
            }
            other => self.emit_error(&id, code::UNKNOWN_METHOD, &format!("unknown method '{other}'")),
        }
    }

    /// Drain pending input without blocking. Cancels take effect
    /// immediately (flag + their own result); everything else waits its
    /// turn in the queue.
    fn poll_control(&mut self) -> Result<(), ConvodexError> {
        loop {
            match self.input.try_recv() {
                Ok(line) => {
                    if let Some(cancel_id) = parse_cancel(&line) {
                        self.cancel.store(true, Ordering::SeqCst);
                        self.emit_result(&cancel_id, json!("cancelled"))?;
                    } else {
                        self.queue.push_back(line);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // build_index
    // -------------------------------------------------------------------------

    fn handle_build_index(&mut self, id: &Value, params: &Value) -> Result<(), ConvodexError> {
        let id = id.clone();
        self.emit_event(&id, "scan", PROGRESS_SCAN)?;

        let entries = match self.scan_sessions(params) {
            Ok(entries) => entries,
            Err(ScanError::NotADirectory { path }) => {
                return self.emit_error(
                    &id,
                    code::INVALID_PARAMS,
                    &format!("'{}' is not a directory", path.display()),
                );
            }
            Err(e) => {
                return self.emit_error(&id, code::INTERNAL_ERROR, &e.to_string());
            }
        };

        self.emit_event(&id, "import", PROGRESS_IMPORT)?;

        let total = entries.len();
        let mut files_attempted = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            // Cancellation granularity: once per file.
            self.poll_control()?;
            if self.cancelled() {
                tracing::info!(files_done = i, "build_index cancelled");
                return self.emit_error(&id, code::CANCELLED, "build_index cancelled");
            }

            files_attempted += 1;
            match self.importer.import_file(&self.store, &entry.path) {
                Ok(_) => {}
                Err(ImportError::Map { path, source }) => {
                    // Per-file I/O failure: this file is skipped, the run
                    // carries on.
                    tracing::warn!(file = %path.display(), error = %source, "File import failed");
                }
                Err(e @ ImportError::Store { .. }) => {
                    tracing::error!(error = %e, "Store failure during import");
                    return self.emit_error(&id, code::INTERNAL_ERROR, &e.to_string());
                }
            }

            let progress = PROGRESS_IMPORT
                + (PROGRESS_INDEX - PROGRESS_IMPORT) * ((i + 1) as f64 / (total + 1) as f64);
            self.emit_event(&id, "import", progress)?;
        }

        self.emit_event(&id, "index", PROGRESS_INDEX)?;
        if let Err(e) = self.store.fts_optimize() {
            tracing::warn!(error = %e, "FTS optimise failed");
        }

        let conversations = match self.store.conversation_count() {
            Ok(n) => n,
            Err(e) => return self.emit_error(&id, code::INTERNAL_ERROR, &e.to_string()),
        };

        self.index_built = true;
        self.emit_event(&id, "complete", PROGRESS_COMPLETE)?;
        self.emit_result(
            &id,
            json!({ "status": "ok", "conversations": conversations, "files": files_attempted }),
        )
    }

    // -------------------------------------------------------------------------
    // list_sessions
    // -------------------------------------------------------------------------

    fn handle_list_sessions(&mut self, id: &Value, params: &Value) -> Result<(), ConvodexError> {
        let id = id.clone();
        match self.scan_sessions(params) {
            Ok(_) => {
                let listing: Vec<Value> = self
                    .sessions
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        json!({
                            "id": format!("session_{i}"),
                            "path": s.path.to_string_lossy(),
                            "name": s.name,
                            "size": s.size,
                            "mtime": s.mtime,
                        })
                    })
                    .collect();
                self.emit_result(&id, Value::Array(listing))
            }
            Err(ScanError::NotADirectory { path }) => self.emit_error(
                &id,
                code::INVALID_PARAMS,
                &format!("'{}' is not a directory", path.display()),
            ),
            Err(e) => self.emit_error(&id, code::INTERNAL_ERROR, &e.to_string()),
        }
    }

    /// Run the filesystem scan for `params.root` and refresh the session
    /// registry. A missing root is served as an empty tree.
    fn scan_sessions(&mut self, params: &Value) -> Result<Vec<ScanEntry>, ScanError> {
        let requested = params.get("root").and_then(Value::as_str);
        let root = resolve_root(requested, &self.paths.projects_root);

        let entries = match scan::scan_logs(&root) {
            Ok(entries) => entries,
            Err(ScanError::RootNotFound { path }) => {
                tracing::debug!(root = %path.display(), "Scan root missing; empty result");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        self.sessions = entries
            .iter()
            .map(|e| SessionEntry {
                path: e.path.clone(),
                name: e
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                conversation_id: conversation_id_for_path(&e.path),
                size: e.size,
                mtime: e.mtime,
            })
            .collect();

        Ok(entries)
    }

    /// Sessions are scan-derived; after a restart the registry refills on
    /// first use from the default root.
    fn ensure_sessions(&mut self) {
        if self.sessions.is_empty() {
            let _ = self.scan_sessions(&Value::Null);
        }
    }

    // -------------------------------------------------------------------------
    // search
    // -------------------------------------------------------------------------

    fn handle_search(&mut self, id: &Value, params: &Value) -> Result<(), ConvodexError> {
        let id = id.clone();

        if !self.index_built {
            return self.emit_error(&id, code::INDEX_REQUIRED, "no index has been built yet");
        }

        let Some(query) = params
            .get("q")
            .or_else(|| params.get("query"))
            .and_then(Value::as_str)
            .map(String::from)
        else {
            return self.emit_error(&id, code::INVALID_PARAMS, "missing 'q' parameter");
        };

        let limit = match optional_usize(params, "limit") {
            Ok(l) => l.unwrap_or(DEFAULT_SEARCH_LIMIT).min(MAX_SEARCH_LIMIT),
            Err(msg) => return self.emit_error(&id, code::INVALID_PARAMS, &msg),
        };

        // Cancellation granularity: once before the page is produced.
        self.poll_control()?;
        if self.cancelled() {
            return self.emit_error(&id, code::CANCELLED, "search cancelled");
        }

        self.ensure_sessions();

        let hits = match self.store.search(&query, None, limit) {
            Ok(hits) => hits,
            Err(e) => return self.emit_error(&id, code::INTERNAL_ERROR, &e.to_string()),
        };
        // Per-session totals come from an unlimited aggregate; counting
        // the page itself would undercount any session whose hits were
        // crowded out by the result limit.
        let match_counts = match self.store.search_match_counts(&query) {
            Ok(counts) => counts,
            Err(e) => return self.emit_error(&id, code::INTERNAL_ERROR, &e.to_string()),
        };

        let results = self.render_hits(&hits, &match_counts);
        tracing::debug!(query = %query, hits = results.len(), "Search served");
        self.emit_result(&id, json!({ "results": results }))
    }

    fn render_hits(&self, hits: &[SearchHit], match_counts: &HashMap<String, i64>) -> Vec<Value> {
        // session index per conversation.
        let by_conversation: HashMap<&str, usize> = self
            .sessions
            .iter()
            .enumerate()
            .map(|(i, s)| (s.conversation_id.as_str(), i))
            .collect();

        hits.iter()
            .filter_map(|hit| {
                let Some(&session) = by_conversation.get(hit.conversation_id.as_str()) else {
                    // The conversation's file is gone from the scan root;
                    // it has no session alias to report.
                    tracing::debug!(conversation = %hit.conversation_id, "Hit without session");
                    return None;
                };
                Some(json!({
                    "session_id": format!("session_{session}"),
                    "session_name": self.sessions[session].name,
                    // bm25 is lower-is-better and negative; negate so
                    // higher scores are better hits.
                    "score": -hit.rank,
                    "snippet": hit.snippet,
                    "position": hit.position,
                    "match_count": match_counts
                        .get(hit.conversation_id.as_str())
                        .copied()
                        .unwrap_or(0),
                }))
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // extract
    // -------------------------------------------------------------------------

    fn handle_extract(&mut self, id: &Value, params: &Value) -> Result<(), ConvodexError> {
        let id = id.clone();
        self.ensure_sessions();

        let Some(session_id) = params.get("session_id").and_then(Value::as_str) else {
            return self.emit_error(&id, code::INVALID_PARAMS, "missing 'session_id' parameter");
        };
        let Some(index) = parse_session_index(session_id) else {
            return self.emit_error(
                &id,
                code::INVALID_PARAMS,
                &format!("malformed session id '{session_id}'"),
            );
        };
        let Some(session) = self.sessions.get(index).cloned() else {
            return self.emit_error(
                &id,
                code::SESSION_NOT_FOUND,
                &format!("no session at index {index}"),
            );
        };

        let format = match params.get("format").and_then(Value::as_str) {
            Some(name) => match ExportFormat::from_name(name) {
                Some(f) => f,
                None => {
                    return self.emit_error(
                        &id,
                        code::INVALID_PARAMS,
                        &format!("unknown format '{name}'"),
                    );
                }
            },
            None => return self.emit_error(&id, code::INVALID_PARAMS, "missing 'format' parameter"),
        };
        let export = params.get("export").and_then(Value::as_bool).unwrap_or(false);

        if export {
            self.serve_export(&id, &session, format)
        } else {
            if format != ExportFormat::Json {
                return self.emit_error(
                    &id,
                    code::INVALID_PARAMS,
                    "view mode requires format \"json\"",
                );
            }
            self.serve_view(&id, session_id, &session, params)
        }
    }

    /// View mode: one keyset page, newest first, tail overlay included.
    fn serve_view(
        &mut self,
        id: &Value,
        session_id: &str,
        session: &SessionEntry,
        params: &Value,
    ) -> Result<(), ConvodexError> {
        let limit = match optional_usize(params, "limit") {
            Ok(l) => l.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
            Err(msg) => return self.emit_error(id, code::INVALID_PARAMS, &msg),
        };
        let offset = match optional_usize(params, "offset") {
            Ok(o) => o.unwrap_or(0),
            Err(msg) => return self.emit_error(id, code::INVALID_PARAMS, &msg),
        };

        // Positions are contiguous, so a newest-first offset translates
        // exactly onto the position cursor once the live maximum (tail
        // included) is known.
        let probe = match get_messages_with_tail(&self.store, &mut self.importer, &session.conversation_id, i64::MAX, 1)
        {
            Ok(p) => p,
            Err(e) => return self.emit_error(id, code::INTERNAL_ERROR, &e.to_string()),
        };
        let before_position = if offset == 0 {
            i64::MAX
        } else {
            probe.newest_position.saturating_sub(offset as i64) + 1
        };

        let page = match get_messages_with_tail(
            &self.store,
            &mut self.importer,
            &session.conversation_id,
            before_position,
            limit,
        ) {
            Ok(p) => p,
            Err(e) => return self.emit_error(id, code::INTERNAL_ERROR, &e.to_string()),
        };

        let has_more = page.messages.last().is_some_and(|m| m.position > 1);
        let messages = match serde_json::to_value(&page.messages) {
            Ok(v) => v,
            Err(e) => return self.emit_error(id, code::INTERNAL_ERROR, &e.to_string()),
        };

        self.emit_result(
            id,
            json!({ "id": session_id, "messages": messages, "has_more": has_more }),
        )
    }

    /// Export mode: serialise the whole conversation to a file on disk.
    fn serve_export(
        &mut self,
        id: &Value,
        session: &SessionEntry,
        format: ExportFormat,
    ) -> Result<(), ConvodexError> {
        // Probe for the live message count, then fetch everything.
        let probe = match get_messages_with_tail(&self.store, &mut self.importer, &session.conversation_id, i64::MAX, 1)
        {
            Ok(p) => p,
            Err(e) => return self.emit_error(id, code::INTERNAL_ERROR, &e.to_string()),
        };
        let total = probe.newest_position.max(0) as usize;

        let page = match get_messages_with_tail(
            &self.store,
            &mut self.importer,
            &session.conversation_id,
            i64::MAX,
            total,
        ) {
            Ok(p) => p,
            Err(e) => return self.emit_error(id, code::INTERNAL_ERROR, &e.to_string()),
        };

        // Exports read oldest-first.
        let mut messages = page.messages;
        messages.reverse();

        let extract_dir = self.paths.extract_dir.clone();
        match export::write_export(&extract_dir, &session.conversation_id, format, &messages) {
            Ok(path) => self.emit_result(
                id,
                json!({ "path": path.to_string_lossy(), "format": format.name() }),
            ),
            Err(e) => self.emit_error(id, code::INTERNAL_ERROR, &e.to_string()),
        }
    }
}

// =============================================================================
// Envelope helpers
// =============================================================================

/// Parse `session_N` into its ordinal.
fn parse_session_index(session_id: &str) -> Option<usize> {
    session_id.strip_prefix("session_")?.parse().ok()
}

/// Non-negative integer parameter, absent is fine, anything else is not.
fn optional_usize(params: &Value, key: &str) -> Result<Option<usize>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(n) => Ok(Some(n as usize)),
            None => Err(format!("'{key}' must be a non-negative integer")),
        },
    }
}

/// Cheap peek used while another request is in flight: is this line a
/// well-formed `cancel` request? Returns its id when so.
fn parse_cancel(line: &str) -> Option<Value> {
    let envelope: Value = serde_json::from_str(line).ok()?;
    let id = envelope.get("id")?.clone();
    if !(id.is_string() || id.is_i64() || id.is_u64()) {
        return None;
    }
    (envelope.get("method")?.as_str()? == "cancel").then_some(id)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;

    /// Run a server over the given request lines; returns parsed output
    /// objects (hello included).
    fn drive(dir: &tempfile::TempDir, requests: &[&str]) -> Vec<Value> {
        let root = dir.path().join("projects");
        fs::create_dir_all(&root).unwrap();
        drive_with_root(dir, requests)
    }

    fn drive_with_root(dir: &tempfile::TempDir, requests: &[&str]) -> Vec<Value> {
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let paths = PlatformPaths {
            database_path: dir.path().join("test.db"),
            projects_root: dir.path().join("projects"),
            extract_dir: dir.path().join("extracts"),
        };

        let (tx, rx) = mpsc::channel();
        for r in requests {
            tx.send((*r).to_string()).unwrap();
        }
        drop(tx);

        let mut out = Vec::new();
        let mut server = Server::new(store, paths, rx, &mut out).unwrap();
        server.run().unwrap();
        drop(server);

        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn write_session(dir: &tempfile::TempDir, name: &str, content: &str) {
        let root = dir.path().join("projects");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(name), content).unwrap();
    }

    const TWO_LINES: &str = concat!(
        r#"{"type":"user","message":{"role":"user","content":"Hello"}}"#,
        "\n",
        r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hi"}]}}"#,
        "\n",
    );

    #[test]
    fn test_hello_is_first_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = drive(&dir, &[]);
        assert_eq!(output[0]["type"], "hello");
        assert_eq!(output[0]["protocol"], 1);
        assert!(output[0]["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "build_index"));
    }

    #[test]
    fn test_unknown_method() {
        let dir = tempfile::tempdir().unwrap();
        let output = drive(&dir, &[r#"{"id":"1","method":"frobnicate"}"#]);
        assert_eq!(output[1]["type"], "error");
        assert_eq!(output[1]["error"]["code"], "UNKNOWN_METHOD");
        assert_eq!(output[1]["id"], "1");
    }

    #[test]
    fn test_bad_request_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let output = drive(
            &dir,
            &[
                "this is not json",
                r#"{"method":"search"}"#,
                r#"{"id":{"nested":true},"method":"search"}"#,
                r#"{"id":"4"}"#,
                r#"{"id":"5","method":"search","params":[1,2]}"#,
            ],
        );
        for response in &output[1..] {
            assert_eq!(response["type"], "error");
            assert_eq!(response["error"]["code"], "BAD_REQUEST");
        }
    }

    #[test]
    fn test_integer_id_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let output = drive(&dir, &[r#"{"id":7,"method":"cancel"}"#]);
        assert_eq!(output[1]["id"], 7);
        assert_eq!(output[1]["type"], "result");
        assert_eq!(output[1]["data"], "cancelled");
    }

    #[test]
    fn test_search_before_build_requires_index() {
        let dir = tempfile::tempdir().unwrap();
        let output = drive(&dir, &[r#"{"id":"1","method":"search","params":{"q":"x"}}"#]);
        assert_eq!(output[1]["error"]["code"], "INDEX_REQUIRED");
    }

    #[test]
    fn test_build_index_empty_tree_event_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let output = drive(&dir, &[r#"{"id":"1","method":"build_index"}"#]);

        let stages: Vec<(&str, f64)> = output[1..5]
            .iter()
            .map(|e| {
                (
                    e["stage"].as_str().unwrap(),
                    e["progress"].as_f64().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                ("scan", 0.0),
                ("import", 0.2),
                ("index", 0.8),
                ("complete", 1.0)
            ]
        );

        let result = &output[5];
        assert_eq!(result["type"], "result");
        assert_eq!(result["data"]["status"], "ok");
        assert_eq!(result["data"]["conversations"], 0);
    }

    #[test]
    fn test_build_then_list_and_search() {
        let dir = tempfile::tempdir().unwrap();
        write_session(&dir, "a.jsonl", TWO_LINES);

        let output = drive(
            &dir,
            &[
                r#"{"id":"1","method":"build_index"}"#,
                r#"{"id":"2","method":"list_sessions"}"#,
                r#"{"id":"3","method":"search","params":{"q":"Hello"}}"#,
            ],
        );

        let list = output
            .iter()
            .find(|o| o["id"] == "2" && o["type"] == "result")
            .unwrap();
        assert_eq!(list["data"][0]["id"], "session_0");
        assert_eq!(list["data"][0]["name"], "a.jsonl");

        let search = output
            .iter()
            .find(|o| o["id"] == "3" && o["type"] == "result")
            .unwrap();
        let results = search["data"]["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["session_id"], "session_0");
        assert_eq!(results[0]["position"], 1);
        assert_eq!(results[0]["match_count"], 1);
        assert!(results[0]["snippet"].as_str().unwrap().contains("Hello"));
        assert!(results[0]["score"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_extract_view_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_session(&dir, "a.jsonl", TWO_LINES);

        let output = drive(
            &dir,
            &[
                r#"{"id":"1","method":"build_index"}"#,
                r#"{"id":"2","method":"extract","params":{"session_id":"session_0","format":"json","export":false}}"#,
            ],
        );

        let view = output
            .iter()
            .find(|o| o["id"] == "2" && o["type"] == "result")
            .unwrap();
        assert_eq!(view["data"]["id"], "session_0");
        assert_eq!(view["data"]["has_more"], false);
        let messages = view["data"]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "assistant");
        assert_eq!(messages[0]["content"], "Hi");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "Hello");
    }

    #[test]
    fn test_extract_pagination_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = String::new();
        for i in 1..=5 {
            content.push_str(&format!("{{\"role\":\"user\",\"content\":\"m{i}\"}}\n"));
        }
        write_session(&dir, "a.jsonl", &content);

        let output = drive(
            &dir,
            &[
                r#"{"id":"1","method":"build_index"}"#,
                r#"{"id":"2","method":"extract","params":{"session_id":"session_0","format":"json","limit":2}}"#,
                r#"{"id":"3","method":"extract","params":{"session_id":"session_0","format":"json","limit":2,"offset":2}}"#,
                r#"{"id":"4","method":"extract","params":{"session_id":"session_0","format":"json","limit":2,"offset":4}}"#,
            ],
        );

        let page = |id: &str| {
            output
                .iter()
                .find(|o| o["id"] == id && o["type"] == "result")
                .unwrap()["data"]
                .clone()
        };

        let p1 = page("2");
        assert_eq!(p1["messages"][0]["content"], "m5");
        assert_eq!(p1["messages"][1]["content"], "m4");
        assert_eq!(p1["has_more"], true);

        let p2 = page("3");
        assert_eq!(p2["messages"][0]["content"], "m3");
        assert_eq!(p2["messages"][1]["content"], "m2");
        assert_eq!(p2["has_more"], true);

        let p3 = page("4");
        assert_eq!(p3["messages"][0]["content"], "m1");
        assert_eq!(p3["messages"].as_array().unwrap().len(), 1);
        assert_eq!(p3["has_more"], false);
    }

    #[test]
    fn test_extract_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_session(&dir, "a.jsonl", TWO_LINES);

        let output = drive(
            &dir,
            &[
                r#"{"id":"1","method":"build_index"}"#,
                r#"{"id":"2","method":"extract","params":{"session_id":"session_9","format":"json"}}"#,
                r#"{"id":"3","method":"extract","params":{"session_id":"bogus","format":"json"}}"#,
                r#"{"id":"4","method":"extract","params":{"session_id":"session_0","format":"docx"}}"#,
                r#"{"id":"5","method":"extract","params":{"session_id":"session_0","format":"markdown","export":false}}"#,
                r#"{"id":"6","method":"extract","params":{"session_id":"session_0"}}"#,
            ],
        );

        let err = |id: &str| {
            output
                .iter()
                .find(|o| o["id"] == id && o["type"] == "error")
                .unwrap()["error"]["code"]
                .clone()
        };
        assert_eq!(err("2"), "SESSION_NOT_FOUND");
        assert_eq!(err("3"), "INVALID_PARAMS");
        assert_eq!(err("4"), "INVALID_PARAMS");
        assert_eq!(err("5"), "INVALID_PARAMS");
        assert_eq!(err("6"), "INVALID_PARAMS");
    }

    #[test]
    fn test_extract_export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        write_session(&dir, "a.jsonl", TWO_LINES);

        let output = drive(
            &dir,
            &[
                r#"{"id":"1","method":"build_index"}"#,
                r#"{"id":"2","method":"extract","params":{"session_id":"session_0","format":"markdown","export":true}}"#,
            ],
        );

        let result = output
            .iter()
            .find(|o| o["id"] == "2" && o["type"] == "result")
            .unwrap();
        assert_eq!(result["data"]["format"], "markdown");
        let path = PathBuf::from(result["data"]["path"].as_str().unwrap());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# a\n"));
        // Oldest first in exports.
        let hello = text.find("Hello").unwrap();
        let hi = text.find("Hi").unwrap();
        assert!(hello < hi);
    }

    #[test]
    fn test_match_count_reflects_hits_beyond_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = String::new();
        for i in 1..=8 {
            content.push_str(&format!("{{\"role\":\"user\",\"content\":\"needle {i}\"}}\n"));
        }
        write_session(&dir, "a.jsonl", &content);

        let output = drive(
            &dir,
            &[
                r#"{"id":"1","method":"build_index"}"#,
                r#"{"id":"2","method":"search","params":{"q":"needle","limit":3}}"#,
            ],
        );

        let search = output
            .iter()
            .find(|o| o["id"] == "2" && o["type"] == "result")
            .unwrap();
        let results = search["data"]["results"].as_array().unwrap();
        // The page is capped at the requested limit...
        assert_eq!(results.len(), 3);
        // ...but every row reports the session's true total.
        for hit in results {
            assert_eq!(hit["session_id"], "session_0");
            assert_eq!(hit["match_count"], 8);
        }
    }

    #[test]
    fn test_search_missing_query_param() {
        let dir = tempfile::tempdir().unwrap();
        let output = drive(
            &dir,
            &[
                r#"{"id":"1","method":"build_index"}"#,
                r#"{"id":"2","method":"search","params":{"limit":5}}"#,
                r#"{"id":"3","method":"search","params":{"query":"Hello","limit":"five"}}"#,
            ],
        );
        let err = |id: &str| {
            output
                .iter()
                .find(|o| o["id"] == id && o["type"] == "error")
                .unwrap()["error"]["code"]
                .clone()
        };
        assert_eq!(err("2"), "INVALID_PARAMS");
        assert_eq!(err("3"), "INVALID_PARAMS");
    }

    #[test]
    fn test_requests_queued_during_operation_still_served() {
        let dir = tempfile::tempdir().unwrap();
        write_session(&dir, "a.jsonl", TWO_LINES);

        // Everything is already buffered in the channel, so the cancel is
        // drained during build_index's first per-file poll, takes effect
        // immediately, and the queued search still runs afterwards.
        let output = drive(
            &dir,
            &[
                r#"{"id":"1","method":"build_index"}"#,
                r#"{"id":"2","method":"cancel"}"#,
                r#"{"id":"3","method":"search","params":{"q":"Hello"}}"#,
            ],
        );

        let build = output
            .iter()
            .find(|o| o["id"] == "1" && o["type"] == "error")
            .unwrap();
        assert_eq!(build["error"]["code"], "CANCELLED");

        let cancel = output
            .iter()
            .find(|o| o["id"] == "2" && o["type"] == "result")
            .unwrap();
        assert_eq!(cancel["data"], "cancelled");

        // The queued search ran after cancellation, with the flag cleared.
        let search = output
            .iter()
            .find(|o| o["id"] == "3")
            .unwrap();
        assert_eq!(search["type"], "error");
        // build_index was cancelled before any import, and the store had no
        // prior index, so search still requires one.
        assert_eq!(search["error"]["code"], "INDEX_REQUIRED");
    }

    #[test]
    fn test_responses_follow_submission_order_for_queued_requests() {
        let dir = tempfile::tempdir().unwrap();
        let output = drive(
            &dir,
            &[
                r#"{"id":"1","method":"list_sessions"}"#,
                r#"{"id":"2","method":"list_sessions"}"#,
            ],
        );
        let ids: Vec<_> = output[1..]
            .iter()
            .filter(|o| o["type"] == "result")
            .map(|o| o["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
