// Convodex - tests/e2e_protocol.rs
//
// End-to-end protocol scenarios: each test drives a full server instance
// over in-memory channels against a scratch log tree and database,
// asserting on the exact line-delimited JSON the server emits.
//
// Several tests run the server more than once against the same database,
// mutating the log tree in between, to exercise incremental re-import.

use convodex::app::server::Server;
use convodex::app::store::Store;
use convodex::platform::config::PlatformPaths;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;

const TWO_LINES: &str = concat!(
    r#"{"type":"user","message":{"role":"user","content":"Hello"}}"#,
    "\n",
    r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hi"}]}}"#,
    "\n",
);

/// One scratch installation: a projects root, a database, an extract dir.
struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    db: PathBuf,
    extracts: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("projects");
        fs::create_dir_all(&root).expect("create root");
        Harness {
            db: dir.path().join("extractor.db"),
            extracts: dir.path().join("extracts"),
            _dir: dir,
            root,
        }
    }

    fn write_log(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.join(name);
        fs::write(&path, content).expect("write log");
        path
    }

    fn append_line(&self, name: &str, line: &str) {
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(self.root.join(name))
            .expect("open for append");
        f.write_all(line.as_bytes()).expect("append");
        f.write_all(b"\n").expect("append newline");
    }

    /// Run one full server lifetime over `requests`, returning every
    /// emitted object (the leading `hello` included).
    fn run(&self, requests: &[&str]) -> Vec<Value> {
        let store = Store::open(&self.db).expect("open store");
        let paths = PlatformPaths {
            database_path: self.db.clone(),
            projects_root: self.root.clone(),
            extract_dir: self.extracts.clone(),
        };

        let (tx, rx) = mpsc::channel();
        for r in requests {
            tx.send((*r).to_string()).expect("send request");
        }
        drop(tx);

        let mut out = Vec::new();
        let mut server = Server::new(store, paths, rx, &mut out).expect("server");
        server.run().expect("server run");
        drop(server);

        String::from_utf8(out)
            .expect("utf8 output")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect()
    }
}

fn result_for<'a>(output: &'a [Value], id: &str) -> &'a Value {
    output
        .iter()
        .find(|o| o["id"] == id && o["type"] == "result")
        .unwrap_or_else(|| panic!("no result for id {id}: {output:?}"))
}

fn error_for<'a>(output: &'a [Value], id: &str) -> &'a Value {
    output
        .iter()
        .find(|o| o["id"] == id && o["type"] == "error")
        .unwrap_or_else(|| panic!("no error for id {id}: {output:?}"))
}

fn events_for(output: &[Value], id: &str) -> Vec<(String, f64)> {
    output
        .iter()
        .filter(|o| o["id"] == id && o["type"] == "event")
        .map(|o| {
            (
                o["stage"].as_str().unwrap().to_string(),
                o["progress"].as_f64().unwrap(),
            )
        })
        .collect()
}

// =============================================================================
// Scenario 1: empty tree
// =============================================================================

#[test]
fn e2e_empty_tree() {
    let h = Harness::new();
    let output = h.run(&[
        r#"{"id":"1","method":"build_index"}"#,
        r#"{"id":"2","method":"search","params":{"q":"anything"}}"#,
    ]);

    assert_eq!(output[0]["type"], "hello");
    assert!(output[0]["core_version"].is_string());

    let events = events_for(&output, "1");
    assert_eq!(
        events,
        vec![
            ("scan".to_string(), 0.0),
            ("import".to_string(), 0.2),
            ("index".to_string(), 0.8),
            ("complete".to_string(), 1.0),
        ]
    );

    let result = result_for(&output, "1");
    assert_eq!(result["data"]["status"], "ok");
    assert_eq!(result["data"]["conversations"], 0);

    // Index was built (empty), so search succeeds with no results.
    let search = result_for(&output, "2");
    assert_eq!(search["data"]["results"], serde_json::json!([]));
}

#[test]
fn e2e_search_without_any_index_is_refused() {
    let h = Harness::new();
    let output = h.run(&[r#"{"id":"1","method":"search","params":{"q":"anything"}}"#]);
    assert_eq!(error_for(&output, "1")["error"]["code"], "INDEX_REQUIRED");
}

// =============================================================================
// Scenario 2: two-line file
// =============================================================================

#[test]
fn e2e_two_line_file() {
    let h = Harness::new();
    h.write_log("a.jsonl", TWO_LINES);

    let output = h.run(&[
        r#"{"id":"1","method":"build_index"}"#,
        r#"{"id":"2","method":"list_sessions"}"#,
        r#"{"id":"3","method":"extract","params":{"session_id":"session_0","format":"json","export":false}}"#,
    ]);

    assert_eq!(result_for(&output, "1")["data"]["conversations"], 1);

    let listing = result_for(&output, "2")["data"].as_array().unwrap().clone();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0]["id"], "session_0");
    assert_eq!(listing[0]["name"], "a.jsonl");
    assert!(listing[0]["size"].as_u64().unwrap() > 0);
    assert!(listing[0]["path"].as_str().unwrap().ends_with("a.jsonl"));

    let view = &result_for(&output, "3")["data"];
    assert_eq!(view["has_more"], false);
    let messages = view["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    // Newest first.
    assert_eq!(messages[0]["role"], "assistant");
    assert_eq!(messages[0]["content"], "Hi");
    assert_eq!(messages[1]["role"], "user");
    assert_eq!(messages[1]["content"], "Hello");
}

// =============================================================================
// Scenario 3: search hit
// =============================================================================

#[test]
fn e2e_search_hit() {
    let h = Harness::new();
    h.write_log("a.jsonl", TWO_LINES);

    let output = h.run(&[
        r#"{"id":"1","method":"build_index"}"#,
        r#"{"id":"2","method":"search","params":{"q":"Hello"}}"#,
    ]);

    let results = result_for(&output, "2")["data"]["results"]
        .as_array()
        .unwrap()
        .clone();
    assert!(!results.is_empty());
    let hit = &results[0];
    assert_eq!(hit["session_id"], "session_0");
    assert_eq!(hit["session_name"], "a.jsonl");
    assert_eq!(hit["position"], 1);
    assert!(hit["snippet"].as_str().unwrap().contains("Hello"));
    assert!(hit["score"].as_f64().unwrap() > 0.0);
    assert_eq!(hit["match_count"], 1);
}

// =============================================================================
// Scenario 4: append and re-import
// =============================================================================

#[test]
fn e2e_append_and_reimport() {
    let h = Harness::new();
    h.write_log("a.jsonl", TWO_LINES);
    h.run(&[r#"{"id":"1","method":"build_index"}"#]);

    h.append_line("a.jsonl", r#"{"type":"user","content":"Again"}"#);

    let output = h.run(&[
        r#"{"id":"1","method":"build_index"}"#,
        r#"{"id":"2","method":"extract","params":{"session_id":"session_0","format":"json"}}"#,
    ]);

    assert_eq!(result_for(&output, "1")["data"]["conversations"], 1);

    let messages = result_for(&output, "2")["data"]["messages"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(messages.len(), 3);
    let positions: Vec<i64> = messages.iter().map(|m| m["position"].as_i64().unwrap()).collect();
    assert_eq!(positions, vec![3, 2, 1]);
    assert_eq!(messages[0]["content"], "Again");
}

// =============================================================================
// Scenario 5: corrupt line tolerance
// =============================================================================

#[test]
fn e2e_corrupt_line_tolerated() {
    let h = Harness::new();
    h.write_log("a.jsonl", TWO_LINES);
    h.run(&[r#"{"id":"1","method":"build_index"}"#]);

    h.append_line("a.jsonl", "{not json}");
    h.append_line("a.jsonl", r#"{"type":"user","content":"Again"}"#);

    let output = h.run(&[
        r#"{"id":"1","method":"build_index"}"#,
        r#"{"id":"2","method":"extract","params":{"session_id":"session_0","format":"json"}}"#,
    ]);

    let messages = result_for(&output, "2")["data"]["messages"]
        .as_array()
        .unwrap()
        .clone();
    // Three valid messages; the malformed line contributed nothing.
    assert_eq!(messages.len(), 3);
    let positions: Vec<i64> = messages.iter().map(|m| m["position"].as_i64().unwrap()).collect();
    assert_eq!(positions, vec![3, 2, 1]);

    // Progress advanced past the corrupt line: one more run imports nothing
    // new and the view is unchanged.
    let output = h.run(&[
        r#"{"id":"1","method":"build_index"}"#,
        r#"{"id":"2","method":"extract","params":{"session_id":"session_0","format":"json"}}"#,
    ]);
    let again = result_for(&output, "2")["data"]["messages"]
        .as_array()
        .unwrap()
        .len();
    assert_eq!(again, 3);
}

// =============================================================================
// Scenario 6: cancellation
// =============================================================================

#[test]
fn e2e_cancel_then_clean_rebuild() {
    let h = Harness::new();
    for i in 0..5 {
        h.write_log(&format!("conv{i}.jsonl"), TWO_LINES);
    }

    // The cancel is already buffered when build_index starts, so it is
    // picked up at the first per-file poll.
    let output = h.run(&[
        r#"{"id":"1","method":"build_index"}"#,
        r#"{"id":"2","method":"cancel"}"#,
    ]);
    assert_eq!(error_for(&output, "1")["error"]["code"], "CANCELLED");
    assert_eq!(result_for(&output, "2")["data"], "cancelled");

    // Re-issuing completes and converges to the same final state as an
    // uncancelled run.
    let output = h.run(&[
        r#"{"id":"1","method":"build_index"}"#,
        r#"{"id":"2","method":"search","params":{"q":"Hello"}}"#,
    ]);
    assert_eq!(result_for(&output, "1")["data"]["conversations"], 5);
    let results = result_for(&output, "2")["data"]["results"]
        .as_array()
        .unwrap()
        .len();
    assert_eq!(results, 5);
}

// =============================================================================
// Tail overlay end to end
// =============================================================================

#[test]
fn e2e_tail_overlay_serves_unimported_lines() {
    let h = Harness::new();
    h.write_log("a.jsonl", TWO_LINES);

    // Build, then append WITHOUT rebuilding: the view must still see the
    // new line via the tail overlay, in the same server lifetime. The
    // requests are driven one at a time so the append is guaranteed to
    // land after the import commit and before the view.
    let store = Store::open(&h.db).unwrap();
    let paths = PlatformPaths {
        database_path: h.db.clone(),
        projects_root: h.root.clone(),
        extract_dir: h.extracts.clone(),
    };
    let (_tx, rx) = mpsc::channel::<String>();
    let mut out = Vec::new();
    let mut server = Server::new(store, paths, rx, &mut out).unwrap();

    server
        .handle_line(r#"{"id":"1","method":"build_index"}"#)
        .unwrap();
    h.append_line("a.jsonl", r#"{"type":"user","content":"fresh"}"#);
    server
        .handle_line(
            r#"{"id":"2","method":"extract","params":{"session_id":"session_0","format":"json"}}"#,
        )
        .unwrap();
    drop(server);

    let output: Vec<Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    // The build saw exactly the two stored lines.
    assert_eq!(result_for(&output, "1")["data"]["conversations"], 1);

    let messages = result_for(&output, "2")["data"]["messages"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"], "fresh");
    assert_eq!(messages[0]["position"], 3);
    // Stored rows follow the overlay row.
    assert_eq!(messages[1]["content"], "Hi");
    assert_eq!(messages[2]["content"], "Hello");
}

// =============================================================================
// Rotation end to end
// =============================================================================

#[test]
fn e2e_truncation_starts_fresh_source() {
    let h = Harness::new();
    h.write_log("a.jsonl", TWO_LINES);
    h.run(&[r#"{"id":"1","method":"build_index"}"#]);

    // Truncate to zero and write new content.
    h.write_log("a.jsonl", "{\"type\":\"user\",\"content\":\"reborn\"}\n");
    let output = h.run(&[
        r#"{"id":"1","method":"build_index"}"#,
        r#"{"id":"2","method":"extract","params":{"session_id":"session_0","format":"json"}}"#,
    ]);

    // Prior messages remain addressable; the new line continues the
    // conversation's position sequence.
    let messages = result_for(&output, "2")["data"]["messages"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["content"], "reborn");
    assert_eq!(messages[0]["position"], 3);
}
