//! Fake search tools for tests.

use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Write an executable shell script named `name` into `dir` and return its path.
pub fn fake_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().to_string()
}

/// A `match` line as ripgrep prints it.
pub fn match_line(path: &str, line_number: u64, text: &str) -> String {
    json!({
        "type": "match",
        "data": {
            "path": {"text": path},
            "lines": {"text": format!("{}\n", text)},
            "line_number": line_number,
            "absolute_offset": 0,
            "submatches": [{"match": {"text": text}, "start": 0, "end": text.len()}]
        }
    })
    .to_string()
}

pub fn begin_line(path: &str) -> String {
    json!({"type": "begin", "data": {"path": {"text": path}}}).to_string()
}

/// Script body that prints `lines` verbatim, one per line, then exits with `code`.
pub fn print_lines(lines: &[String], code: i32) -> String {
    let quoted: Vec<String> = lines
        .iter()
        .map(|line| format!("'{}'", line.replace('\'', r"'\''")))
        .collect();
    format!("printf '%s\\n' {}\nexit {}", quoted.join(" "), code)
}
