//! Typed records for the search tool's `--json` output.
//!
//! Wire structs mirror ripgrep's JSON Lines schema and stay private; callers
//! only see [`Record`] and [`ParseDiagnostic`].

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

/// A single span inside a matched line. Offsets are byte offsets into
/// `line_text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submatch {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Shared payload of `match` and `context` lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineHit {
    pub path: String,
    pub line_number: Option<u64>,
    pub absolute_offset: u64,
    pub line_text: String,
    pub submatches: Vec<Submatch>,
}

/// One parsed unit of search tool output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    Begin { path: String },
    Match(LineHit),
    Context(LineHit),
    End { path: String, match_count: u64, elapsed_ms: f64 },
    Summary { elapsed_ms: f64, match_count: u64 },
}

impl Record {
    pub fn is_match(&self) -> bool {
        matches!(self, Record::Match(_))
    }

    /// Number of matches this record contributes to a running count.
    ///
    /// Only `match` lines count; `end`/`summary` totals are informational.
    pub fn match_weight(&self) -> u64 {
        match self {
            Record::Match(_) => 1,
            _ => 0,
        }
    }

    /// Parse one complete line of tool output.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<WireRecord>(line).map(Record::from)
    }
}

/// Emitted in place of a [`Record`] when a complete line fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseDiagnostic {
    pub raw_line: String,
    pub reason: String,
}

/// What the line parser yields for each complete line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParseEvent {
    Record(Record),
    Diagnostic(ParseDiagnostic),
}

impl ParseEvent {
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            ParseEvent::Record(record) => Some(record),
            ParseEvent::Diagnostic(_) => None,
        }
    }

    pub fn as_diagnostic(&self) -> Option<&ParseDiagnostic> {
        match self {
            ParseEvent::Diagnostic(diagnostic) => Some(diagnostic),
            ParseEvent::Record(_) => None,
        }
    }
}

// ---- wire format ----

/// ripgrep encodes paths and lines as `{"text": ..}`, or `{"bytes": <base64>}`
/// when they are not valid UTF-8. The bytes form is decoded lossily; submatch
/// offsets still refer to the raw bytes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireData {
    Text {
        text: String,
    },
    Bytes {
        #[serde(deserialize_with = "decode_base64_lossy")]
        bytes: String,
    },
}

fn decode_base64_lossy<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

impl WireData {
    fn into_string(self) -> String {
        match self {
            WireData::Text { text } => text,
            WireData::Bytes { bytes } => bytes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
enum WireRecord {
    Begin(WireBegin),
    Match(WireLine),
    Context(WireLine),
    End(WireEnd),
    Summary(WireSummary),
}

#[derive(Debug, Deserialize)]
struct WireBegin {
    path: WireData,
}

#[derive(Debug, Deserialize)]
struct WireLine {
    path: WireData,
    lines: WireData,
    #[serde(default)]
    line_number: Option<u64>,
    #[serde(default)]
    absolute_offset: u64,
    #[serde(default)]
    submatches: Vec<WireSubmatch>,
}

#[derive(Debug, Deserialize)]
struct WireSubmatch {
    #[serde(rename = "match")]
    matched: WireData,
    start: usize,
    end: usize,
}

#[derive(Debug, Default, Deserialize)]
struct WireDuration {
    #[serde(default)]
    secs: u64,
    #[serde(default)]
    nanos: u32,
}

impl WireDuration {
    fn as_millis_f64(&self) -> f64 {
        self.secs as f64 * 1_000.0 + f64::from(self.nanos) / 1_000_000.0
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireStats {
    #[serde(default)]
    elapsed: WireDuration,
    #[serde(default)]
    matches: u64,
}

#[derive(Debug, Deserialize)]
struct WireEnd {
    path: WireData,
    #[serde(default)]
    stats: WireStats,
}

#[derive(Debug, Deserialize)]
struct WireSummary {
    #[serde(default)]
    elapsed_total: WireDuration,
    #[serde(default)]
    stats: WireStats,
}

impl From<WireLine> for LineHit {
    fn from(line: WireLine) -> Self {
        Self {
            path: line.path.into_string(),
            line_number: line.line_number,
            absolute_offset: line.absolute_offset,
            line_text: line.lines.into_string(),
            submatches: line
                .submatches
                .into_iter()
                .map(|s| Submatch {
                    text: s.matched.into_string(),
                    start: s.start,
                    end: s.end,
                })
                .collect(),
        }
    }
}

impl From<WireRecord> for Record {
    fn from(wire: WireRecord) -> Self {
        match wire {
            WireRecord::Begin(begin) => Record::Begin {
                path: begin.path.into_string(),
            },
            WireRecord::Match(line) => Record::Match(line.into()),
            WireRecord::Context(line) => Record::Context(line.into()),
            WireRecord::End(end) => Record::End {
                path: end.path.into_string(),
                match_count: end.stats.matches,
                elapsed_ms: end.stats.elapsed.as_millis_f64(),
            },
            WireRecord::Summary(summary) => Record::Summary {
                elapsed_ms: summary.elapsed_total.as_millis_f64(),
                match_count: summary.stats.matches,
            },
        }
    }
}
