//! Chunk-fed parser for newline-delimited JSON records.

use super::decoder::StreamDecoder;
use super::record::{ParseDiagnostic, ParseEvent, Record};

/// Running totals kept by a [`LineRecordParser`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Raw bytes fed, counted whether or not they parsed.
    pub bytes_processed: u64,
    pub records: u64,
    pub matches: u64,
    pub diagnostics: u64,
}

/// Turns arbitrary byte chunks into [`ParseEvent`]s.
///
/// The parser holds at most one incomplete line and one incomplete UTF-8
/// character between calls, so output of any size streams through in bounded
/// memory. A line only becomes a record or a diagnostic once its terminating
/// `\n` has been seen, or at [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct LineRecordParser {
    decoder: StreamDecoder,
    pending_line: String,
    stats: ParserStats,
}

impl LineRecordParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    pub fn bytes_processed(&self) -> u64 {
        self.stats.bytes_processed
    }

    /// Length of the buffered, not yet terminated line.
    pub fn pending_line_len(&self) -> usize {
        self.pending_line.len()
    }

    /// Feed one chunk, returning events for every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        self.feed_with(chunk, |event| events.push(event));
        events
    }

    /// Feed one chunk, handing each event to `emit` as soon as it is parsed.
    pub fn feed_with<F>(&mut self, chunk: &[u8], mut emit: F)
    where
        F: FnMut(ParseEvent),
    {
        self.stats.bytes_processed += chunk.len() as u64;
        // 既存の保留行には改行がないので、追加分だけを走査する
        let scanned = self.pending_line.len();
        self.decoder.decode_into(chunk, &mut self.pending_line);

        let Some(last_newline) = self.pending_line[scanned..]
            .rfind('\n')
            .map(|offset| scanned + offset)
        else {
            return;
        };

        // Everything after the last newline stays pending.
        let tail = self.pending_line.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending_line, tail);

        for line in complete.split_terminator('\n') {
            if let Some(event) = self.parse_line(line) {
                emit(event);
            }
        }
    }

    /// Flush at end of stream: the unterminated last line gets one parse attempt.
    pub fn finish(&mut self) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        self.finish_with(|event| events.push(event));
        events
    }

    pub fn finish_with<F>(&mut self, mut emit: F)
    where
        F: FnMut(ParseEvent),
    {
        let flushed = self.decoder.finish();
        self.pending_line.push_str(&flushed);
        let last = std::mem::take(&mut self.pending_line);

        for line in last.split_terminator('\n') {
            if let Some(event) = self.parse_line(line) {
                emit(event);
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> Option<ParseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return None;
        }

        match Record::from_line(line) {
            Ok(record) => {
                self.stats.records += 1;
                self.stats.matches += record.match_weight();
                Some(ParseEvent::Record(record))
            }
            Err(e) => {
                log::debug!("Malformed record line ({}): {}", e, line);
                self.stats.diagnostics += 1;
                Some(ParseEvent::Diagnostic(ParseDiagnostic {
                    raw_line: line.to_string(),
                    reason: e.to_string(),
                }))
            }
        }
    }
}
