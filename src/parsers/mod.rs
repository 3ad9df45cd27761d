//! 検索ツール出力のパーサー
//!
//! ripgrep `--json` の出力をチャンク単位で受け取り、行ごとに型付きレコードへ変換する。
//! 出力全体をメモリに載せることはない。

pub mod decoder;
pub mod line_parser;
pub mod record;

pub use decoder::StreamDecoder;
pub use line_parser::{LineRecordParser, ParserStats};
pub use record::{LineHit, ParseDiagnostic, ParseEvent, Record, Submatch};
