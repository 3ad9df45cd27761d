//! 外部検索ツールの呼び出し
//!
//! ワーカープロセスはここを通してripgrep互換ツールを起動し、出力をストリーミングで解析する。

pub mod tool;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

pub use tool::{SearchTool, ToolOutcome, ToolRun};
