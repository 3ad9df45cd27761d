//! 外部検索ツール（ripgrep互換）の実行
//!
//! `<tool> --json [args] -- <query> <path>` を起動し、stdoutをチャンク単位で
//! [`LineRecordParser`] に流し込む。呼び出し側は [`ToolRun::next_events`] で
//! イベントを引き出し、その合間に自由に await できる。

use crate::error::ToolError;
use crate::parsers::{LineRecordParser, ParseEvent, ParserStats};
use crate::workers::process::collect_tail;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8 * 1024;

/// ripgrep互換の検索ツール
#[derive(Debug, Clone)]
pub struct SearchTool {
    /// バイナリ名またはパス（PATHから検索される）
    binary: String,
    /// `--json` の後、クエリの前に置く追加引数
    extra_args: Vec<String>,
    stderr_tail_lines: usize,
}

impl SearchTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            stderr_tail_lines: 20,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stderr_tail_lines(mut self, lines: usize) -> Self {
        self.stderr_tail_lines = lines;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// ツールのバイナリをPATHから解決
    pub fn resolve(&self) -> Result<PathBuf, ToolError> {
        which::which(&self.binary).map_err(|e| ToolError::BinaryNotFound {
            binary: PathBuf::from(&self.binary),
            message: e.to_string(),
        })
    }

    pub fn is_available(&self) -> bool {
        self.resolve().is_ok()
    }

    /// Argument vector after the binary.
    pub fn args(&self, query: &str, path: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--json".into()];
        args.extend(self.extra_args.iter().map(OsString::from));
        args.push("--".into());
        args.push(query.into());
        args.push(path.into());
        args
    }

    /// 検索を開始する。プロセスは [`ToolRun`] がdropされると終了させられる。
    pub fn start(&self, query: &str, path: &Path) -> Result<ToolRun, ToolError> {
        let binary = self.resolve()?;
        let mut command = Command::new(&binary);
        command
            .args(self.args(query, path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("Executing search tool: {:?}", command);

        let mut child = command.spawn().map_err(ToolError::SpawnFailed)?;
        let stdout = child.stdout.take().ok_or(ToolError::StdoutNotAvailable)?;

        // stderrもバックグラウンドで読み取り
        let keep = self.stderr_tail_lines;
        let label = self.binary.clone();
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(async move { collect_tail(stderr, keep, &label).await }));

        Ok(ToolRun {
            child,
            stdout,
            stderr_task,
            parser: LineRecordParser::new(),
            buffer: vec![0u8; READ_CHUNK],
            started: Instant::now(),
            eof: false,
            flushed: false,
            killed: false,
        })
    }
}

impl Default for SearchTool {
    fn default() -> Self {
        Self::new("rg")
    }
}

/// How one tool invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stats: ParserStats,
    pub elapsed_ms: f64,
    pub stderr_tail: Vec<String>,
    pub killed: bool,
}

impl ToolOutcome {
    /// ripgrep exits 0 with matches and 1 without; both are a finished search.
    pub fn is_success(&self) -> bool {
        !self.killed && matches!(self.code, Some(0) | Some(1))
    }

    pub fn describe_failure(&self) -> String {
        let status = match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown exit status".to_string(),
        };
        match self.stderr_tail.last() {
            Some(line) => format!("search tool failed ({}): {}", status, line),
            None => format!("search tool failed ({})", status),
        }
    }
}

/// 実行中の検索ツール
pub struct ToolRun {
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<JoinHandle<Vec<String>>>,
    parser: LineRecordParser,
    buffer: Vec<u8>,
    started: Instant,
    eof: bool,
    flushed: bool,
    killed: bool,
}

impl ToolRun {
    /// Events parsed from the next chunk of output. Returns an empty batch when
    /// a chunk held no complete line, and `None` once stdout is exhausted and
    /// the trailing line has been flushed.
    ///
    /// Cancel-safe: dropping the future loses no output.
    pub async fn next_events(&mut self) -> Result<Option<Vec<ParseEvent>>, ToolError> {
        if self.eof {
            if self.flushed {
                return Ok(None);
            }
            self.flushed = true;
            return Ok(Some(self.parser.finish()));
        }

        let read = self
            .stdout
            .read(&mut self.buffer)
            .await
            .map_err(ToolError::ReadFailed)?;
        if read == 0 {
            self.eof = true;
            self.flushed = true;
            return Ok(Some(self.parser.finish()));
        }
        Ok(Some(self.parser.feed(&self.buffer[..read])))
    }

    pub fn stats(&self) -> ParserStats {
        self.parser.stats()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// 検索を中断する
    pub async fn kill(&mut self) {
        log::info!("🛑 Terminating search tool process");
        self.killed = true;
        if let Err(e) = self.child.kill().await {
            log::debug!("Failed to kill search tool: {}", e);
        }
    }

    /// Wait for the process and collect its outcome.
    pub async fn wait(mut self) -> Result<ToolOutcome, ToolError> {
        let status = self.child.wait().await.map_err(ToolError::WaitFailed)?;
        let stderr_tail = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        let outcome = ToolOutcome {
            code: status.code(),
            signal,
            stats: self.parser.stats(),
            elapsed_ms: self.elapsed_ms(),
            stderr_tail,
            killed: self.killed,
        };
        if outcome.is_success() || outcome.killed {
            log::debug!(
                "Search tool finished: {:?}, {} matches",
                outcome.code,
                outcome.stats.matches
            );
        } else {
            log::warn!("{}", outcome.describe_failure());
        }
        Ok(outcome)
    }

    /// Drain every remaining event, then wait. Convenience for callers that
    /// do not need to interleave other work.
    pub async fn collect(mut self) -> Result<(Vec<ParseEvent>, ToolOutcome), ToolError> {
        let mut events = Vec::new();
        while let Some(batch) = self.next_events().await? {
            events.extend(batch);
        }
        let outcome = self.wait().await?;
        Ok((events, outcome))
    }
}
