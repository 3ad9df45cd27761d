//! Worker process wrapper.
//!
//! Spawns one worker-mode process and wires it up: framed IPC over its
//! stdin/stdout, a bounded stderr tail, and an exit watcher. Everything the
//! process does comes back as [`WorkerEvent`]s tagged with the worker id on a
//! channel shared by all workers of one orchestrator.

use crate::error::{FleetError, SpawnFailure, SpawnFailureReason};
use crate::workers::ipc::{FrameReader, FrameWriter};
use crate::workers::protocol::{OrchestratorMessage, SearchResponse, WorkerId};
use serde::Serialize;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// How long the exit watcher waits for stdout/stderr to drain after the
/// process itself has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a worker can report, in per-worker FIFO order.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(SearchResponse),
    /// The IPC stream carried something that was not a valid frame.
    MalformedMessage(String),
    Exited(WorkerExit),
    /// Raised by the orchestrator's own init timer.
    InitTimedOut,
}

/// Shared sink for tagged worker events.
pub type EventSender = mpsc::UnboundedSender<(WorkerId, WorkerEvent)>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stderr_tail: Vec<String>,
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus, stderr_tail: Vec<String>) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            stderr_tail,
        }
    }

    /// Non-zero exit code or death by signal.
    pub fn is_abnormal(&self) -> bool {
        self.code != Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Ask the process to exit (SIGTERM on unix).
    Terminate,
    /// Force the process down.
    Kill,
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub env: Vec<(String, String)>,
    pub stderr_tail_lines: usize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            stderr_tail_lines: 20,
        }
    }
}

/// Control surface for one running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: WorkerId,
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<OrchestratorMessage>,
    kill_token: CancellationToken,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerHandle {
    /// Assemble a handle from its channels. The owner of `outbound`'s
    /// receiver delivers messages; whoever observes `kill_token` must publish
    /// the exit on the watch channel.
    pub fn new(
        worker_id: WorkerId,
        pid: Option<u32>,
        outbound: mpsc::UnboundedSender<OrchestratorMessage>,
        kill_token: CancellationToken,
        exit_rx: watch::Receiver<Option<WorkerExit>>,
    ) -> Self {
        Self {
            worker_id,
            pid,
            outbound,
            kill_token,
            exit_rx,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn send(&self, message: OrchestratorMessage) -> Result<(), FleetError> {
        log::trace!("Worker {} <- {}", self.worker_id, message.method());
        self.outbound
            .send(message)
            .map_err(|_| FleetError::WorkerUnavailable(self.worker_id))
    }

    pub fn kill(&self, signal: KillSignal) {
        match signal {
            KillSignal::Terminate => {
                if !self.send_sigterm() {
                    self.kill_token.cancel();
                }
            }
            KillSignal::Kill => self.kill_token.cancel(),
        }
    }

    #[cfg(unix)]
    fn send_sigterm(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("SIGTERM to worker {} (pid {}) failed: {}", self.worker_id, pid, e);
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&self) -> bool {
        false
    }

    pub fn exit_status(&self) -> Option<WorkerExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Resolves once the process has exited. `None` if the watcher vanished
    /// without reporting.
    pub async fn wait(&self) -> Option<WorkerExit> {
        let mut exit_rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = exit_rx.borrow_and_update().clone() {
                return Some(exit);
            }
            if exit_rx.changed().await.is_err() {
                return exit_rx.borrow().clone();
            }
        }
    }
}

/// Spawns worker processes.
pub struct WorkerProcess;

impl WorkerProcess {
    /// Spawn `argv` as worker `worker_id`.
    ///
    /// The binary is resolved with `which` first; an unresolvable binary
    /// yields [`SpawnFailureReason::BinaryNotFound`] and nothing is started.
    pub fn spawn(
        worker_id: WorkerId,
        argv: &[OsString],
        options: &SpawnOptions,
        events: EventSender,
    ) -> Result<WorkerHandle, SpawnFailure> {
        let fail = |reason| SpawnFailure::new(worker_id, reason);

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| fail(SpawnFailureReason::EmptyArgv))?;
        let binary = which::which(program).map_err(|e| {
            fail(SpawnFailureReason::BinaryNotFound {
                binary: PathBuf::from(program),
                message: e.to_string(),
            })
        })?;

        log::debug!("Spawning worker {}: {} {:?}", worker_id, binary.display(), args);

        let mut command = Command::new(&binary);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &options.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| fail(SpawnFailureReason::Io(e.to_string())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| fail(SpawnFailureReason::MissingPipe("stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| fail(SpawnFailureReason::MissingPipe("stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| fail(SpawnFailureReason::MissingPipe("stderr")))?;

        let pid = child.id();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_token = CancellationToken::new();

        tokio::spawn(Self::stdin_handler(worker_id, stdin, outbound_rx));
        let reader = tokio::spawn(Self::stdout_handler(worker_id, stdout, events.clone()));
        let stderr_tail = tokio::spawn(Self::stderr_handler(
            worker_id,
            stderr,
            options.stderr_tail_lines,
        ));
        tokio::spawn(Self::exit_watcher(
            worker_id,
            child,
            kill_token.clone(),
            reader,
            stderr_tail,
            exit_tx,
            events,
        ));

        log::info!("🚀 Worker {} spawned (pid {:?})", worker_id, pid);
        Ok(WorkerHandle::new(worker_id, pid, outbound_tx, kill_token, exit_rx))
    }

    async fn stdin_handler(
        worker_id: WorkerId,
        stdin: tokio::process::ChildStdin,
        mut outbound_rx: mpsc::UnboundedReceiver<OrchestratorMessage>,
    ) {
        let mut writer = FrameWriter::new(stdin);
        while let Some(message) = outbound_rx.recv().await {
            if let Err(e) = writer.write_frame(&message).await {
                log::debug!("Worker {} stdin closed: {}", worker_id, e);
                return;
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn stdout_handler(worker_id: WorkerId, stdout: ChildStdout, events: EventSender) {
        let mut reader = FrameReader::new(BufReader::new(stdout));
        loop {
            match reader.read_frame::<SearchResponse>().await {
                Ok(Some(response)) => {
                    log::trace!("Worker {} -> {}", worker_id, response.method());
                    if events.send((worker_id, WorkerEvent::Message(response))).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    log::warn!("⚠️ Worker {} sent a malformed frame: {}", worker_id, e);
                    let _ = events.send((worker_id, WorkerEvent::MalformedMessage(e.to_string())));
                    return;
                }
            }
        }
    }

    async fn stderr_handler(worker_id: WorkerId, stderr: ChildStderr, keep: usize) -> Vec<String> {
        collect_tail(stderr, keep, &format!("worker {}", worker_id)).await
    }

    async fn exit_watcher(
        worker_id: WorkerId,
        mut child: Child,
        kill_token: CancellationToken,
        reader: JoinHandle<()>,
        stderr_tail: JoinHandle<Vec<String>>,
        exit_tx: watch::Sender<Option<WorkerExit>>,
        events: EventSender,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_token.cancelled() => {
                log::info!("🛑 Force-killing worker {}", worker_id);
                if let Err(e) = child.start_kill() {
                    log::warn!("Failed to kill worker {}: {}", worker_id, e);
                }
                child.wait().await
            }
        };

        // 終了通知より先に、ワーカーが書いたメッセージをすべて届ける
        if timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            log::warn!("Worker {} stdout did not drain after exit", worker_id);
        }
        let tail = match timeout(DRAIN_TIMEOUT, stderr_tail).await {
            Ok(Ok(tail)) => tail,
            _ => Vec::new(),
        };

        let exit = match status {
            Ok(status) => WorkerExit::from_status(status, tail),
            Err(e) => {
                log::error!("Failed to wait for worker {}: {}", worker_id, e);
                WorkerExit {
                    code: None,
                    signal: None,
                    stderr_tail: tail,
                }
            }
        };

        if exit.is_abnormal() {
            log::warn!("💥 Worker {} exited abnormally: {}", worker_id, exit.describe());
        } else {
            log::debug!("Worker {} exited cleanly", worker_id);
        }

        let _ = exit_tx.send(Some(exit.clone()));
        let _ = events.send((worker_id, WorkerEvent::Exited(exit)));
    }
}

/// Drain `reader` line by line, logging each line and keeping the last `keep`.
///
/// Reads until EOF even past invalid UTF-8 (decoded lossily), so the writer
/// never sees a closed pipe.
pub(crate) async fn collect_tail<R>(reader: R, keep: usize, label: &str) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(keep);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("[{} stderr] read failed: {}", label, e);
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        log::debug!("[{} stderr] {}", label, line);
        if keep == 0 {
            continue;
        }
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}
