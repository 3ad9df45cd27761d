//! Worker mode: the process side of the IPC channel.
//!
//! A worker announces itself with `worker/ready`, then runs search requests one
//! at a time in arrival order. Each search streams the tool's output through the
//! record parser, reports `search/progress` as matches accumulate, and ends with
//! exactly one `search/complete` or `search/error`. `worker/terminate` (or the
//! orchestrator closing the channel) stops any running tool and exits the loop.

use crate::config::FleetConfig;
use crate::error::IpcError;
use crate::searchers::SearchTool;
use crate::workers::ipc::{FrameReader, FrameWriter};
use crate::workers::protocol::{OrchestratorMessage, SearchRequest, SearchResponse, WorkerId};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

/// Everything a worker process needs to know.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: WorkerId,
    pub tool: SearchTool,
    pub search_path: PathBuf,
    pub progress_every: u64,
}

impl WorkerSettings {
    pub fn from_config(worker_id: WorkerId, config: &FleetConfig) -> Self {
        Self {
            worker_id,
            tool: SearchTool::new(config.tool.clone())
                .with_args(config.tool_args.iter().cloned())
                .with_stderr_tail_lines(config.stderr_tail_lines),
            search_path: config.cache_path.clone(),
            progress_every: config.progress_every.max(1),
        }
    }
}

/// What arrives from the orchestrator side.
type Inbound = Result<OrchestratorMessage, IpcError>;

enum Flow {
    Continue,
    Stop,
}

/// Run the worker loop over `reader`/`writer` until terminated.
///
/// Returns an error only when the channel itself breaks.
pub async fn run_worker<R, W>(settings: WorkerSettings, reader: R, writer: W) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(read_inbound(reader, inbound_tx));

    let mut worker = SearchWorker {
        settings,
        writer: FrameWriter::new(writer),
        inbound: inbound_rx,
        queue: VecDeque::new(),
    };
    let result = worker.run().await;

    reader_task.abort();
    let _ = worker.writer.shutdown().await;
    result
}

async fn read_inbound<R>(reader: R, inbound_tx: mpsc::UnboundedSender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(BufReader::new(reader));
    loop {
        match reader.read_frame::<OrchestratorMessage>().await {
            Ok(Some(message)) => {
                log::trace!("Received {}", message.method());
                if inbound_tx.send(Ok(message)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                log::debug!("Orchestrator closed the channel");
                return;
            }
            Err(e) => {
                let _ = inbound_tx.send(Err(e));
                return;
            }
        }
    }
}

struct SearchWorker<W> {
    settings: WorkerSettings,
    writer: FrameWriter<W>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    queue: VecDeque<SearchRequest>,
}

impl<W: AsyncWrite + Unpin> SearchWorker<W> {
    async fn run(&mut self) -> Result<(), IpcError> {
        let worker_id = self.settings.worker_id;
        log::info!(
            "Worker {} ready (tool: {}, path: {})",
            worker_id,
            self.settings.tool.binary(),
            self.settings.search_path.display()
        );
        self.send(SearchResponse::Ready { worker_id }).await?;

        loop {
            if let Some(request) = self.queue.pop_front() {
                match self.run_search(request).await? {
                    Flow::Continue => continue,
                    Flow::Stop => break,
                }
            }

            let inbound = self.inbound.recv().await;
            if let Flow::Stop = self.accept(inbound).await? {
                break;
            }
        }

        log::info!("👋 Worker {} stopping", worker_id);
        Ok(())
    }

    /// Queue a search or decide to stop.
    async fn accept(&mut self, inbound: Option<Inbound>) -> Result<Flow, IpcError> {
        match inbound {
            Some(Ok(OrchestratorMessage::Search(request))) => {
                log::debug!(
                    "Worker {} queued request {} ({} waiting)",
                    self.settings.worker_id,
                    request.request_id,
                    self.queue.len()
                );
                self.queue.push_back(request);
                Ok(Flow::Continue)
            }
            Some(Ok(OrchestratorMessage::Terminate)) => {
                log::info!("🚪 Worker {} received terminate", self.settings.worker_id);
                Ok(Flow::Stop)
            }
            Some(Err(e)) => {
                log::error!("❌ Worker {} lost framing on stdin: {}", self.settings.worker_id, e);
                self.send(SearchResponse::Error {
                    worker_id: self.settings.worker_id,
                    request_id: None,
                    message: format!("malformed message from orchestrator: {}", e),
                })
                .await?;
                Err(e)
            }
            None => Ok(Flow::Stop),
        }
    }

    async fn run_search(&mut self, request: SearchRequest) -> Result<Flow, IpcError> {
        let worker_id = self.settings.worker_id;
        let request_id = request.request_id;
        log::debug!("Worker {} searching '{}' (request {})", worker_id, request.query, request_id);

        let mut run = match self.settings.tool.start(&request.query, &self.settings.search_path) {
            Ok(run) => run,
            Err(e) => {
                self.send_error(request_id, e.to_string()).await?;
                return Ok(Flow::Continue);
            }
        };

        let every = self.settings.progress_every;
        let mut next_progress = every;

        loop {
            tokio::select! {
                batch = run.next_events() => match batch {
                    Ok(Some(events)) => {
                        for diagnostic in events.iter().filter_map(|e| e.as_diagnostic()) {
                            log::debug!("Worker {} skipped line: {}", worker_id, diagnostic.reason);
                        }
                        // progress_everyの倍数をまたいだら途中経過を送信
                        let stats = run.stats();
                        if stats.matches >= next_progress {
                            next_progress = (stats.matches / every + 1) * every;
                            self.send(SearchResponse::Progress {
                                worker_id,
                                request_id,
                                records_so_far: stats.records,
                                matches_so_far: stats.matches,
                                bytes_processed: stats.bytes_processed,
                            })
                            .await?;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        run.kill().await;
                        let _ = run.wait().await;
                        self.send_error(request_id, e.to_string()).await?;
                        return Ok(Flow::Continue);
                    }
                },
                // 検索中に届いたリクエストはキューへ、terminateなら中断
                inbound = self.inbound.recv() => {
                    if let Flow::Stop = self.accept(inbound).await? {
                        run.kill().await;
                        let _ = run.wait().await;
                        log::info!("🛑 Worker {} abandoned request {}", worker_id, request_id);
                        return Ok(Flow::Stop);
                    }
                }
            }
        }

        match run.wait().await {
            Ok(outcome) if outcome.is_success() => {
                log::debug!(
                    "✅ Worker {} finished request {}: {} matches in {:.1}ms",
                    worker_id,
                    request_id,
                    outcome.stats.matches,
                    outcome.elapsed_ms
                );
                self.send(SearchResponse::Complete {
                    worker_id,
                    request_id,
                    matches_found: outcome.stats.matches,
                    bytes_processed: outcome.stats.bytes_processed,
                    elapsed_ms: outcome.elapsed_ms,
                })
                .await?;
            }
            Ok(outcome) => self.send_error(request_id, outcome.describe_failure()).await?,
            Err(e) => self.send_error(request_id, e.to_string()).await?,
        }
        Ok(Flow::Continue)
    }

    async fn send_error(&mut self, request_id: u64, message: String) -> Result<(), IpcError> {
        log::warn!("❌ Worker {} request {} failed: {}", self.settings.worker_id, request_id, message);
        self.send(SearchResponse::Error {
            worker_id: self.settings.worker_id,
            request_id: Some(request_id),
            message,
        })
        .await
    }

    async fn send(&mut self, response: SearchResponse) -> Result<(), IpcError> {
        log::trace!("Worker {} -> {}", self.settings.worker_id, response.method());
        self.writer.write_frame(&response).await
    }
}
