//! The orchestrator actor.
//!
//! One task owns the worker registry. Callers talk to it through
//! [`SearchOrchestrator`], a cloneable handle that sends commands and awaits
//! oneshot replies; workers talk to it through a single tagged event channel.
//! Nothing else touches worker state, so no locks are involved.

use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::orchestrator::aggregator::{aggregate, AggregatedReport};
use crate::orchestrator::fault::WorkerFault;
use crate::workers::launcher::WorkerLauncher;
use crate::workers::process::{EventSender, KillSignal, WorkerEvent, WorkerExit, WorkerHandle};
use crate::workers::protocol::{OrchestratorMessage, SearchRequest, SearchResponse, WorkerId};
use crate::workers::state::{WorkerState, WorkerStatus};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};

/// Grace period for a force-killed worker to be reaped.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Which workers a search was sent or queued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchTicket {
    pub request_id: u64,
    pub workers: Vec<WorkerId>,
}

enum Command {
    Spawn {
        name: String,
        reply: oneshot::Sender<Option<WorkerId>>,
    },
    Search {
        query: String,
        reply: oneshot::Sender<FleetResult<SearchTicket>>,
    },
    Aggregate {
        reply: oneshot::Sender<AggregatedReport>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<WorkerState>>,
    },
    Diagnostics {
        reply: oneshot::Sender<Vec<WorkerFault>>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to a running orchestrator.
///
/// Cloning is cheap. The actor stops, and kills any remaining workers, once
/// every handle is dropped.
#[derive(Clone)]
pub struct SearchOrchestrator {
    commands: mpsc::UnboundedSender<Command>,
}

impl SearchOrchestrator {
    /// Start an orchestrator on the current tokio runtime.
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: FleetConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = OrchestratorActor {
            launcher,
            config,
            commands: commands_rx,
            events_tx,
            events_rx,
            workers: BTreeMap::new(),
            faults: Vec::new(),
            spawn_waiters: HashMap::new(),
            idle_waiters: Vec::new(),
            next_worker_id: 1,
            next_request_id: 1,
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> FleetResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| FleetError::OrchestratorClosed)?;
        reply_rx.await.map_err(|_| FleetError::OrchestratorClosed)
    }

    /// Launch and register a worker.
    ///
    /// Resolves once the worker is ready, has failed to become ready in time,
    /// or has exited. `None` when it could not be launched at all; the registry
    /// is then unchanged and the reason is in [`Self::diagnostics`].
    pub async fn spawn_worker(&self, name: impl Into<String>) -> Option<WorkerId> {
        let name = name.into();
        self.request(|reply| Command::Spawn { name, reply })
            .await
            .ok()
            .flatten()
    }

    /// Send `query` to every live worker. Idle workers start at once, busy or
    /// still-starting ones queue it behind their current work.
    ///
    /// Does not wait for results; poll [`Self::get_aggregated_results`] or
    /// await [`Self::wait_for_idle`].
    pub async fn search_across_workers(&self, query: impl Into<String>) -> FleetResult<SearchTicket> {
        let query = query.into();
        self.request(|reply| Command::Search { query, reply }).await?
    }

    /// Current report, recomputed from worker state on every call.
    pub async fn get_aggregated_results(&self) -> FleetResult<AggregatedReport> {
        self.request(|reply| Command::Aggregate { reply }).await
    }

    pub async fn snapshot(&self) -> FleetResult<Vec<WorkerState>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn diagnostics(&self) -> FleetResult<Vec<WorkerFault>> {
        self.request(|reply| Command::Diagnostics { reply }).await
    }

    /// Error when no worker is registered.
    pub async fn ensure_workers(&self) -> FleetResult<()> {
        if self.snapshot().await?.is_empty() {
            return Err(FleetError::NoWorkersRegistered);
        }
        Ok(())
    }

    /// Wait until no worker is starting or searching and nothing is queued.
    /// `false` on timeout.
    pub async fn wait_for_idle(&self, limit: Duration) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::WaitIdle { reply: reply_tx }).is_err() {
            return false;
        }
        matches!(timeout(limit, reply_rx).await, Ok(Ok(())))
    }

    /// Terminate every worker and drop confirmed-dead entries. Returns how many
    /// entries were removed; calling it again with nothing left is a no-op.
    pub async fn shutdown_workers(&self) -> FleetResult<usize> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct WorkerEntry {
    state: WorkerState,
    handle: WorkerHandle,
    queue: VecDeque<SearchRequest>,
    /// Force-killed during an earlier shutdown but not yet reaped.
    force_killed: bool,
}

struct OrchestratorActor {
    launcher: Arc<dyn WorkerLauncher>,
    config: FleetConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<(WorkerId, WorkerEvent)>,
    workers: BTreeMap<WorkerId, WorkerEntry>,
    faults: Vec<WorkerFault>,
    spawn_waiters: HashMap<WorkerId, oneshot::Sender<Option<WorkerId>>>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    next_worker_id: WorkerId,
    next_request_id: u64,
}

impl OrchestratorActor {
    async fn run(mut self) {
        log::debug!("Orchestrator started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some((worker_id, event)) = self.events_rx.recv() => {
                    self.handle_event(worker_id, event);
                }
            }
            self.notify_idle_waiters();
        }

        if !self.workers.is_empty() {
            log::info!("Orchestrator dropped, killing {} workers", self.workers.len());
        }
        for entry in self.workers.values() {
            entry.handle.kill(KillSignal::Kill);
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Spawn { name, reply } => self.spawn(name, reply).await,
            Command::Search { query, reply } => {
                let _ = reply.send(self.search(query));
            }
            Command::Aggregate { reply } => {
                let _ = reply.send(aggregate(self.workers.values().map(|e| &e.state)));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.workers.values().map(|e| e.state.clone()).collect());
            }
            Command::Diagnostics { reply } => {
                let _ = reply.send(self.faults.clone());
            }
            Command::WaitIdle { reply } => self.idle_waiters.push(reply),
            Command::Shutdown { reply } => {
                let removed = self.shutdown().await;
                let _ = reply.send(removed);
            }
        }
    }

    async fn spawn(&mut self, name: String, reply: oneshot::Sender<Option<WorkerId>>) {
        let worker_id = self.next_worker_id;
        let handle = match self
            .launcher
            .launch(worker_id, &name, self.events_tx.clone())
            .await
        {
            Ok(handle) => handle,
            Err(failure) => {
                log::warn!("❌ Failed to spawn worker '{}': {}", name, failure.reason);
                self.faults.push(WorkerFault::SpawnFailed {
                    name,
                    reason: failure.reason.to_string(),
                });
                let _ = reply.send(None);
                return;
            }
        };
        self.next_worker_id += 1;

        log::info!("🚀 Registered worker {} ('{}')", worker_id, name);
        self.workers.insert(
            worker_id,
            WorkerEntry {
                state: WorkerState::new(worker_id, name),
                handle,
                queue: VecDeque::new(),
                force_killed: false,
            },
        );
        self.spawn_waiters.insert(worker_id, reply);

        let events = self.events_tx.clone();
        let init_timeout = self.config.init_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(init_timeout).await;
            let _ = events.send((worker_id, WorkerEvent::InitTimedOut));
        });
    }

    fn search(&mut self, query: String) -> FleetResult<SearchTicket> {
        if self.workers.is_empty() {
            return Err(FleetError::NoWorkersRegistered);
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let targets: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, entry)| !entry.state.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        if targets.is_empty() {
            log::warn!("Search '{}' has no live workers", query);
        }

        for worker_id in &targets {
            if let Some(entry) = self.workers.get_mut(worker_id) {
                entry
                    .queue
                    .push_back(SearchRequest::new(query.clone(), request_id));
            }
            self.dispatch_next(*worker_id);
        }

        log::debug!("Request {} ('{}') sent to {:?}", request_id, query, targets);
        Ok(SearchTicket {
            request_id,
            workers: targets,
        })
    }

    /// Start the worker's next queued search if it is idle.
    fn dispatch_next(&mut self, worker_id: WorkerId) {
        let Some(entry) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if !entry.state.status.is_idle() {
            return;
        }
        let Some(request) = entry.queue.pop_front() else {
            return;
        };

        entry.state.begin_search(request.request_id);
        if let Err(e) = entry.handle.send(OrchestratorMessage::Search(request)) {
            log::warn!("{}", e);
            self.fail_worker(worker_id, e.to_string());
        }
    }

    fn handle_event(&mut self, worker_id: WorkerId, event: WorkerEvent) {
        if !self.workers.contains_key(&worker_id) {
            log::trace!("Dropping event for unknown worker {}: {:?}", worker_id, event);
            return;
        }
        match event {
            WorkerEvent::Message(response) => self.handle_response(worker_id, response),
            WorkerEvent::MalformedMessage(reason) => {
                self.faults.push(WorkerFault::MalformedMessage {
                    worker_id,
                    reason: reason.clone(),
                });
                self.fail_worker(worker_id, format!("malformed message: {}", reason));
                self.kill(worker_id);
            }
            WorkerEvent::Exited(exit) => self.handle_exit(worker_id, exit),
            WorkerEvent::InitTimedOut => {
                let still_spawning = self
                    .workers
                    .get(&worker_id)
                    .map(|e| e.state.status == WorkerStatus::Spawning)
                    .unwrap_or(false);
                if still_spawning {
                    log::warn!("⏰ Worker {} did not become ready in time", worker_id);
                    self.faults.push(WorkerFault::InitTimeout { worker_id });
                    self.fail_worker(worker_id, "init timeout");
                    self.kill(worker_id);
                }
            }
        }
    }

    fn handle_response(&mut self, worker_id: WorkerId, response: SearchResponse) {
        if response.worker_id() != worker_id {
            log::debug!(
                "Worker {} sent {} labelled as worker {}",
                worker_id,
                response.method(),
                response.worker_id()
            );
        }
        let Some(entry) = self.workers.get_mut(&worker_id) else {
            return;
        };

        match response {
            SearchResponse::Ready { .. } => {
                if entry.state.transition(WorkerStatus::Ready) {
                    log::info!("✅ Worker {} ready", worker_id);
                }
                self.release_spawn_waiter(worker_id);
                self.dispatch_next(worker_id);
            }
            SearchResponse::Progress {
                request_id,
                records_so_far,
                matches_so_far,
                bytes_processed,
                ..
            } => {
                if !is_current(&entry.state, request_id) {
                    log::trace!("Stale progress from worker {} for request {}", worker_id, request_id);
                    return;
                }
                entry.state.matches_found = matches_so_far;
                entry.state.records_seen = records_so_far;
                entry.state.bytes_processed = bytes_processed;
                entry.state.touch();
            }
            SearchResponse::Complete {
                request_id,
                matches_found,
                bytes_processed,
                elapsed_ms,
                ..
            } => {
                if !is_current(&entry.state, request_id) {
                    log::debug!("Stale completion from worker {} for request {}", worker_id, request_id);
                    return;
                }
                entry.state.matches_found = matches_found;
                entry.state.bytes_processed = bytes_processed;
                entry.state.elapsed_ms = elapsed_ms;
                entry.state.current_request = None;
                entry.state.transition(WorkerStatus::Completed);
                log::info!(
                    "Worker {} completed request {}: {} matches in {:.1}ms",
                    worker_id,
                    request_id,
                    matches_found,
                    elapsed_ms
                );
                self.dispatch_next(worker_id);
            }
            SearchResponse::Error {
                request_id, message, ..
            } => {
                log::warn!("❌ Worker {} reported an error: {}", worker_id, message);
                self.faults.push(WorkerFault::SearchError {
                    worker_id,
                    request_id,
                    message: message.clone(),
                });
                self.fail_worker(worker_id, message);
                if let Some(entry) = self.workers.get(&worker_id) {
                    let _ = entry.handle.send(OrchestratorMessage::Terminate);
                }
            }
        }
    }

    fn handle_exit(&mut self, worker_id: WorkerId, exit: WorkerExit) {
        let Some(entry) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if entry.state.status.is_terminal() {
            log::debug!("Worker {} exited after {} ({})", worker_id, entry.state.status, exit.describe());
        } else if exit.is_abnormal() {
            self.faults.push(WorkerFault::AbnormalExit {
                worker_id,
                code: exit.code,
                signal: exit.signal,
                stderr_tail: exit.stderr_tail.clone(),
            });
            self.fail_worker(worker_id, format!("exited abnormally: {}", exit.describe()));
        } else {
            log::info!("Worker {} exited", worker_id);
            entry.state.transition(WorkerStatus::Terminated);
            entry.state.current_request = None;
            entry.queue.clear();
        }
        self.release_spawn_waiter(worker_id);
    }

    /// Mark a worker Failed and drop its queued work.
    fn fail_worker(&mut self, worker_id: WorkerId, message: impl Into<String>) {
        if let Some(entry) = self.workers.get_mut(&worker_id) {
            entry.state.fail(message);
            if !entry.queue.is_empty() {
                log::debug!("Dropping {} queued requests for worker {}", entry.queue.len(), worker_id);
                entry.queue.clear();
            }
        }
        self.release_spawn_waiter(worker_id);
    }

    fn kill(&self, worker_id: WorkerId) {
        if let Some(entry) = self.workers.get(&worker_id) {
            entry.handle.kill(KillSignal::Kill);
        }
    }

    fn release_spawn_waiter(&mut self, worker_id: WorkerId) {
        if let Some(reply) = self.spawn_waiters.remove(&worker_id) {
            let _ = reply.send(Some(worker_id));
        }
    }

    fn is_quiescent(&self) -> bool {
        self.workers.values().all(|entry| {
            !matches!(
                entry.state.status,
                WorkerStatus::Spawning | WorkerStatus::Searching
            ) && entry.queue.is_empty()
        })
    }

    fn notify_idle_waiters(&mut self) {
        if self.idle_waiters.is_empty() || !self.is_quiescent() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn shutdown(&mut self) -> usize {
        if self.workers.is_empty() {
            log::debug!("Shutdown requested with no workers");
            return 0;
        }
        log::info!("🛑 Shutting down {} workers", self.workers.len());

        // 前回のシャットダウンで強制終了済みのものは待たない
        let live: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, entry)| !entry.handle.has_exited() && !entry.force_killed)
            .map(|(id, _)| *id)
            .collect();

        for worker_id in &live {
            if let Some(entry) = self.workers.get(worker_id) {
                if let Err(e) = entry.handle.send(OrchestratorMessage::Terminate) {
                    log::debug!("{}", e);
                }
            }
        }

        let deadline = Instant::now() + self.config.shutdown_timeout();
        for worker_id in &live {
            let Some(entry) = self.workers.get_mut(worker_id) else {
                continue;
            };
            if timeout_at(deadline, entry.handle.wait()).await.is_ok() {
                continue;
            }
            log::warn!("⚠️ Worker {} did not exit in time, killing", worker_id);
            self.faults.push(WorkerFault::ShutdownTimeout {
                worker_id: *worker_id,
            });
            entry.handle.kill(KillSignal::Kill);
            entry.force_killed = true;
            if timeout(KILL_GRACE, entry.handle.wait()).await.is_err() {
                log::error!("❌ Worker {} survived a kill, leaving it registered", worker_id);
            }
        }

        for entry in self.workers.values_mut() {
            entry.queue.clear();
            if !entry.state.status.is_terminal() {
                entry.state.transition(WorkerStatus::Terminated);
                entry.state.current_request = None;
            }
        }

        let dead: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, entry)| entry.state.status.is_terminal() && entry.handle.has_exited())
            .map(|(id, _)| *id)
            .collect();
        for worker_id in &dead {
            self.workers.remove(worker_id);
            self.release_spawn_waiter(*worker_id);
        }
        log::info!(
            "Shutdown removed {} workers ({} still registered)",
            dead.len(),
            self.workers.len()
        );
        dead.len()
    }
}

fn is_current(state: &WorkerState, request_id: u64) -> bool {
    state.status == WorkerStatus::Searching && state.current_request == Some(request_id)
}
