use anyhow::Result;
use async_trait::async_trait;
use rgfleet::error::{FleetError, SpawnFailure};
use rgfleet::workers::{
    EventSender, OrchestratorMessage, SearchResponse, WorkerEvent, WorkerExit, WorkerHandle,
    WorkerId, WorkerLauncher,
};
use rgfleet::{FleetConfig, ProcessLauncher, SearchOrchestrator, WorkerFault, WorkerStatus};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// インメモリワーカーの振る舞い
#[derive(Debug, Clone)]
enum Script {
    /// 各検索に `matches` 件で完了を返す
    Complete { matches: u64, delay: Duration },
    /// 途中経過を送ってから完了する
    ProgressThenComplete {
        progress: u64,
        matches: u64,
        delay: Duration,
    },
    /// 検索中に終了コードで落ちる
    CrashOnSearch { code: i32 },
    /// 検索エラーを返す
    ErrorOnSearch { message: String },
    /// readyの直後に正常終了する
    ExitAfterReady,
    /// readyを送らない
    Silent,
    /// terminateを無視する
    IgnoreTerminate,
    /// 検索中に壊れたフレームを送る
    GarbleOnSearch,
    /// terminateもkillも無視する
    Unkillable,
}

/// Scripts are handed out in launch order; the last one repeats.
struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    seen_requests: Arc<Mutex<Vec<(WorkerId, u64)>>>,
}

impl ScriptedLauncher {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            seen_requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn next_script(&self) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.len() > 1 {
            scripts.pop_front().unwrap()
        } else {
            scripts.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        worker_id: WorkerId,
        _name: &str,
        events: EventSender,
    ) -> Result<WorkerHandle, SpawnFailure> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_token = CancellationToken::new();

        tokio::spawn(fake_worker(
            worker_id,
            self.next_script(),
            outbound_rx,
            kill_token.clone(),
            exit_tx,
            events,
            self.seen_requests.clone(),
        ));
        Ok(WorkerHandle::new(worker_id, None, outbound_tx, kill_token, exit_rx))
    }
}

async fn fake_worker(
    worker_id: WorkerId,
    script: Script,
    mut inbox: mpsc::UnboundedReceiver<OrchestratorMessage>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<WorkerExit>>,
    events: EventSender,
    seen_requests: Arc<Mutex<Vec<(WorkerId, u64)>>>,
) {
    let send = |response: SearchResponse| {
        let _ = events.send((worker_id, WorkerEvent::Message(response)));
    };
    let exit = |code: Option<i32>, signal: Option<i32>| WorkerExit {
        code,
        signal,
        stderr_tail: vec![format!("worker {} going down", worker_id)],
    };

    if !matches!(script, Script::Silent) {
        send(SearchResponse::Ready { worker_id });
    }
    if matches!(script, Script::ExitAfterReady) {
        let exit = exit(Some(0), None);
        let _ = exit_tx.send(Some(exit.clone()));
        let _ = events.send((worker_id, WorkerEvent::Exited(exit)));
        return;
    }

    let result = loop {
        let message = tokio::select! {
            _ = kill.cancelled(), if !matches!(script, Script::Unkillable) => break exit(None, Some(9)),
            message = inbox.recv() => message,
        };
        let request = match message {
            Some(OrchestratorMessage::Search(request)) => request,
            Some(OrchestratorMessage::Terminate)
                if matches!(script, Script::IgnoreTerminate | Script::Unkillable) =>
            {
                continue
            }
            Some(OrchestratorMessage::Terminate) | None => break exit(Some(0), None),
        };
        seen_requests
            .lock()
            .unwrap()
            .push((worker_id, request.request_id));
        let request_id = request.request_id;

        match &script {
            Script::Complete { matches, delay } => {
                tokio::time::sleep(*delay).await;
                send(SearchResponse::Complete {
                    worker_id,
                    request_id,
                    matches_found: *matches,
                    bytes_processed: matches * 100,
                    elapsed_ms: 1.5,
                });
            }
            Script::ProgressThenComplete {
                progress,
                matches,
                delay,
            } => {
                send(SearchResponse::Progress {
                    worker_id,
                    request_id,
                    records_so_far: progress * 2,
                    matches_so_far: *progress,
                    bytes_processed: 10,
                });
                tokio::time::sleep(*delay).await;
                send(SearchResponse::Complete {
                    worker_id,
                    request_id,
                    matches_found: *matches,
                    bytes_processed: 20,
                    elapsed_ms: delay.as_secs_f64() * 1000.0,
                });
            }
            Script::CrashOnSearch { code } => {
                send(SearchResponse::Progress {
                    worker_id,
                    request_id,
                    records_so_far: 3,
                    matches_so_far: 3,
                    bytes_processed: 10,
                });
                break exit(Some(*code), None);
            }
            Script::ErrorOnSearch { message } => send(SearchResponse::Error {
                worker_id,
                request_id: Some(request_id),
                message: message.clone(),
            }),
            Script::GarbleOnSearch => {
                send(SearchResponse::Progress {
                    worker_id,
                    request_id,
                    records_so_far: 2,
                    matches_so_far: 2,
                    bytes_processed: 10,
                });
                let _ = events.send((
                    worker_id,
                    WorkerEvent::MalformedMessage(
                        "expected Content-Length header, got: garbage".to_string(),
                    ),
                ));
            }
            Script::ExitAfterReady | Script::Silent | Script::IgnoreTerminate | Script::Unkillable => {}
        }
    };

    let _ = exit_tx.send(Some(result.clone()));
    let _ = events.send((worker_id, WorkerEvent::Exited(result)));
}

fn complete(matches: u64) -> Script {
    Script::Complete {
        matches,
        delay: Duration::from_millis(10),
    }
}

fn fast_config() -> FleetConfig {
    FleetConfig::default()
        .with_init_timeout(Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_millis(200))
}

const IDLE: Duration = Duration::from_secs(5);

/// 3ワーカーの結果が合算される
#[tokio::test]
async fn test_three_workers_sum_to_fourteen() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![complete(5), complete(7), complete(2)]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());

    for name in ["w1", "w2", "w3"] {
        assert!(orchestrator.spawn_worker(name).await.is_some());
    }
    let ticket = orchestrator.search_across_workers("bun").await?;
    assert_eq!(ticket.workers, vec![1, 2, 3]);
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let report = orchestrator.get_aggregated_results().await?;
    assert_eq!(report.total_matches, 14);
    let per_worker: Vec<(WorkerId, u64)> = report
        .stats
        .iter()
        .map(|s| (s.worker_id, s.matches_found))
        .collect();
    assert_eq!(per_worker, vec![(1, 5), (2, 7), (3, 2)]);

    for state in orchestrator.snapshot().await? {
        assert_eq!(state.status, WorkerStatus::Completed);
        assert_eq!(state.current_request, None);
    }

    orchestrator.shutdown_workers().await?;
    Ok(())
}

/// 追加メッセージがなければ集計結果は変わらない
#[tokio::test]
async fn test_aggregate_is_stable_without_new_messages() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![complete(5), complete(7)]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    orchestrator.spawn_worker("w1").await;
    orchestrator.spawn_worker("w2").await;

    orchestrator.search_across_workers("bun").await?;
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let first = orchestrator.get_aggregated_results().await?;
    let second = orchestrator.get_aggregated_results().await?;
    assert_eq!(first, second);

    orchestrator.shutdown_workers().await?;
    Ok(())
}

/// 検索中に137で落ちたワーカーは集計から除外され、他は影響を受けない
#[tokio::test]
async fn test_worker_crash_mid_search_is_excluded() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![
        complete(5),
        Script::CrashOnSearch { code: 137 },
        complete(2),
    ]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    for name in ["w1", "w2", "w3"] {
        orchestrator.spawn_worker(name).await;
    }

    orchestrator.search_across_workers("bun").await?;
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let report = orchestrator.get_aggregated_results().await?;
    assert_eq!(report.total_matches, 7);
    assert_eq!(report.stats.len(), 3);

    let states = orchestrator.snapshot().await?;
    assert_eq!(states[0].status, WorkerStatus::Completed);
    assert_eq!(states[1].status, WorkerStatus::Failed);
    assert_eq!(states[2].status, WorkerStatus::Completed);

    let faults = orchestrator.diagnostics().await?;
    assert!(faults.iter().any(|fault| matches!(
        fault,
        WorkerFault::AbnormalExit { worker_id: 2, code: Some(137), stderr_tail, .. }
            if !stderr_tail.is_empty()
    )));

    orchestrator.shutdown_workers().await?;
    Ok(())
}

/// 存在しないバイナリでの起動は登録されない
#[tokio::test]
async fn test_spawn_with_missing_binary_leaves_registry_unchanged() -> Result<()> {
    let config = fast_config().with_worker_binary("/definitely/not/here/rgfleet");
    let launcher = Arc::new(ProcessLauncher::new(config.clone()));
    let orchestrator = SearchOrchestrator::new(launcher, config);

    assert_eq!(orchestrator.spawn_worker("ghost").await, None);
    assert!(orchestrator.snapshot().await?.is_empty());

    let faults = orchestrator.diagnostics().await?;
    assert_eq!(faults.len(), 1);
    assert!(matches!(&faults[0], WorkerFault::SpawnFailed { name, .. } if name == "ghost"));

    assert!(matches!(
        orchestrator.ensure_workers().await,
        Err(FleetError::NoWorkersRegistered)
    ));
    assert!(matches!(
        orchestrator.search_across_workers("bun").await,
        Err(FleetError::NoWorkersRegistered)
    ));
    Ok(())
}

/// 2回目のシャットダウンは何もしない
#[tokio::test]
async fn test_shutdown_twice_is_noop() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![complete(1)]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    orchestrator.spawn_worker("w1").await;
    orchestrator.spawn_worker("w2").await;

    assert_eq!(orchestrator.shutdown_workers().await?, 2);
    assert!(orchestrator.snapshot().await?.is_empty());

    assert_eq!(orchestrator.shutdown_workers().await?, 0);
    assert!(orchestrator.snapshot().await?.is_empty());
    assert!(orchestrator.diagnostics().await?.is_empty());
    Ok(())
}

/// terminateに応じないワーカーは強制終了される
#[tokio::test]
async fn test_shutdown_kills_stragglers() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![complete(1), Script::IgnoreTerminate]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    orchestrator.spawn_worker("polite").await;
    orchestrator.spawn_worker("stubborn").await;

    assert_eq!(orchestrator.shutdown_workers().await?, 2);
    let faults = orchestrator.diagnostics().await?;
    assert_eq!(faults, vec![WorkerFault::ShutdownTimeout { worker_id: 2 }]);
    Ok(())
}

/// killにも応じないワーカーは2回目のシャットダウンで待たず、診断も増えない
#[tokio::test]
async fn test_second_shutdown_skips_unreaped_worker() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![Script::Unkillable]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    orchestrator.spawn_worker("zombie").await;

    assert_eq!(orchestrator.shutdown_workers().await?, 0);
    let states = orchestrator.snapshot().await?;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, WorkerStatus::Terminated);
    assert_eq!(
        orchestrator.diagnostics().await?,
        vec![WorkerFault::ShutdownTimeout { worker_id: 1 }]
    );

    let started = std::time::Instant::now();
    assert_eq!(orchestrator.shutdown_workers().await?, 0);
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(orchestrator.diagnostics().await?.len(), 1);
    Ok(())
}

/// 壊れたフレームを送ったワーカーはFailedになり、他のワーカーは完了する
#[tokio::test]
async fn test_malformed_frame_fails_only_that_worker() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![complete(5), Script::GarbleOnSearch, complete(2)]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    for name in ["w1", "w2", "w3"] {
        orchestrator.spawn_worker(name).await;
    }

    orchestrator.search_across_workers("bun").await?;
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let states = orchestrator.snapshot().await?;
    assert_eq!(states[0].status, WorkerStatus::Completed);
    assert_eq!(states[1].status, WorkerStatus::Failed);
    assert_eq!(states[2].status, WorkerStatus::Completed);
    assert_eq!(orchestrator.get_aggregated_results().await?.total_matches, 7);

    let faults = orchestrator.diagnostics().await?;
    assert!(faults.iter().any(|fault| matches!(
        fault,
        WorkerFault::MalformedMessage { worker_id: 2, reason } if reason.contains("garbage")
    )));

    assert_eq!(orchestrator.shutdown_workers().await?, 3);
    Ok(())
}

/// readyを返さないワーカーは登録されたままFailedになる
#[tokio::test]
async fn test_init_timeout_marks_worker_failed() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![Script::Silent, complete(4)]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());

    assert_eq!(orchestrator.spawn_worker("silent").await, Some(1));
    assert_eq!(orchestrator.spawn_worker("ok").await, Some(2));

    let states = orchestrator.snapshot().await?;
    assert_eq!(states[0].status, WorkerStatus::Failed);
    assert_eq!(states[0].last_error.as_deref(), Some("init timeout"));
    assert_eq!(states[1].status, WorkerStatus::Ready);

    let ticket = orchestrator.search_across_workers("bun").await?;
    assert_eq!(ticket.workers, vec![2]);
    assert!(orchestrator.wait_for_idle(IDLE).await);
    assert_eq!(orchestrator.get_aggregated_results().await?.total_matches, 4);

    assert!(orchestrator
        .diagnostics()
        .await?
        .contains(&WorkerFault::InitTimeout { worker_id: 1 }));
    orchestrator.shutdown_workers().await?;
    Ok(())
}

/// 検索中のリクエストはワーカーごとに順番待ちになる
#[tokio::test]
async fn test_requests_to_busy_worker_are_queued() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![Script::Complete {
        matches: 3,
        delay: Duration::from_millis(50),
    }]);
    let seen = launcher.seen_requests.clone();
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    orchestrator.spawn_worker("w1").await;

    let first = orchestrator.search_across_workers("one").await?;
    let second = orchestrator.search_across_workers("two").await?;
    assert_eq!(first.workers, second.workers);

    let states = orchestrator.snapshot().await?;
    assert_eq!(states[0].status, WorkerStatus::Searching);
    assert_eq!(states[0].current_request, Some(first.request_id));

    assert!(orchestrator.wait_for_idle(IDLE).await);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(1, first.request_id), (1, second.request_id)]
    );
    let states = orchestrator.snapshot().await?;
    assert_eq!(states[0].status, WorkerStatus::Completed);
    assert_eq!(states[0].matches_found, 3);

    orchestrator.shutdown_workers().await?;
    Ok(())
}

/// 検索途中でも集計結果を取得できる
#[tokio::test]
async fn test_progress_visible_mid_search() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![Script::ProgressThenComplete {
        progress: 4,
        matches: 9,
        delay: Duration::from_millis(300),
    }]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    orchestrator.spawn_worker("w1").await;
    orchestrator.search_across_workers("bun").await?;

    let mut saw_progress = false;
    for _ in 0..100 {
        let report = orchestrator.get_aggregated_results().await?;
        if report.total_matches == 4 {
            saw_progress = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saw_progress, "progress never reached the report");

    assert!(orchestrator.wait_for_idle(IDLE).await);
    let states = orchestrator.snapshot().await?;
    assert_eq!(states[0].matches_found, 9);
    assert_eq!(states[0].bytes_processed, 20);

    orchestrator.shutdown_workers().await?;
    Ok(())
}

/// 検索エラーはワーカーをFailedにし、診断に残る
#[tokio::test]
async fn test_search_error_fails_worker() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![
        Script::ErrorOnSearch {
            message: "regex parse error".to_string(),
        },
        complete(6),
    ]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    orchestrator.spawn_worker("bad").await;
    orchestrator.spawn_worker("good").await;

    let ticket = orchestrator.search_across_workers("(").await?;
    assert!(orchestrator.wait_for_idle(IDLE).await);

    let report = orchestrator.get_aggregated_results().await?;
    assert_eq!(report.total_matches, 6);

    let states = orchestrator.snapshot().await?;
    assert_eq!(states[0].status, WorkerStatus::Failed);
    assert_eq!(states[0].last_error.as_deref(), Some("regex parse error"));

    assert!(orchestrator
        .diagnostics()
        .await?
        .contains(&WorkerFault::SearchError {
            worker_id: 1,
            request_id: Some(ticket.request_id),
            message: "regex parse error".to_string(),
        }));

    orchestrator.shutdown_workers().await?;
    Ok(())
}

/// 予期しない正常終了はTerminatedとして扱う
#[tokio::test]
async fn test_unexpected_clean_exit_is_terminated() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![Script::ExitAfterReady, complete(2)]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    orchestrator.spawn_worker("quitter").await;
    orchestrator.spawn_worker("stayer").await;

    let mut status = WorkerStatus::Ready;
    for _ in 0..100 {
        status = orchestrator.snapshot().await?[0].status;
        if status == WorkerStatus::Terminated {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, WorkerStatus::Terminated);

    let ticket = orchestrator.search_across_workers("bun").await?;
    assert_eq!(ticket.workers, vec![2]);
    assert!(orchestrator.wait_for_idle(IDLE).await);
    assert!(orchestrator.diagnostics().await?.is_empty());

    orchestrator.shutdown_workers().await?;
    Ok(())
}

/// 検索が何度も繰り返せる
#[tokio::test]
async fn test_repeated_searches_reset_counts() -> Result<()> {
    let launcher = ScriptedLauncher::new(vec![complete(5)]);
    let orchestrator = SearchOrchestrator::new(launcher, fast_config());
    orchestrator.spawn_worker("w1").await;

    for _ in 0..3 {
        orchestrator.search_across_workers("bun").await?;
        assert!(orchestrator.wait_for_idle(IDLE).await);
        assert_eq!(orchestrator.get_aggregated_results().await?.total_matches, 5);
    }

    orchestrator.shutdown_workers().await?;
    Ok(())
}
