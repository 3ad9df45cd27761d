//! rgfleet - ripgrep search across a fleet of worker processes
//!
//! Command-line usage:
//!   rgfleet [--workers N] [--cache-path DIR] [--tool rg] [--config FILE] <query>
//!   rgfleet --worker-id <id> --cache-path DIR [--tool rg]   (worker mode, spawned by rgfleet itself)

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use rgfleet::workers::{run_worker, WorkerSettings};
use rgfleet::{FleetConfig, ProcessLauncher, SearchOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// rgfleet - parallel ripgrep over worker processes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Search query (required unless running as a worker)
    query: Option<String>,

    /// Number of worker processes
    #[arg(short, long, default_value_t = 3)]
    workers: usize,

    /// Directory to search
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Search tool binary
    #[arg(long)]
    tool: Option<String>,

    /// Extra argument passed to the search tool (repeatable)
    #[arg(long = "tool-arg", allow_hyphen_values = true)]
    tool_args: Vec<String>,

    /// Report progress every N matches
    #[arg(long)]
    progress_every: Option<u64>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run as worker <id> speaking framed JSON on stdin/stdout
    #[arg(long, hide = true)]
    worker_id: Option<u32>,
}

impl Cli {
    /// ファイル設定にコマンドライン引数を上書き
    fn fleet_config(&self) -> Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => FleetConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => FleetConfig::default(),
        };
        if let Some(path) = &self.cache_path {
            config.cache_path = path.clone();
        }
        if let Some(tool) = &self.tool {
            config.tool = tool.clone();
        }
        if !self.tool_args.is_empty() {
            config.tool_args = self.tool_args.clone();
        }
        if let Some(every) = self.progress_every {
            config.progress_every = every;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.fleet_config()?;

    match cli.worker_id {
        Some(worker_id) => run_worker_mode(worker_id, &config).await,
        None => {
            let Some(query) = cli.query.as_deref() else {
                bail!("a search query is required");
            };
            run_search(query, cli.workers, config).await
        }
    }
}

/// ワーカーモード: stdin/stdoutでオーケストレーターと通信
async fn run_worker_mode(worker_id: u32, config: &FleetConfig) -> Result<()> {
    let name = std::env::var("RGFLEET_WORKER_NAME").unwrap_or_default();
    debug!(
        "Starting worker {} '{}' in {}",
        worker_id,
        name,
        config.cache_path.display()
    );
    let settings = WorkerSettings::from_config(worker_id, config);
    run_worker(settings, tokio::io::stdin(), tokio::io::stdout())
        .await
        .with_context(|| format!("Worker {} lost its channel", worker_id))
}

async fn run_search(query: &str, worker_count: usize, config: FleetConfig) -> Result<()> {
    // 全体の待機時間はワーカー起動と終了のタイムアウトとは別枠
    let search_timeout = Duration::from_secs(300);
    let launcher = Arc::new(ProcessLauncher::new(config.clone()));
    let orchestrator = SearchOrchestrator::new(launcher, config);

    for n in 0..worker_count {
        if orchestrator.spawn_worker(format!("worker-{}", n + 1)).await.is_none() {
            warn!("worker-{} failed to start", n + 1);
        }
    }

    if let Err(e) = orchestrator.ensure_workers().await {
        for fault in orchestrator.diagnostics().await.unwrap_or_default() {
            eprintln!("{}", fault);
        }
        eprintln!("rgfleet: {}", e);
        std::process::exit(1);
    }

    let ticket = orchestrator.search_across_workers(query).await?;
    info!("Request {} sent to {} workers", ticket.request_id, ticket.workers.len());

    if !orchestrator.wait_for_idle(search_timeout).await {
        warn!("Search did not finish within {:?}", search_timeout);
    }

    let report = orchestrator.get_aggregated_results().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    for fault in orchestrator.diagnostics().await? {
        eprintln!("{}", fault);
    }
    orchestrator.shutdown_workers().await?;
    Ok(())
}
