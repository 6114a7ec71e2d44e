//! Engine daemon entry point

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use datahub::cli::{Cli, Command};
use datahub::config::EngineConfig;
use datahub::connector::ConnectorRegistry;
use datahub::domain::TaskPayload;
use datahub::events::{create_event_bus, spawn_event_logger};
use datahub::executor::SyncExecutor;
use datahub::repo::{MemorySink, Repos, StoreBackend};
use datahub::scheduler::Scheduler;
use datahub::trigger;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(config).await,
        Command::CheckTask { file, owner } => check_task(&file, &owner),
        Command::NextRuns { cron, tz, count } => next_runs(&cron, &tz, count),
    }
}

async fn run(config_path: Option<std::path::PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => EngineConfig::load(&path).wrap_err("loading engine config")?,
        None => EngineConfig::from_env().wrap_err("reading engine config from environment")?,
    };

    let repos = match &config.store_path {
        Some(path) => {
            let store = syncstore::SqliteStore::open(path).wrap_err("opening store")?;
            let backend = Arc::new(StoreBackend::new(store));
            Repos::new(
                backend.clone(),
                backend.clone(),
                backend.clone(),
                backend.clone(),
                backend.clone(),
                backend.clone(),
                backend,
                Arc::new(MemorySink::new()),
            )
        }
        None => Repos::in_memory(),
    };

    let bus = create_event_bus();
    let _logger = config
        .event_log_dir
        .as_ref()
        .map(|dir| spawn_event_logger(&bus, dir.clone()));

    let registry = Arc::new(ConnectorRegistry::new());
    let executor = Arc::new(SyncExecutor::new(repos.clone(), registry, bus));
    let scheduler = Scheduler::new(config.scheduler_config(), repos, executor);

    scheduler.start().await?;
    info!("engine running; Ctrl-C to stop");

    shutdown_signal().await;
    info!("shutdown requested");
    scheduler.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("signal handler installs");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn check_task(file: &std::path::Path, owner: &str) -> Result<()> {
    let raw = std::fs::read_to_string(file).wrap_err_with(|| format!("reading {}", file.display()))?;
    match TaskPayload::from_json(&raw).and_then(|payload| payload.into_task(owner)) {
        Ok(task) => {
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("rejected: {e}");
            std::process::exit(1);
        }
    }
}

fn next_runs(cron: &str, tz: &str, count: usize) -> Result<()> {
    let tz = trigger::parse_tz(tz)?;
    let times = trigger::upcoming(cron, tz, chrono::Utc::now(), count)?;
    for t in times {
        println!("{}", t.to_rfc3339());
    }
    Ok(())
}
