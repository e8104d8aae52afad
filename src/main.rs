use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use pipesync::config;
use pipesync::db;
use pipesync::integrations::Integrations;
use pipesync::locks::TenantLocks;
use pipesync::orchestrator::Orchestrator;
use pipesync::queue::SqliteQueue;
use pipesync::scheduler::Scheduler;
use pipesync::workspace::WorkspaceClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Pipe synchronization server")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = Arc::new(config::load(Some(&args.config))?);
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let workspace = Arc::new(WorkspaceClient::from_config(&cfg)?);
    let integrations = Arc::new(Integrations::from_config(&cfg)?);
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        cfg.clone(),
        integrations,
        workspace,
    ));

    let queue = SqliteQueue::new(pool.clone(), cfg.scheduler.dequeue_batch);
    queue.recover().await?;

    let scheduler = Arc::new(Scheduler::new(
        orchestrator,
        Arc::new(queue),
        Arc::new(TenantLocks::default()),
        cfg.scheduler.clone(),
    ));

    info!(integrations = cfg.integrations.len(), "starting pipe sync server");
    tokio::select! {
        _ = scheduler.run() => {
            error!("scheduler exited");
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutting down");
        }
    }
    Ok(())
}
