use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use pipesync::authorization::{self, Authorization};
use pipesync::config::{self, Config};
use pipesync::db::{self, Pool};
use pipesync::integrations::Integrations;
use pipesync::locks::TenantLocks;
use pipesync::model::{ObjectType, ServiceId};
use pipesync::orchestrator::{Orchestrator, Selection};
use pipesync::pipe;
use pipesync::queue::SqliteQueue;
use pipesync::scheduler::{RunNow, Scheduler};
use pipesync::status;
use pipesync::workspace::WorkspaceClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Operate pipes of the sync server")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store an access token for a service
    Authorize {
        #[arg(long)]
        workspace: i64,
        #[arg(long)]
        service: ServiceId,
        #[arg(long)]
        token: String,
        /// Token lifetime in seconds
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Validate service parameters and save a pipe
    Setup {
        #[arg(long)]
        workspace: i64,
        #[arg(long)]
        service: ServiceId,
        #[arg(long)]
        object: ObjectType,
        /// Service parameters as JSON, e.g. '{"account_id": 3}'
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        automatic: bool,
    },
    /// Trigger a pipe run
    Run {
        #[arg(long)]
        workspace: i64,
        #[arg(long)]
        service: ServiceId,
        #[arg(long)]
        object: ObjectType,
        /// Foreign user IDs to invite, comma separated
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        /// Run in this process instead of queueing
        #[arg(long)]
        inline: bool,
    },
    /// Fetch the users of a service that can be selected for a users run
    Users {
        #[arg(long)]
        workspace: i64,
        #[arg(long)]
        service: ServiceId,
    },
    /// Print the log of the last run
    Status {
        #[arg(long)]
        workspace: i64,
        #[arg(long)]
        service: ServiceId,
        #[arg(long)]
        object: ObjectType,
    },
    /// List the accounts reachable with the stored token
    Accounts {
        #[arg(long)]
        workspace: i64,
        #[arg(long)]
        service: ServiceId,
    },
    /// List integrations and their pipes
    List {
        #[arg(long)]
        workspace: i64,
    },
    /// Remove all data of a service for a workspace
    Disconnect {
        #[arg(long)]
        workspace: i64,
        #[arg(long)]
        service: ServiceId,
    },
}

async fn open(cfg: &Config) -> Result<Pool> {
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    Ok(pool)
}

fn orchestrator(pool: &Pool, cfg: &Arc<Config>) -> Result<Arc<Orchestrator>> {
    Ok(Arc::new(Orchestrator::new(
        pool.clone(),
        cfg.clone(),
        Arc::new(Integrations::from_config(cfg)?),
        Arc::new(WorkspaceClient::from_config(cfg)?),
    )))
}

async fn load_pipe(
    pool: &Pool,
    workspace: i64,
    service: ServiceId,
    object: ObjectType,
) -> Result<pipe::Pipe> {
    pipe::load(pool, workspace, service, object)
        .await?
        .ok_or_else(|| anyhow!("pipe {}:{} is not set up", service, object))
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
    let pool = open(&cfg).await?;

    match args.command {
        Command::Authorize {
            workspace,
            service,
            token,
            expires_in,
        } => {
            let auth = Authorization {
                workspace_id: workspace,
                service_id: service,
                access_token: token,
                refresh_token: None,
                expires_at: expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
            };
            authorization::save(&pool, &auth).await?;
            println!("{} authorized for workspace {}", service, workspace);
        }
        Command::Setup {
            workspace,
            service,
            object,
            params,
            automatic,
        } => {
            let integration = cfg
                .integration(service)
                .ok_or_else(|| anyhow!("integration {} is not configured", service))?;
            let payload = match params {
                Some(raw) => serde_json::from_str(&raw).context("--params is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let pipe = pipe::setup(&pool, integration, workspace, object, payload, automatic).await?;
            println!("{}", serde_json::to_string_pretty(&pipe)?);
        }
        Command::Run {
            workspace,
            service,
            object,
            ids,
            inline,
        } => {
            let mut pipe = load_pipe(&pool, workspace, service, object).await?;
            let selection = Selection { ids };
            let orchestrator = orchestrator(&pool, &cfg)?;
            if inline {
                let status = orchestrator.run(&mut pipe, &selection).await?;
                println!("{}", status.generate_log());
                return Ok(());
            }
            let scheduler = Scheduler::new(
                orchestrator,
                Arc::new(SqliteQueue::new(pool.clone(), cfg.scheduler.dequeue_batch)),
                Arc::new(TenantLocks::default()),
                cfg.scheduler.clone(),
            );
            match scheduler.run_now(pipe, selection).await? {
                RunNow::Completed(status) => println!("{}", status.generate_log()),
                RunNow::Running => {
                    println!("run still in progress, waiting for it to finish");
                    scheduler.wait_background().await;
                    if let Some(status) = status::load(&pool, workspace, service, object).await? {
                        println!("{}", status.generate_log());
                    }
                }
                RunNow::Queued => println!("queued"),
            }
        }
        Command::Users { workspace, service } => {
            let pipe = load_pipe(&pool, workspace, service, ObjectType::Users).await?;
            let users = orchestrator(&pool, &cfg)?.fetch_users(&pipe).await?;
            println!("{}", serde_json::to_string_pretty(&users)?);
        }
        Command::Status {
            workspace,
            service,
            object,
        } => match status::load(&pool, workspace, service, object).await? {
            Some(status) => println!("{}", status.generate_log()),
            None => println!("{}:{} has not run yet", service, object),
        },
        Command::Accounts { workspace, service } => {
            let accounts = orchestrator(&pool, &cfg)?.accounts(workspace, service).await?;
            println!("{}", serde_json::to_string_pretty(&accounts)?);
        }
        Command::List { workspace } => {
            let views = pipe::integrations_for(&pool, &cfg.integrations, workspace).await?;
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        Command::Disconnect { workspace, service } => {
            pipe::disconnect(&pool, workspace, service).await?;
            println!("{} disconnected from workspace {}", service, workspace);
        }
    }
    Ok(())
}
