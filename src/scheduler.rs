//! Worker pool draining the queue, plus the periodic automatic enqueue.
use anyhow::{anyhow, Result};
use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config;
use crate::locks::TenantLocks;
use crate::model::ObjectType;
use crate::orchestrator::{Orchestrator, Selection};
use crate::pipe::{self, Pipe};
use crate::queue::{JobRef, Queue, QueueError, PRIORITY_MANUAL};
use crate::status::PipeStatus;

/// Pause between attempts to claim a busy workspace for a users run.
const CLAIM_RETRY: Duration = Duration::from_secs(1);

/// Outcome of a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunNow {
    /// The run finished within the wait window.
    Completed(PipeStatus),
    /// Still running in the background.
    Running,
    /// Handed to the queue at manual priority.
    Queued,
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn Queue>,
    locks: Arc<TenantLocks>,
    settings: config::Scheduler,
    background: Mutex<Vec<JoinHandle<Result<PipeStatus>>>>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Uniformly random duration in `[min, max]`.
fn jitter((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::thread_rng().gen_range(millis(min)..=millis(max));
    Duration::from_millis(ms)
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn Queue>,
        locks: Arc<TenantLocks>,
        settings: config::Scheduler,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            locks,
            settings,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Runs the workers and the autosync ticker until the process stops.
    pub async fn run(self: Arc<Self>) {
        info!(workers = self.settings.workers, "scheduler started");
        let mut tasks = Vec::with_capacity(self.settings.workers + 1);
        for worker in 0..self.settings.workers {
            tasks.push(tokio::spawn(self.clone().worker(worker)));
        }
        tasks.push(tokio::spawn(self.clone().autosync()));

        for res in join_all(tasks).await {
            if let Err(err) = res {
                error!(?err, "scheduler task stopped");
            }
        }
    }

    #[instrument(skip(self))]
    async fn worker(self: Arc<Self>, worker: usize) {
        loop {
            match self.drain_once().await {
                Ok(0) => {
                    let pause = jitter(self.settings.idle_sleep_range());
                    debug!(?pause, "queue empty");
                    tokio::time::sleep(pause).await;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "dequeue failed");
                    tokio::time::sleep(jitter(self.settings.idle_sleep_range())).await;
                }
            }
        }
    }

    async fn autosync(self: Arc<Self>) {
        loop {
            tokio::time::sleep(jitter(self.settings.autosync_range())).await;
            if let Err(err) = self.enqueue_automatic_once().await {
                error!(error = %err, "automatic enqueue failed");
            }
        }
    }

    /// Dequeues one batch and runs every job in it. Returns how many jobs
    /// were handled.
    pub async fn drain_once(&self) -> Result<usize, QueueError> {
        let jobs = self.queue.dequeue().await?;
        for job in &jobs {
            self.process(job).await;
            if let Err(err) = self.queue.mark_done(job).await {
                error!(
                    job = job.id,
                    workspace_id = job.workspace_id,
                    error = %err,
                    "could not mark job done"
                );
            }
        }
        Ok(jobs.len())
    }

    #[instrument(skip_all, fields(job = job.id, workspace_id = job.workspace_id, pipe = %job.key()))]
    async fn process(&self, job: &JobRef) {
        let _guard = self.locks.lock(job.workspace_id).await;
        let pool = self.orchestrator.pool();
        let mut pipe = match pipe::load(pool, job.workspace_id, job.service, job.object_type).await {
            Ok(Some(pipe)) => pipe,
            Ok(None) => {
                warn!("pipe no longer exists, dropping job");
                return;
            }
            Err(err) => {
                error!(error = %err, "could not load pipe");
                return;
            }
        };

        if let Err(err) = self.orchestrator.run(&mut pipe, &Selection::default()).await {
            error!(error = %err, "could not record pipe status");
        }
    }

    /// Enqueues automatic pipes. Duplicates are a harmless race.
    pub async fn enqueue_automatic_once(&self) -> Result<(), QueueError> {
        match self.queue.enqueue_automatic().await {
            Err(QueueError::AlreadyQueued(n)) => {
                debug!(duplicates = n, "pipes already queued");
                Ok(())
            }
            other => other,
        }
    }

    /// Manual trigger. Users run in the background and the caller waits
    /// briefly for the assigned IDs; everything else goes to the queue at
    /// manual priority.
    ///
    /// A users run holds an in-flight row in the queue for its workspace, so
    /// workers of any process leave that workspace alone until it finishes.
    #[instrument(skip_all, fields(workspace_id = pipe.workspace_id, pipe = %pipe.key()))]
    pub async fn run_now(&self, pipe: Pipe, selection: Selection) -> Result<RunNow> {
        let job = JobRef::for_pipe(&pipe, PRIORITY_MANUAL);
        if pipe.id != ObjectType::Users {
            self.queue.enqueue_high_priority(&job).await?;
            return Ok(RunNow::Queued);
        }

        let orchestrator = self.orchestrator.clone();
        let queue = self.queue.clone();
        let locks = self.locks.clone();
        let mut handle = tokio::spawn(async move {
            let claimed = loop {
                if let Some(claimed) = queue.claim(&job).await? {
                    break claimed;
                }
                debug!("workspace busy, waiting to claim");
                tokio::time::sleep(CLAIM_RETRY).await;
            };
            let outcome = run_claimed(&orchestrator, &locks, &claimed, &selection).await;
            if let Err(err) = queue.mark_done(&claimed).await {
                error!(job = claimed.id, error = %err, "could not mark job done");
            }
            outcome
        });

        match tokio::time::timeout(self.settings.users_run_wait(), &mut handle).await {
            Ok(joined) => Ok(RunNow::Completed(joined??)),
            Err(_) => {
                info!("users run still in progress");
                self.background.lock().await.push(handle);
                Ok(RunNow::Running)
            }
        }
    }

    /// Waits for users runs that outlived their `run_now` call.
    pub async fn wait_background(&self) {
        let handles = std::mem::take(&mut *self.background.lock().await);
        for res in join_all(handles).await {
            match res {
                Ok(Ok(status)) => info!(message = %status.message, "background users run finished"),
                Ok(Err(err)) => error!(error = %err, "background users run failed"),
                Err(err) => error!(?err, "background users run stopped"),
            }
        }
    }
}

/// Runs a claimed job on the freshly stored pipe under the workspace lock.
async fn run_claimed(
    orchestrator: &Orchestrator,
    locks: &TenantLocks,
    job: &JobRef,
    selection: &Selection,
) -> Result<PipeStatus> {
    let _guard = locks.lock(job.workspace_id).await;
    let mut pipe = pipe::load(orchestrator.pool(), job.workspace_id, job.service, job.object_type)
        .await?
        .ok_or_else(|| anyhow!("pipe {} no longer exists", job.key()))?;
    Ok(orchestrator.run(&mut pipe, selection).await?)
}
