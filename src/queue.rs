//! Pending sync jobs. Workers dequeue through [`Queue`]; [`SqliteQueue`]
//! keeps jobs in the `queued_pipes` table.
use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::PipeError;
use crate::model::{parse_pipe_key, pipe_key, ObjectType, ServiceId};
use crate::pipe::{self, Pipe};

/// Priority of jobs triggered by a user.
pub const PRIORITY_MANUAL: i64 = 100;
/// Priority of jobs enqueued by the periodic autosync.
pub const PRIORITY_AUTOMATIC: i64 = 0;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Some pipes already had a pending job. Harmless.
    #[error("{0} pipes were already queued")]
    AlreadyQueued(usize),
    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Pipe(#[from] PipeError),
}

/// A sync job. `id` is 0 until the queue stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub id: i64,
    pub workspace_id: i64,
    pub service: ServiceId,
    pub object_type: ObjectType,
    pub priority: i64,
}

impl JobRef {
    pub fn for_pipe(pipe: &Pipe, priority: i64) -> Self {
        Self {
            id: 0,
            workspace_id: pipe.workspace_id,
            service: pipe.service_id,
            object_type: pipe.id,
            priority,
        }
    }

    pub fn key(&self) -> String {
        pipe_key(self.service, self.object_type)
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Next ready jobs, at most one per workspace.
    async fn dequeue(&self) -> Result<Vec<JobRef>, QueueError>;
    async fn mark_done(&self, job: &JobRef) -> Result<(), QueueError>;
    /// Queues every automatic, configured pipe of every workspace.
    async fn enqueue_automatic(&self) -> Result<(), QueueError>;
    async fn enqueue_high_priority(&self, job: &JobRef) -> Result<(), QueueError>;
    /// Takes `job` straight into the in-flight state. `None` while the
    /// workspace already has a job in flight.
    async fn claim(&self, job: &JobRef) -> Result<Option<JobRef>, QueueError>;
}

#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: Pool,
    batch: u32,
}

impl SqliteQueue {
    pub fn new(pool: Pool, batch: u32) -> Self {
        Self { pool, batch }
    }

    /// Unlocks jobs a previous process dequeued but never finished.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<u64, QueueError> {
        let released = db::release_locked_pipes(&self.pool).await?;
        if released > 0 {
            info!(released, "released jobs left locked by a previous run");
        }
        Ok(released)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Queue for SqliteQueue {
    #[instrument(skip(self))]
    async fn dequeue(&self) -> Result<Vec<JobRef>, QueueError> {
        let rows = db::dequeue_pipes(&self.pool, self.batch).await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_pipe_key(&row.key) {
                Ok((service, object_type)) => jobs.push(JobRef {
                    id: row.id,
                    workspace_id: row.workspace_id,
                    service,
                    object_type,
                    priority: row.priority,
                }),
                Err(err) => {
                    warn!(id = row.id, key = %row.key, error = %err, "dropping malformed job");
                    db::delete_queued_pipe(&self.pool, row.id).await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn mark_done(&self, job: &JobRef) -> Result<(), QueueError> {
        db::delete_queued_pipe(&self.pool, job.id).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn enqueue_automatic(&self) -> Result<(), QueueError> {
        let mut queued = 0;
        let mut duplicates = 0;
        for pipe in pipe::load_all(&self.pool).await? {
            if !(pipe.automatic && pipe.configured) {
                continue;
            }
            match db::enqueue_pipe(&self.pool, pipe.workspace_id, &pipe.key(), PRIORITY_AUTOMATIC)
                .await
            {
                Ok(_) => queued += 1,
                Err(err) if is_unique_violation(&err) => duplicates += 1,
                Err(err) => return Err(err.into()),
            }
        }
        info!(queued, duplicates, "automatic pipes queued");
        if duplicates > 0 {
            return Err(QueueError::AlreadyQueued(duplicates));
        }
        Ok(())
    }

    async fn enqueue_high_priority(&self, job: &JobRef) -> Result<(), QueueError> {
        let priority = job.priority.max(PRIORITY_MANUAL);
        db::enqueue_pipe_at_least(&self.pool, job.workspace_id, &job.key(), priority).await?;
        Ok(())
    }

    async fn claim(&self, job: &JobRef) -> Result<Option<JobRef>, QueueError> {
        let id = db::claim_pipe(&self.pool, job.workspace_id, &job.key(), job.priority).await?;
        Ok(id.map(|id| JobRef { id, ..job.clone() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn queue() -> SqliteQueue {
        SqliteQueue::new(db::memory_pool().await.unwrap(), 10)
    }

    async fn store_pipe(pool: &Pool, workspace_id: i64, object_type: ObjectType, automatic: bool) {
        let mut pipe = Pipe::new(workspace_id, ServiceId::Freshbooks, object_type);
        pipe.automatic = automatic;
        pipe.service_params = Value::Null;
        pipe.save(pool).await.unwrap();
    }

    #[tokio::test]
    async fn dequeue_prefers_highest_priority_one_per_workspace() {
        let q = queue().await;
        db::enqueue_pipe(&q.pool, 1, "freshbooks:projects", 0).await.unwrap();
        db::enqueue_pipe(&q.pool, 2, "freshbooks:projects", 10).await.unwrap();
        db::enqueue_pipe(&q.pool, 3, "freshbooks:users", 100).await.unwrap();
        db::enqueue_pipe(&q.pool, 3, "freshbooks:tasks", 5).await.unwrap();

        let jobs = q.dequeue().await.unwrap();
        let order: Vec<(i64, i64)> = jobs.iter().map(|j| (j.workspace_id, j.priority)).collect();
        assert_eq!(order, vec![(3, 100), (2, 10), (1, 0)]);
        assert_eq!(jobs[0].object_type, ObjectType::Users);

        // Workspace 3 has a job in flight, so its tasks job waits.
        assert!(q.dequeue().await.unwrap().is_empty());
        q.mark_done(&jobs[0]).await.unwrap();
        let next = q.dequeue().await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].object_type, ObjectType::Tasks);
    }

    #[tokio::test]
    async fn automatic_enqueue_reports_duplicates() {
        let q = queue().await;
        store_pipe(&q.pool, 1, ObjectType::Projects, true).await;
        store_pipe(&q.pool, 1, ObjectType::Users, false).await;
        store_pipe(&q.pool, 2, ObjectType::Tasks, true).await;

        q.enqueue_automatic().await.unwrap();
        assert_eq!(db::count_queued_pipes(&q.pool).await.unwrap(), 2);

        match q.enqueue_automatic().await {
            Err(QueueError::AlreadyQueued(2)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(db::count_queued_pipes(&q.pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn high_priority_raises_pending_job() {
        let q = queue().await;
        db::enqueue_pipe(&q.pool, 1, "freshbooks:projects", 0).await.unwrap();
        db::enqueue_pipe(&q.pool, 2, "freshbooks:projects", 10).await.unwrap();

        let job = JobRef {
            id: 0,
            workspace_id: 1,
            service: ServiceId::Freshbooks,
            object_type: ObjectType::Projects,
            priority: PRIORITY_MANUAL,
        };
        q.enqueue_high_priority(&job).await.unwrap();
        assert_eq!(db::count_queued_pipes(&q.pool).await.unwrap(), 2);

        let jobs = q.dequeue().await.unwrap();
        assert_eq!(jobs[0].workspace_id, 1);
        assert_eq!(jobs[0].priority, PRIORITY_MANUAL);
    }

    #[tokio::test]
    async fn malformed_jobs_are_dropped() {
        let q = queue().await;
        db::enqueue_pipe(&q.pool, 1, "nope", 0).await.unwrap();
        assert!(q.dequeue().await.unwrap().is_empty());
        assert_eq!(db::count_queued_pipes(&q.pool).await.unwrap(), 0);
    }
}
