//! Run record of a pipe: state, message, object tallies and notifications.
use crate::db::{self, BlobTable, Pool};
use crate::error::PipeResult;
use crate::model::{pipe_key, ObjectType, ServiceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Success,
    Error,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipeStatus {
    pub workspace_id: i64,
    pub service_id: ServiceId,
    pub pipe_id: ObjectType,
    pub status: RunState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub object_counts: Vec<String>,
    #[serde(default)]
    pub notifications: Vec<String>,
    #[serde(default)]
    pub sync_log: String,
    pub sync_date: DateTime<Utc>,
}

impl PipeStatus {
    /// Fresh record for a run that is starting now.
    pub fn new(workspace_id: i64, service_id: ServiceId, pipe_id: ObjectType) -> Self {
        Self {
            workspace_id,
            service_id,
            pipe_id,
            status: RunState::Running,
            message: String::new(),
            object_counts: Vec::new(),
            notifications: Vec::new(),
            sync_log: String::new(),
            sync_date: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        pipe_key(self.service_id, self.pipe_id)
    }

    pub fn is_error(&self) -> bool {
        self.status == RunState::Error
    }

    /// Moves the run into the error state. The first error of a run stays.
    pub fn add_error(&mut self, message: impl Into<String>) {
        if self.is_error() {
            return;
        }
        self.status = RunState::Error;
        self.message = message.into();
    }

    /// Marks one object type as done. No-op once the run has failed.
    pub fn complete(&mut self, object_type: ObjectType, notifications: Vec<String>, count: usize) {
        if self.is_error() {
            return;
        }
        self.status = RunState::Success;
        if count > 0 {
            self.object_counts.push(format!("{} {}", count, object_type));
        }
        self.notifications.extend(notifications);
        self.message = if self.object_counts.is_empty() {
            "No new objects to sync".to_string()
        } else {
            format!("Successfully synced {}", self.object_counts.join(", "))
        };
        if !self.notifications.is_empty() {
            self.sync_log = format!(
                "/api/v1/integrations/{}/pipes/{}/log",
                self.service_id, self.pipe_id
            );
        }
    }

    /// Human-readable report: notifications first, then the final message.
    pub fn generate_log(&self) -> String {
        let mut lines = vec![format!(
            "{} sync of {} ({}) at {}",
            self.service_id,
            self.pipe_id,
            self.status.as_str(),
            self.sync_date.to_rfc3339()
        )];
        lines.extend(self.notifications.iter().cloned());
        lines.push(self.message.clone());
        lines.join("\r\n")
    }
}

/// Upserts the status row; each run replaces the previous one.
#[instrument(skip_all, fields(workspace_id = status.workspace_id, state = status.status.as_str()))]
pub async fn save(pool: &Pool, status: &PipeStatus) -> PipeResult<()> {
    let data = serde_json::to_string(status)?;
    db::upsert_blob(
        pool,
        BlobTable::PipeStatuses,
        status.workspace_id,
        &status.key(),
        &data,
    )
    .await?;
    Ok(())
}

pub async fn load(
    pool: &Pool,
    workspace_id: i64,
    service_id: ServiceId,
    pipe_id: ObjectType,
) -> PipeResult<Option<PipeStatus>> {
    let key = pipe_key(service_id, pipe_id);
    match db::select_blob(pool, BlobTable::PipeStatuses, workspace_id, &key).await? {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}
