//! Timestamped fetch results. Posting reads the latest snapshot instead of
//! fetching again.
use crate::db::{self, Pool};
use crate::error::{PipeError, PipeResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

/// Appends a snapshot; older ones are kept as history.
#[instrument(skip(pool, objects))]
pub async fn save<T: Serialize>(
    pool: &Pool,
    workspace_id: i64,
    key: &str,
    objects: &[T],
) -> PipeResult<()> {
    let data = serde_json::to_string(objects)?;
    db::insert_import(pool, workspace_id, key, &data, Utc::now()).await?;
    Ok(())
}

/// Latest snapshot with its timestamp, if any.
pub async fn latest<T: DeserializeOwned>(
    pool: &Pool,
    workspace_id: i64,
    key: &str,
) -> PipeResult<Option<(Vec<T>, DateTime<Utc>)>> {
    match db::latest_import(pool, workspace_id, key).await? {
        Some((data, created_at)) => Ok(Some((serde_json::from_str(&data)?, created_at))),
        None => Ok(None),
    }
}

/// Latest snapshot, failing with `NotFetched` when there is none.
pub async fn require<T: DeserializeOwned>(
    pool: &Pool,
    workspace_id: i64,
    key: &str,
) -> PipeResult<Vec<T>> {
    latest(pool, workspace_id, key)
        .await?
        .map(|(objects, _)| objects)
        .ok_or_else(|| PipeError::NotFetched {
            key: key.to_string(),
        })
}
