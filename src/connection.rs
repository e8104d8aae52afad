//! Foreign-ID to local-ID maps per tenant and service key.
use crate::db::{self, BlobTable, Pool};
use crate::error::PipeResult;
use std::collections::HashMap;
use tracing::instrument;

/// Maps foreign object IDs to local IDs for one `(workspace, key)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub workspace_id: i64,
    pub key: String,
    pub data: HashMap<String, i64>,
}

/// Local-ID to foreign-ID view, only used when exporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReversedConnection {
    data: HashMap<i64, String>,
}

impl Connection {
    pub fn new(workspace_id: i64, key: impl Into<String>) -> Self {
        Self {
            workspace_id,
            key: key.into(),
            data: HashMap::new(),
        }
    }

    /// Local ID for a foreign ID, or 0 when never seen.
    pub fn local_id(&self, foreign_id: &str) -> i64 {
        self.data.get(foreign_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, foreign_id: impl Into<String>, local_id: i64) {
        self.data.insert(foreign_id.into(), local_id);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Inverts the map. When several foreign IDs share a local ID, the last
    /// one visited wins.
    pub fn reversed(&self) -> ReversedConnection {
        let mut data = HashMap::with_capacity(self.data.len());
        for (foreign_id, local_id) in &self.data {
            data.insert(*local_id, foreign_id.clone());
        }
        ReversedConnection { data }
    }
}

impl ReversedConnection {
    pub fn foreign_id(&self, local_id: i64) -> Option<&str> {
        self.data.get(&local_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Loads the connection, or an empty one when nothing was stored yet.
#[instrument(skip(pool))]
pub async fn load(pool: &Pool, workspace_id: i64, key: &str) -> PipeResult<Connection> {
    match db::select_blob(pool, BlobTable::Connections, workspace_id, key).await? {
        Some(data) => Ok(Connection {
            workspace_id,
            key: key.to_string(),
            data: serde_json::from_str(&data)?,
        }),
        None => Ok(Connection::new(workspace_id, key)),
    }
}

/// Replaces the whole stored map in a single-row upsert.
#[instrument(skip_all, fields(workspace_id = connection.workspace_id, key = %connection.key))]
pub async fn save(pool: &Pool, connection: &Connection) -> PipeResult<()> {
    let data = serde_json::to_string(&connection.data)?;
    db::upsert_blob(
        pool,
        BlobTable::Connections,
        connection.workspace_id,
        &connection.key,
        &data,
    )
    .await?;
    Ok(())
}

pub async fn load_reversed(
    pool: &Pool,
    workspace_id: i64,
    key: &str,
) -> PipeResult<ReversedConnection> {
    Ok(load(pool, workspace_id, key).await?.reversed())
}
