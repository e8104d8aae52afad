//! Row shapes returned by repositories.
//!
//! Entities are persisted as opaque JSON in a `data` column keyed by
//! `(workspace_id, key)`; decoding them is left to the owning module.

/// Tables sharing the `(workspace_id, key, data)` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobTable {
    Pipes,
    PipeStatuses,
    Connections,
    Authorizations,
}

impl BlobTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobTable::Pipes => "pipes",
            BlobTable::PipeStatuses => "pipes_status",
            BlobTable::Connections => "connections",
            BlobTable::Authorizations => "authorizations",
        }
    }
}

/// A stored blob with its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRow {
    pub workspace_id: i64,
    pub key: String,
    pub data: String,
}

/// A queued pipe handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPipeRow {
    pub id: i64,
    pub workspace_id: i64,
    pub key: String,
    pub priority: i64,
}
