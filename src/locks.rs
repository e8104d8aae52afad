//! Per-workspace mutual exclusion over a fixed set of mutex shards.
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const DEFAULT_SHARDS: usize = 64;

/// Workspaces hashing to the same shard serialize with each other.
#[derive(Debug)]
pub struct TenantLocks {
    shards: Vec<Arc<Mutex<()>>>,
}

impl TenantLocks {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Arc::new(Mutex::new(()))).collect();
        Self { shards }
    }

    fn shard(&self, workspace_id: i64) -> usize {
        workspace_id.rem_euclid(self.shards.len() as i64) as usize
    }

    /// Waits for the workspace's shard. The guard may move into a spawned task.
    pub async fn lock(&self, workspace_id: i64) -> OwnedMutexGuard<()> {
        self.shards[self.shard(workspace_id)].clone().lock_owned().await
    }
}

impl Default for TenantLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}
