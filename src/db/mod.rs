//! Database module: row models and SQL repositories.
//!
//! - `model`: row shapes returned by repositories.
//! - `repo`: SQL-only functions; callers decode the JSON payloads.
//!
//! External modules import from `pipesync::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{BlobRow, BlobTable, QueuedPipeRow};
