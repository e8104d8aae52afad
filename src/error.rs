//! Error taxonomy surfaced by pipe runs.
use crate::model::{ObjectType, ServiceId};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::error;

/// Shown instead of serialization internals.
pub const GENERIC_ERROR_MESSAGE: &str =
    "We encountered an unexpected error while syncing. Our team has been notified.";

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{service} does not support {object_type}")]
    UnsupportedObjectType {
        service: ServiceId,
        object_type: ObjectType,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{key} have not been fetched yet")]
    NotFetched { key: String },
    #[error("remote error {status}: {body}")]
    Remote { status: StatusCode, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("a single {object_type} payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        object_type: &'static str,
        size: usize,
        limit: usize,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

pub type PipeResult<T> = Result<T, PipeError>;

impl PipeError {
    /// Message written to the pipe status for the user to read.
    pub fn user_message(&self) -> String {
        match self {
            PipeError::Serialization(_) => GENERIC_ERROR_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }

    /// Errors whose cause must reach operators even though users never see it.
    pub fn should_report(&self) -> bool {
        matches!(
            self,
            PipeError::Serialization(_) | PipeError::Storage(_) | PipeError::Transport(_)
        )
    }

    /// Sends the underlying cause to the out-of-band error channel.
    pub fn report(&self, workspace_id: i64, pipe_key: &str) {
        error!(
            target: "pipesync::report",
            workspace_id,
            pipe = pipe_key,
            error = ?self,
            "pipe run error"
        );
    }
}
