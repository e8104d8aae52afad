//! Client for the central time-tracking workspace: imports synced objects
//! and lists time entries for export.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, instrument};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::PipeResult;
use crate::http;
use crate::model::{ObjectType, TimeEntry};

/// Local ID the workspace assigned to a foreign object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportedId {
    pub foreign_id: String,
    pub id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResponse {
    #[serde(default)]
    pub imported: Vec<ImportedId>,
    #[serde(default)]
    pub notifications: Vec<String>,
}

impl ImportResponse {
    pub fn count(&self) -> usize {
        self.imported.len()
    }

    pub fn merge_into(&self, connection: &mut Connection) {
        for item in &self.imported {
            connection.set(item.foreign_id.clone(), item.id);
        }
    }
}

#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// Posts a serialized JSON array of objects.
    async fn import(
        &self,
        workspace_id: i64,
        object_type: ObjectType,
        body: Vec<u8>,
    ) -> PipeResult<ImportResponse>;

    async fn time_entries(
        &self,
        workspace_id: i64,
        since: DateTime<Utc>,
    ) -> PipeResult<Vec<TimeEntry>>;
}

#[derive(Clone)]
pub struct WorkspaceClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for WorkspaceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WorkspaceClient {
    pub fn new(api_url: &str, token: String) -> PipeResult<Self> {
        Ok(Self {
            http: http::client()?,
            base_url: http::base_url(api_url)?,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> PipeResult<Self> {
        Self::new(&cfg.workspace.api_url, cfg.workspace.api_token.clone())
    }
}

#[async_trait]
impl WorkspaceApi for WorkspaceClient {
    #[instrument(skip(self, body), fields(bytes = body.len()))]
    async fn import(
        &self,
        workspace_id: i64,
        object_type: ObjectType,
        body: Vec<u8>,
    ) -> PipeResult<ImportResponse> {
        let url = http::join(
            &self.base_url,
            &format!("workspaces/{}/{}/import", workspace_id, object_type),
        )?;
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        let body = http::read_body(res).await?;
        let parsed: ImportResponse = serde_json::from_str(&body)?;
        info!(imported = parsed.count(), "workspace import done");
        Ok(parsed)
    }

    #[instrument(skip(self))]
    async fn time_entries(
        &self,
        workspace_id: i64,
        since: DateTime<Utc>,
    ) -> PipeResult<Vec<TimeEntry>> {
        let mut url = http::join(
            &self.base_url,
            &format!("workspaces/{}/time_entries", workspace_id),
        )?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_rfc3339());
        let res = self.http.get(url).bearer_auth(&self.token).send().await?;
        let body = http::read_body(res).await?;
        Ok(serde_json::from_str(&body)?)
    }
}
