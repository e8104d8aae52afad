//! Pipe entity and registry: one configured sync job per
//! `(tenant, service, object type)`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, instrument};

use crate::authorization;
use crate::config;
use crate::db::{self, BlobTable, Pool};
use crate::error::PipeResult;
use crate::integrations::{self, ServiceParams};
use crate::model::{pipe_key, ObjectType, ServiceId};
use crate::status::{self, PipeStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipe {
    pub workspace_id: i64,
    pub service_id: ServiceId,
    pub id: ObjectType,
    pub name: String,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub configured: bool,
    #[serde(default)]
    pub premium: bool,
    #[serde(default)]
    pub service_params: Value,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub status: Option<PipeStatus>,
}

impl Pipe {
    pub fn new(workspace_id: i64, service_id: ServiceId, id: ObjectType) -> Self {
        Self {
            workspace_id,
            service_id,
            id,
            name: id.title().to_string(),
            automatic: false,
            configured: false,
            premium: false,
            service_params: Value::Null,
            last_sync: None,
            status: None,
        }
    }

    /// `service:objectType`, the storage key and public job identifier.
    pub fn key(&self) -> String {
        pipe_key(self.service_id, self.id)
    }

    /// Parsed service parameters.
    pub fn params(&self) -> PipeResult<ServiceParams> {
        integrations::validate_service_config(self.service_id, self.id, &self.service_params)
    }

    /// Upserts the pipe and marks it configured.
    #[instrument(skip_all, fields(workspace_id = self.workspace_id, pipe = %self.key()))]
    pub async fn save(&mut self, pool: &Pool) -> PipeResult<()> {
        self.configured = true;
        let data = serde_json::to_string(self)?;
        db::upsert_blob(pool, BlobTable::Pipes, self.workspace_id, &self.key(), &data).await?;
        Ok(())
    }

    /// Deletes the pipe together with its status, or neither.
    #[instrument(skip_all, fields(workspace_id = self.workspace_id, pipe = %self.key()))]
    pub async fn destroy(&self, pool: &Pool) -> PipeResult<()> {
        let key = self.key();
        let mut tx = pool.begin().await?;
        db::delete_blob_tx(&mut tx, BlobTable::Pipes, self.workspace_id, &key).await?;
        db::delete_blob_tx(&mut tx, BlobTable::PipeStatuses, self.workspace_id, &key).await?;
        tx.commit().await?;
        Ok(())
    }
}

fn decode(data: &str) -> PipeResult<Pipe> {
    Ok(serde_json::from_str(data)?)
}

/// Loads a stored pipe with its last status.
pub async fn load(
    pool: &Pool,
    workspace_id: i64,
    service_id: ServiceId,
    object_type: ObjectType,
) -> PipeResult<Option<Pipe>> {
    let key = pipe_key(service_id, object_type);
    let Some(data) = db::select_blob(pool, BlobTable::Pipes, workspace_id, &key).await? else {
        return Ok(None);
    };
    let mut pipe = decode(&data)?;
    pipe.status = status::load(pool, workspace_id, service_id, object_type).await?;
    Ok(Some(pipe))
}

/// Every stored pipe of a tenant with its status.
pub async fn load_all_for_tenant(pool: &Pool, workspace_id: i64) -> PipeResult<Vec<Pipe>> {
    let rows = db::select_blobs(pool, BlobTable::Pipes, workspace_id).await?;
    let statuses: HashMap<String, String> = db::select_blobs(pool, BlobTable::PipeStatuses, workspace_id)
        .await?
        .into_iter()
        .map(|row| (row.key, row.data))
        .collect();

    let mut pipes = Vec::with_capacity(rows.len());
    for row in rows {
        let mut pipe = decode(&row.data)?;
        if let Some(data) = statuses.get(&row.key) {
            pipe.status = Some(serde_json::from_str(data)?);
        }
        pipes.push(pipe);
    }
    Ok(pipes)
}

/// Every stored pipe across tenants, without statuses.
pub async fn load_all(pool: &Pool) -> PipeResult<Vec<Pipe>> {
    db::select_all_blobs(pool, BlobTable::Pipes)
        .await?
        .iter()
        .map(|row| decode(&row.data))
        .collect()
}

/// Validates the service parameters, then creates or updates the pipe.
/// Configuration errors surface to the caller and nothing is stored.
#[instrument(skip(pool, integration, payload), fields(service = %integration.id))]
pub async fn setup(
    pool: &Pool,
    integration: &config::Integration,
    workspace_id: i64,
    object_type: ObjectType,
    payload: Value,
    automatic: bool,
) -> PipeResult<Pipe> {
    integrations::validate_service_config(integration.id, object_type, &payload)?;

    let mut pipe = load(pool, workspace_id, integration.id, object_type)
        .await?
        .unwrap_or_else(|| Pipe::new(workspace_id, integration.id, object_type));
    pipe.service_params = payload;
    pipe.automatic = automatic;
    pipe.premium = integration.premium;
    pipe.save(pool).await?;
    info!(pipe = %pipe.key(), "pipe configured");
    Ok(pipe)
}

/// Removes everything a tenant holds for a service in one transaction:
/// pipes, statuses, connections, snapshots, queued jobs and the
/// authorization.
#[instrument(skip(pool))]
pub async fn disconnect(pool: &Pool, workspace_id: i64, service_id: ServiceId) -> PipeResult<()> {
    let prefix = format!("{}:", service_id);
    let mut tx = pool.begin().await?;
    for table in [BlobTable::Pipes, BlobTable::PipeStatuses, BlobTable::Connections] {
        db::delete_blobs_with_prefix_tx(&mut tx, table, workspace_id, &prefix).await?;
    }
    db::delete_imports_with_prefix_tx(&mut tx, workspace_id, &prefix).await?;
    db::delete_queued_with_prefix_tx(&mut tx, workspace_id, &prefix).await?;
    db::delete_blob_tx(
        &mut tx,
        BlobTable::Authorizations,
        workspace_id,
        service_id.as_str(),
    )
    .await?;
    tx.commit().await?;
    info!("service disconnected");
    Ok(())
}

/// A configured integration as seen by one tenant.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IntegrationView {
    pub id: ServiceId,
    pub name: String,
    pub premium: bool,
    pub auth_type: config::AuthType,
    pub authorized: bool,
    pub pipes: Vec<Pipe>,
}

/// Lists integrations with one pipe per supported object type; pipes that
/// were never set up are returned unconfigured.
pub async fn integrations_for(
    pool: &Pool,
    integrations: &[config::Integration],
    workspace_id: i64,
) -> PipeResult<Vec<IntegrationView>> {
    let mut stored: HashMap<String, Pipe> = load_all_for_tenant(pool, workspace_id)
        .await?
        .into_iter()
        .map(|p| (p.key(), p))
        .collect();

    let mut views = Vec::with_capacity(integrations.len());
    for integration in integrations {
        let authorized = authorization::load(pool, workspace_id, integration.id)
            .await?
            .is_some();
        let pipes = integration
            .id
            .supported()
            .iter()
            .map(|&object_type| {
                stored
                    .remove(&pipe_key(integration.id, object_type))
                    .unwrap_or_else(|| {
                        let mut pipe = Pipe::new(workspace_id, integration.id, object_type);
                        pipe.premium = integration.premium;
                        pipe
                    })
            })
            .collect();
        views.push(IntegrationView {
            id: integration.id,
            name: integration.name.clone(),
            premium: integration.premium,
            auth_type: integration.auth_type,
            authorized,
            pipes,
        });
    }
    Ok(views)
}
