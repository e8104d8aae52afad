//! Per-service adapters behind one capability trait, resolved through an
//! explicit factory keyed by [`ServiceId`].
use async_trait::async_trait;
use serde_json::Value;

use crate::authorization::Authorization;
use crate::config::{self, Config};
use crate::error::{PipeError, PipeResult};
use crate::model::{Account, Client, ObjectType, Project, ServiceId, Task, TimeEntry, User};

pub mod model;
pub mod rest;

pub use model::ServiceParams;
pub use rest::RestAdapter;

/// What the orchestrator needs from a third-party service.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn service(&self) -> ServiceId;

    /// Storage key of connections and snapshots for `object_type`.
    fn key_for(&self, object_type: ObjectType) -> String;

    async fn authenticate(&mut self, authorization: &Authorization) -> PipeResult<()>;

    async fn users(&self) -> PipeResult<Vec<User>>;
    async fn clients(&self) -> PipeResult<Vec<Client>>;
    async fn projects(&self) -> PipeResult<Vec<Project>>;
    async fn tasks(&self) -> PipeResult<Vec<Task>>;
    async fn todo_lists(&self) -> PipeResult<Vec<Task>>;
    async fn accounts(&self) -> PipeResult<Vec<Account>>;

    /// Creates or updates the entry remotely and returns its foreign ID.
    async fn export_time_entry(&self, entry: &TimeEntry) -> PipeResult<i64>;
}

/// Builds an adapter for a service.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, service: ServiceId, params: &ServiceParams) -> PipeResult<Box<dyn Adapter>>;
}

/// Keys are namespaced by account for services that have several.
pub fn key_for(service: ServiceId, params: &ServiceParams, object_type: ObjectType) -> String {
    match (service.has_accounts(), params.account_id) {
        (true, Some(account_id)) => format!("{}:account:{}:{}", service, account_id, object_type),
        _ => format!("{}:{}", service, object_type),
    }
}

/// Checks that the service offers `object_type` and parses its parameters.
pub fn validate_service_config(
    service: ServiceId,
    object_type: ObjectType,
    payload: &Value,
) -> PipeResult<ServiceParams> {
    if !service.supports(object_type) {
        return Err(PipeError::UnsupportedObjectType {
            service,
            object_type,
        });
    }
    let params: ServiceParams = match payload {
        Value::Null => ServiceParams::default(),
        other => serde_json::from_value(other.clone()).map_err(|e| {
            PipeError::Config(format!("invalid {} parameters: {}", service, e))
        })?,
    };
    if service.has_accounts() {
        match params.account_id {
            Some(id) if id > 0 => {}
            _ => {
                return Err(PipeError::Config(format!(
                    "{} requires an account_id",
                    service
                )))
            }
        }
    }
    Ok(params)
}

/// Configured integrations; builds [`RestAdapter`]s.
#[derive(Debug, Clone)]
pub struct Integrations {
    http: reqwest::Client,
    entries: Vec<config::Integration>,
}

impl Integrations {
    pub fn new(entries: Vec<config::Integration>) -> PipeResult<Self> {
        Ok(Self {
            http: crate::http::client()?,
            entries,
        })
    }

    pub fn from_config(cfg: &Config) -> PipeResult<Self> {
        Self::new(cfg.integrations.clone())
    }

    pub fn get(&self, service: ServiceId) -> Option<&config::Integration> {
        self.entries.iter().find(|i| i.id == service)
    }
}

impl AdapterFactory for Integrations {
    fn build(&self, service: ServiceId, params: &ServiceParams) -> PipeResult<Box<dyn Adapter>> {
        let integration = self
            .get(service)
            .ok_or_else(|| PipeError::Config(format!("integration {} is not configured", service)))?;
        let adapter = RestAdapter::new(
            self.http.clone(),
            service,
            &integration.api_url,
            params.clone(),
        )?;
        Ok(Box::new(adapter))
    }
}
