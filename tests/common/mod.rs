#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use pipesync::authorization::{self, Authorization};
use pipesync::config::{self, Config};
use pipesync::db::{self, Pool};
use pipesync::error::{PipeError, PipeResult};
use pipesync::integrations::{self, Adapter, AdapterFactory, ServiceParams};
use pipesync::model::{Account, Client, ObjectType, Project, ServiceId, Task, TimeEntry, User};
use pipesync::orchestrator::Orchestrator;
use pipesync::pipe::{self, Pipe};
use pipesync::workspace::{ImportResponse, ImportedId, WorkspaceApi};

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Auth,
    Remote,
    Serialization,
}

impl Failure {
    fn error(self) -> PipeError {
        match self {
            Failure::Auth => PipeError::Auth("token revoked".into()),
            Failure::Remote => PipeError::Remote {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: "upstream down".into(),
            },
            Failure::Serialization => {
                PipeError::from(serde_json::from_str::<Vec<i64>>("{broken").unwrap_err())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct AdapterState {
    pub users: Vec<User>,
    pub clients: Vec<Client>,
    pub projects: Vec<Project>,
    pub tasks: Vec<Task>,
    pub todo_lists: Vec<Task>,
    pub accounts: Vec<Account>,
    pub failures: HashMap<ObjectType, Failure>,
    pub failing_entries: HashSet<i64>,
    pub calls: Vec<String>,
    pub exported: Vec<TimeEntry>,
    next_export_id: i64,
}

/// Adapter fake sharing its state with every instance the factory builds.
#[derive(Clone, Default)]
pub struct RecordingAdapter {
    pub state: Arc<Mutex<AdapterState>>,
}

impl RecordingAdapter {
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn exported(&self) -> Vec<TimeEntry> {
        self.state.lock().await.exported.clone()
    }

    async fn fetch<T: Clone>(
        &self,
        object_type: ObjectType,
        pick: impl FnOnce(&AdapterState) -> Vec<T>,
    ) -> PipeResult<Vec<T>> {
        let mut state = self.state.lock().await;
        state.calls.push(object_type.to_string());
        if let Some(failure) = state.failures.get(&object_type) {
            return Err(failure.error());
        }
        Ok(pick(&state))
    }
}

struct BuiltAdapter {
    service: ServiceId,
    params: ServiceParams,
    inner: RecordingAdapter,
}

#[async_trait]
impl Adapter for BuiltAdapter {
    fn service(&self) -> ServiceId {
        self.service
    }

    fn key_for(&self, object_type: ObjectType) -> String {
        integrations::key_for(self.service, &self.params, object_type)
    }

    async fn authenticate(&mut self, authorization: &Authorization) -> PipeResult<()> {
        if authorization.access_token.is_empty() {
            return Err(PipeError::Auth("missing access token".into()));
        }
        Ok(())
    }

    async fn users(&self) -> PipeResult<Vec<User>> {
        self.inner.fetch(ObjectType::Users, |s| s.users.clone()).await
    }

    async fn clients(&self) -> PipeResult<Vec<Client>> {
        self.inner.fetch(ObjectType::Clients, |s| s.clients.clone()).await
    }

    async fn projects(&self) -> PipeResult<Vec<Project>> {
        self.inner.fetch(ObjectType::Projects, |s| s.projects.clone()).await
    }

    async fn tasks(&self) -> PipeResult<Vec<Task>> {
        self.inner.fetch(ObjectType::Tasks, |s| s.tasks.clone()).await
    }

    async fn todo_lists(&self) -> PipeResult<Vec<Task>> {
        self.inner
            .fetch(ObjectType::TodoLists, |s| s.todo_lists.clone())
            .await
    }

    async fn accounts(&self) -> PipeResult<Vec<Account>> {
        let state = self.inner.state.lock().await;
        Ok(state.accounts.clone())
    }

    async fn export_time_entry(&self, entry: &TimeEntry) -> PipeResult<i64> {
        let mut state = self.inner.state.lock().await;
        state.calls.push(format!("export:{}", entry.id));
        if state.failing_entries.contains(&entry.id) {
            return Err(Failure::Remote.error());
        }
        state.exported.push(entry.clone());
        if let Some(id) = entry.foreign_id.as_deref().and_then(|id| id.parse().ok()) {
            return Ok(id);
        }
        state.next_export_id += 1;
        Ok(9000 + state.next_export_id)
    }
}

impl AdapterFactory for RecordingAdapter {
    fn build(&self, service: ServiceId, params: &ServiceParams) -> PipeResult<Box<dyn Adapter>> {
        Ok(Box::new(BuiltAdapter {
            service,
            params: params.clone(),
            inner: self.clone(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct ImportCall {
    pub object_type: ObjectType,
    pub body: Value,
}

#[derive(Debug, Default)]
pub struct WorkspaceState {
    pub imports: Vec<ImportCall>,
    pub notifications: HashMap<ObjectType, Vec<String>>,
    pub time_entries: Vec<TimeEntry>,
    pub since: Vec<DateTime<Utc>>,
    next_id: i64,
}

/// Workspace fake assigning sequential local IDs to imported objects.
#[derive(Clone, Default)]
pub struct RecordingWorkspace {
    pub state: Arc<Mutex<WorkspaceState>>,
}

impl RecordingWorkspace {
    pub async fn imports(&self) -> Vec<ImportCall> {
        self.state.lock().await.imports.clone()
    }
}

#[async_trait]
impl WorkspaceApi for RecordingWorkspace {
    async fn import(
        &self,
        _workspace_id: i64,
        object_type: ObjectType,
        body: Vec<u8>,
    ) -> PipeResult<ImportResponse> {
        let body: Value = serde_json::from_slice(&body)?;
        let mut state = self.state.lock().await;
        let mut imported = Vec::new();
        for object in body.as_array().cloned().unwrap_or_default() {
            let foreign_id = object["foreign_id"].as_str().unwrap_or_default().to_string();
            let id = match object["id"].as_i64() {
                Some(id) if id > 0 => id,
                _ => {
                    state.next_id += 1;
                    100 + state.next_id
                }
            };
            imported.push(ImportedId { foreign_id, id });
        }
        let notifications = state
            .notifications
            .get(&object_type)
            .cloned()
            .unwrap_or_default();
        state.imports.push(ImportCall { object_type, body });
        Ok(ImportResponse {
            imported,
            notifications,
        })
    }

    async fn time_entries(
        &self,
        _workspace_id: i64,
        since: DateTime<Utc>,
    ) -> PipeResult<Vec<TimeEntry>> {
        let mut state = self.state.lock().await;
        state.since.push(since);
        Ok(state.time_entries.clone())
    }
}

pub fn test_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

pub struct Harness {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub adapter: RecordingAdapter,
    pub workspace: RecordingWorkspace,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let pool = db::memory_pool().await.unwrap();
        let config = Arc::new(config);
        let adapter = RecordingAdapter::default();
        let workspace = RecordingWorkspace::default();
        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            config.clone(),
            Arc::new(adapter.clone()),
            Arc::new(workspace.clone()),
        ));
        Self {
            pool,
            config,
            adapter,
            workspace,
            orchestrator,
        }
    }

    /// Rebuilds the orchestrator with a smaller task import ceiling.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.orchestrator = Arc::new(
            Orchestrator::new(
                self.pool.clone(),
                self.config.clone(),
                Arc::new(self.adapter.clone()),
                Arc::new(self.workspace.clone()),
            )
            .with_max_payload(max_payload),
        );
        self
    }

    pub async fn authorize(&self, workspace_id: i64, service: ServiceId) {
        authorization::save(
            &self.pool,
            &Authorization {
                workspace_id,
                service_id: service,
                access_token: "token".into(),
                refresh_token: None,
                expires_at: None,
            },
        )
        .await
        .unwrap();
    }

    /// Authorizes the service and stores a configured pipe.
    pub async fn pipe(
        &self,
        workspace_id: i64,
        service: ServiceId,
        object_type: ObjectType,
        params: Value,
    ) -> Pipe {
        self.authorize(workspace_id, service).await;
        let integration = self.config.integration(service).unwrap();
        pipe::setup(&self.pool, integration, workspace_id, object_type, params, true)
            .await
            .unwrap()
    }
}
