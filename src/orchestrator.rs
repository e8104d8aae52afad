//! Runs one pipe: authenticate, fetch, reconcile, post, finalize status.
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::authorization;
use crate::config::Config;
use crate::connection::{self, Connection, ReversedConnection};
use crate::db::Pool;
use crate::error::{PipeError, PipeResult};
use crate::integrations::{Adapter, AdapterFactory, ServiceParams};
use crate::model::{Account, Client, ObjectType, Project, ServiceId, Task, User};
use crate::pipe::Pipe;
use crate::snapshot;
use crate::splitter;
use crate::status::{self, PipeStatus};
use crate::workspace::WorkspaceApi;

/// Foreign user IDs the caller opted in to invite.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Selection {
    #[serde(default)]
    pub ids: Vec<String>,
}

impl Selection {
    /// Parses a `{"ids": [...]}` request body; an empty body selects nothing.
    pub fn parse(body: &[u8]) -> PipeResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(body)?)
    }

    fn contains(&self, foreign_id: &str) -> bool {
        self.ids.iter().any(|id| id == foreign_id)
    }
}

/// Stages that must sync before `object_type`, followed by `object_type`
/// itself. Stages the service does not offer are skipped.
fn stages(service: ServiceId, object_type: ObjectType) -> Vec<ObjectType> {
    use ObjectType::*;
    let chain: &[ObjectType] = match object_type {
        Users => &[Users],
        Clients => &[Clients],
        Projects => &[Clients, Projects],
        Tasks => &[Clients, Projects, Tasks],
        TodoLists => &[Clients, Projects, TodoLists],
        TimeEntries => &[TimeEntries],
    };
    chain
        .iter()
        .copied()
        .filter(|&t| t == object_type || service.supports(t))
        .collect()
}

struct RunCtx<'a> {
    adapter: &'a dyn Adapter,
    workspace_id: i64,
    selection: &'a Selection,
}

pub struct Orchestrator {
    pool: Pool,
    config: Arc<Config>,
    adapters: Arc<dyn AdapterFactory>,
    workspace: Arc<dyn WorkspaceApi>,
    max_payload: usize,
}

impl Orchestrator {
    pub fn new(
        pool: Pool,
        config: Arc<Config>,
        adapters: Arc<dyn AdapterFactory>,
        workspace: Arc<dyn WorkspaceApi>,
    ) -> Self {
        Self {
            pool,
            config,
            adapters,
            workspace,
            max_payload: splitter::MAX_PAYLOAD_SIZE,
        }
    }

    /// Overrides the byte ceiling of one task import request.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the pipe to completion. Stage failures end up in the returned
    /// status; `Err` only means the status itself could not be written.
    #[instrument(skip_all, fields(run_id = %Uuid::new_v4(), workspace_id = pipe.workspace_id, pipe = %pipe.key()))]
    pub async fn run(&self, pipe: &mut Pipe, selection: &Selection) -> PipeResult<PipeStatus> {
        let mut status = PipeStatus::new(pipe.workspace_id, pipe.service_id, pipe.id);
        status::save(&self.pool, &status).await?;
        info!("pipe run started");

        let outcome = self.run_stages(pipe, selection, &mut status).await;
        if let Err(err) = &outcome {
            if err.should_report() {
                err.report(pipe.workspace_id, &pipe.key());
            }
            warn!(error = %err, "pipe run failed");
            status.add_error(err.user_message());
        }
        status::save(&self.pool, &status).await?;

        if outcome.is_ok() {
            pipe.last_sync = Some(status.sync_date);
            pipe.save(&self.pool).await?;
            info!(message = %status.message, "pipe run finished");
        }
        pipe.status = Some(status.clone());
        Ok(status)
    }

    async fn run_stages(
        &self,
        pipe: &Pipe,
        selection: &Selection,
        status: &mut PipeStatus,
    ) -> PipeResult<()> {
        let params = pipe.params()?;
        let adapter = self
            .authenticated(pipe.workspace_id, pipe.service_id, &params)
            .await?;
        let ctx = RunCtx {
            adapter: adapter.as_ref(),
            workspace_id: pipe.workspace_id,
            selection,
        };

        if pipe.id == ObjectType::TimeEntries {
            return self.export_time_entries(&ctx, pipe, status).await;
        }
        for stage in stages(pipe.service_id, pipe.id) {
            debug!(stage = %stage, "stage started");
            self.fetch(&ctx, stage).await?;
            self.post(&ctx, stage, status).await?;
        }
        Ok(())
    }

    async fn authenticated(
        &self,
        workspace_id: i64,
        service: ServiceId,
        params: &ServiceParams,
    ) -> PipeResult<Box<dyn Adapter>> {
        let mut adapter = self.adapters.build(service, params)?;
        let auth = authorization::load(&self.pool, workspace_id, service)
            .await?
            .ok_or_else(|| PipeError::Auth(format!("{} is not connected", service)))?;
        adapter.authenticate(&auth).await?;
        Ok(adapter)
    }

    /// Accounts reachable with the tenant's credential.
    #[instrument(skip(self))]
    pub async fn accounts(&self, workspace_id: i64, service: ServiceId) -> PipeResult<Vec<Account>> {
        let adapter = self
            .authenticated(workspace_id, service, &ServiceParams::default())
            .await?;
        adapter.accounts().await
    }

    /// Fetches the users a caller can pick from and stores the snapshot the
    /// next users run posts from.
    #[instrument(skip_all, fields(workspace_id = pipe.workspace_id, pipe = %pipe.key()))]
    pub async fn fetch_users(&self, pipe: &Pipe) -> PipeResult<Vec<User>> {
        let params = pipe.params()?;
        let adapter = self
            .authenticated(pipe.workspace_id, pipe.service_id, &params)
            .await?;
        let ctx = RunCtx {
            adapter: adapter.as_ref(),
            workspace_id: pipe.workspace_id,
            selection: &Selection::default(),
        };
        self.fetch(&ctx, ObjectType::Users).await?;
        snapshot::require(&self.pool, pipe.workspace_id, &adapter.key_for(ObjectType::Users)).await
    }

    async fn connection(&self, ctx: &RunCtx<'_>, object_type: ObjectType) -> PipeResult<Connection> {
        connection::load(&self.pool, ctx.workspace_id, &ctx.adapter.key_for(object_type)).await
    }

    async fn reversed(
        &self,
        ctx: &RunCtx<'_>,
        object_type: ObjectType,
    ) -> PipeResult<ReversedConnection> {
        connection::load_reversed(&self.pool, ctx.workspace_id, &ctx.adapter.key_for(object_type))
            .await
    }

    /// Pulls source objects, fills in known local IDs and stores a snapshot.
    #[instrument(skip_all, fields(stage = %object_type))]
    async fn fetch(&self, ctx: &RunCtx<'_>, object_type: ObjectType) -> PipeResult<()> {
        let key = ctx.adapter.key_for(object_type);
        let count = match object_type {
            ObjectType::Users => {
                let users = ctx.adapter.users().await?;
                snapshot::save(&self.pool, ctx.workspace_id, &key, &users).await?;
                users.len()
            }
            ObjectType::Clients => {
                let clients = reconcile_clients(
                    ctx.adapter.clients().await?,
                    &self.connection(ctx, ObjectType::Clients).await?,
                );
                snapshot::save(&self.pool, ctx.workspace_id, &key, &clients).await?;
                clients.len()
            }
            ObjectType::Projects => {
                let projects = reconcile_projects(
                    ctx.adapter.projects().await?,
                    &self.connection(ctx, ObjectType::Projects).await?,
                    &self.connection(ctx, ObjectType::Clients).await?,
                );
                snapshot::save(&self.pool, ctx.workspace_id, &key, &projects).await?;
                projects.len()
            }
            ObjectType::Tasks | ObjectType::TodoLists => {
                let fetched = if object_type == ObjectType::Tasks {
                    ctx.adapter.tasks().await?
                } else {
                    ctx.adapter.todo_lists().await?
                };
                let tasks = reconcile_tasks(
                    fetched,
                    &self.connection(ctx, object_type).await?,
                    &self.connection(ctx, ObjectType::Projects).await?,
                );
                snapshot::save(&self.pool, ctx.workspace_id, &key, &tasks).await?;
                tasks.len()
            }
            ObjectType::TimeEntries => {
                return Err(PipeError::UnsupportedObjectType {
                    service: ctx.adapter.service(),
                    object_type,
                })
            }
        };
        debug!(count, "fetched");
        Ok(())
    }

    /// Sends the latest snapshot to the workspace and records assigned IDs.
    #[instrument(skip_all, fields(stage = %object_type))]
    async fn post(
        &self,
        ctx: &RunCtx<'_>,
        object_type: ObjectType,
        status: &mut PipeStatus,
    ) -> PipeResult<()> {
        let key = ctx.adapter.key_for(object_type);
        let mut conn = self.connection(ctx, object_type).await?;

        match object_type {
            ObjectType::Users => {
                let users: Vec<User> = snapshot::require(&self.pool, ctx.workspace_id, &key).await?;
                let selected: Vec<User> = users
                    .into_iter()
                    .filter(|u| ctx.selection.contains(&u.foreign_id))
                    .map(|mut u| {
                        u.send_invitation = true;
                        u
                    })
                    .collect();
                if selected.is_empty() {
                    status.complete(object_type, Vec::new(), 0);
                    return Ok(());
                }
                let res = self
                    .workspace
                    .import(ctx.workspace_id, object_type, serde_json::to_vec(&selected)?)
                    .await?;
                res.merge_into(&mut conn);
                connection::save(&self.pool, &conn).await?;
                let count = res.count();
                status.complete(object_type, res.notifications, count);
            }
            ObjectType::Clients => {
                let clients: Vec<Client> =
                    snapshot::require(&self.pool, ctx.workspace_id, &key).await?;
                if clients.is_empty() {
                    status.complete(object_type, Vec::new(), 0);
                    return Ok(());
                }
                let res = self
                    .workspace
                    .import(ctx.workspace_id, object_type, serde_json::to_vec(&clients)?)
                    .await?;
                res.merge_into(&mut conn);
                connection::save(&self.pool, &conn).await?;
                let count = res.count();
                status.complete(object_type, res.notifications, count);
            }
            ObjectType::Projects => {
                let projects: Vec<Project> =
                    snapshot::require(&self.pool, ctx.workspace_id, &key).await?;
                let res = self
                    .workspace
                    .import(ctx.workspace_id, object_type, serde_json::to_vec(&projects)?)
                    .await?;
                res.merge_into(&mut conn);
                connection::save(&self.pool, &conn).await?;
                let count = res.count();
                status.complete(object_type, res.notifications, count);
            }
            ObjectType::Tasks | ObjectType::TodoLists => {
                let tasks: Vec<Task> = snapshot::require(&self.pool, ctx.workspace_id, &key).await?;
                let mut notifications = Vec::new();
                let mut count = 0;
                for chunk in splitter::split_with_limit(&tasks, 1, self.max_payload)? {
                    // Todo lists are tasks on the workspace side.
                    let res = self
                        .workspace
                        .import(ctx.workspace_id, ObjectType::Tasks, chunk)
                        .await?;
                    res.merge_into(&mut conn);
                    connection::save(&self.pool, &conn).await?;
                    count += res.count();
                    notifications.extend(res.notifications);
                }
                status.complete(object_type, notifications, count);
            }
            ObjectType::TimeEntries => {
                return Err(PipeError::UnsupportedObjectType {
                    service: ctx.adapter.service(),
                    object_type,
                })
            }
        }
        Ok(())
    }

    /// Pushes workspace time entries out to the service. A failed entry is
    /// noted and skipped; the run carries on.
    #[instrument(skip_all, fields(stage = "timeentries"))]
    async fn export_time_entries(
        &self,
        ctx: &RunCtx<'_>,
        pipe: &Pipe,
        status: &mut PipeStatus,
    ) -> PipeResult<()> {
        let since = pipe.last_sync.unwrap_or_else(|| {
            Utc::now() - Duration::days(i64::from(self.config.workspace.time_entries_lookback_days))
        });
        let entries = self.workspace.time_entries(ctx.workspace_id, since).await?;

        let task_type = if pipe.service_id.supports(ObjectType::Tasks) {
            ObjectType::Tasks
        } else {
            ObjectType::TodoLists
        };
        let users = self.reversed(ctx, ObjectType::Users).await?;
        let tasks = self.reversed(ctx, task_type).await?;
        let projects = self.reversed(ctx, ObjectType::Projects).await?;
        let mut conn = self.connection(ctx, ObjectType::TimeEntries).await?;
        let exported_before = conn.reversed();

        let mut notifications = Vec::new();
        let mut exported = 0;
        for entry in entries {
            let mut outgoing = entry.clone();
            outgoing.foreign_user_id = users.foreign_id(entry.user_id).map(str::to_string);
            outgoing.foreign_task_id = tasks.foreign_id(entry.task_id).map(str::to_string);
            outgoing.foreign_project_id = projects.foreign_id(entry.project_id).map(str::to_string);
            outgoing.foreign_id = exported_before.foreign_id(entry.id).map(str::to_string);

            if outgoing.foreign_user_id.is_none() {
                warn!(entry = entry.id, user = entry.user_id, "user not synced, entry skipped");
                notifications.push(format!(
                    "Time entry #{} was not exported: its user has not been synced",
                    entry.id
                ));
                continue;
            }

            match ctx.adapter.export_time_entry(&outgoing).await {
                Ok(foreign_id) => {
                    conn.set(foreign_id.to_string(), entry.id);
                    exported += 1;
                }
                Err(err) => {
                    warn!(entry = entry.id, error = %err, "time entry export failed");
                    if err.should_report() {
                        err.report(ctx.workspace_id, &pipe.key());
                    }
                    notifications.push(format!(
                        "Time entry #{} was not exported: {}",
                        entry.id,
                        err.user_message()
                    ));
                }
            }
        }

        connection::save(&self.pool, &conn).await?;
        status.complete(ObjectType::TimeEntries, notifications, exported);
        Ok(())
    }
}

fn reconcile_clients(clients: Vec<Client>, own: &Connection) -> Vec<Client> {
    clients
        .into_iter()
        .map(|mut c| {
            c.id = own.local_id(&c.foreign_id);
            c
        })
        .collect()
}

fn reconcile_projects(projects: Vec<Project>, own: &Connection, clients: &Connection) -> Vec<Project> {
    projects
        .into_iter()
        .filter_map(|mut p| {
            p.name = p.name.trim().to_string();
            if p.name.is_empty() {
                return None;
            }
            p.id = own.local_id(&p.foreign_id);
            p.client_id = p
                .foreign_client_id
                .as_deref()
                .map(|id| clients.local_id(id))
                .unwrap_or(0);
            Some(p)
        })
        .collect()
}

/// Inactive tasks are forwarded only when they were synced before.
fn reconcile_tasks(tasks: Vec<Task>, own: &Connection, projects: &Connection) -> Vec<Task> {
    tasks
        .into_iter()
        .filter_map(|mut t| {
            t.id = own.local_id(&t.foreign_id);
            if t.id == 0 && !t.active {
                return None;
            }
            t.project_id = projects.local_id(&t.foreign_project_id);
            Some(t)
        })
        .collect()
}
