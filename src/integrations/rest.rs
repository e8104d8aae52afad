use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client as HttpClient, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use tracing::{debug, instrument};

use super::model::{ExportResponse, ServiceParams};
use super::Adapter;
use crate::authorization::Authorization;
use crate::error::{PipeError, PipeResult};
use crate::http;
use crate::model::{Account, Client, ObjectType, Project, ServiceId, Task, TimeEntry, User};

/// JSON-over-HTTP adapter. Services with accounts are addressed under
/// `accounts/{id}/`.
#[derive(Clone)]
pub struct RestAdapter {
    http: HttpClient,
    service: ServiceId,
    base_url: Url,
    params: ServiceParams,
    token: Option<String>,
}

impl fmt::Debug for RestAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestAdapter")
            .field("service", &self.service)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RestAdapter {
    pub fn new(
        http: HttpClient,
        service: ServiceId,
        api_url: &str,
        params: ServiceParams,
    ) -> PipeResult<Self> {
        Ok(Self {
            http,
            service,
            base_url: http::base_url(api_url)?,
            params,
            token: None,
        })
    }

    fn token(&self) -> PipeResult<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| PipeError::Auth(format!("{} adapter is not authenticated", self.service)))
    }

    fn scoped(&self, path: &str) -> PipeResult<Url> {
        match (self.service.has_accounts(), self.params.account_id) {
            (true, Some(account_id)) => {
                http::join(&self.base_url, &format!("accounts/{}/{}", account_id, path))
            }
            _ => http::join(&self.base_url, path),
        }
    }

    #[instrument(skip(self), fields(service = %self.service))]
    async fn get_list<T: DeserializeOwned>(&self, url: Url) -> PipeResult<Vec<T>> {
        let res = self.http.get(url).bearer_auth(self.token()?).send().await?;
        let body = http::read_body(res).await?;
        let objects: Vec<T> = serde_json::from_str(&body)?;
        debug!(count = objects.len(), "fetched objects");
        Ok(objects)
    }
}

#[async_trait]
impl Adapter for RestAdapter {
    fn service(&self) -> ServiceId {
        self.service
    }

    fn key_for(&self, object_type: ObjectType) -> String {
        super::key_for(self.service, &self.params, object_type)
    }

    async fn authenticate(&mut self, authorization: &Authorization) -> PipeResult<()> {
        if authorization.service_id != self.service {
            return Err(PipeError::Auth(format!(
                "authorization belongs to {}, not {}",
                authorization.service_id, self.service
            )));
        }
        if authorization.access_token.trim().is_empty() {
            return Err(PipeError::Auth("missing access token".into()));
        }
        if authorization.is_expired(Utc::now()) {
            return Err(PipeError::Auth(format!(
                "{} access token expired, reconnect the integration",
                self.service
            )));
        }
        self.token = Some(authorization.access_token.clone());
        Ok(())
    }

    async fn users(&self) -> PipeResult<Vec<User>> {
        self.get_list(self.scoped("users")?).await
    }

    async fn clients(&self) -> PipeResult<Vec<Client>> {
        self.get_list(self.scoped("clients")?).await
    }

    async fn projects(&self) -> PipeResult<Vec<Project>> {
        self.get_list(self.scoped("projects")?).await
    }

    async fn tasks(&self) -> PipeResult<Vec<Task>> {
        self.get_list(self.scoped("tasks")?).await
    }

    async fn todo_lists(&self) -> PipeResult<Vec<Task>> {
        self.get_list(self.scoped("todolists")?).await
    }

    async fn accounts(&self) -> PipeResult<Vec<Account>> {
        self.get_list(http::join(&self.base_url, "accounts")?).await
    }

    #[instrument(skip_all, fields(service = %self.service, entry = entry.id))]
    async fn export_time_entry(&self, entry: &TimeEntry) -> PipeResult<i64> {
        let token = self.token()?;
        let req = match &entry.foreign_id {
            Some(foreign_id) => self
                .http
                .put(self.scoped(&format!("time_entries/{}", foreign_id))?),
            None => self.http.post(self.scoped("time_entries")?),
        };
        let res = req.bearer_auth(token).json(entry).send().await?;
        let body = http::read_body(res).await?;
        let created: ExportResponse = serde_json::from_str(&body)?;
        Ok(created.id)
    }
}
