use crate::error::PipeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Object types a pipe can synchronize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Users,
    Clients,
    Projects,
    TodoLists,
    Tasks,
    TimeEntries,
}

impl ObjectType {
    pub const ALL: [ObjectType; 6] = [
        ObjectType::Users,
        ObjectType::Clients,
        ObjectType::Projects,
        ObjectType::TodoLists,
        ObjectType::Tasks,
        ObjectType::TimeEntries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Users => "users",
            ObjectType::Clients => "clients",
            ObjectType::Projects => "projects",
            ObjectType::TodoLists => "todolists",
            ObjectType::Tasks => "tasks",
            ObjectType::TimeEntries => "timeentries",
        }
    }

    /// Display name used for pipes that were never configured.
    pub fn title(&self) -> &'static str {
        match self {
            ObjectType::Users => "Users",
            ObjectType::Clients => "Clients",
            ObjectType::Projects => "Projects",
            ObjectType::TodoLists => "Todo lists",
            ObjectType::Tasks => "Tasks",
            ObjectType::TimeEntries => "Time entries",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PipeError::Config(format!("unknown object type '{}'", s)))
    }
}

/// Third-party services a tenant can connect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceId {
    Basecamp,
    Freshbooks,
    Asana,
    Github,
    Teamweek,
}

impl ServiceId {
    pub const ALL: [ServiceId; 5] = [
        ServiceId::Basecamp,
        ServiceId::Freshbooks,
        ServiceId::Asana,
        ServiceId::Github,
        ServiceId::Teamweek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Basecamp => "basecamp",
            ServiceId::Freshbooks => "freshbooks",
            ServiceId::Asana => "asana",
            ServiceId::Github => "github",
            ServiceId::Teamweek => "teamweek",
        }
    }

    /// Object types the service exposes.
    pub fn supported(&self) -> &'static [ObjectType] {
        use ObjectType::*;
        match self {
            ServiceId::Basecamp => &[Users, Projects, TodoLists, TimeEntries],
            ServiceId::Freshbooks => &[Users, Clients, Projects, Tasks, TimeEntries],
            ServiceId::Asana => &[Users, Projects, Tasks],
            ServiceId::Github => &[Projects],
            ServiceId::Teamweek => &[Users, Projects, Tasks],
        }
    }

    pub fn supports(&self, object_type: ObjectType) -> bool {
        self.supported().contains(&object_type)
    }

    /// Services holding several accounts per authorization namespace their
    /// keys by account.
    pub fn has_accounts(&self) -> bool {
        matches!(
            self,
            ServiceId::Basecamp | ServiceId::Asana | ServiceId::Teamweek
        )
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceId::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PipeError::Config(format!("unknown service '{}'", s)))
    }
}

/// Storage key and public identifier of a pipe: `service:objectType`.
pub fn pipe_key(service: ServiceId, object_type: ObjectType) -> String {
    format!("{}:{}", service, object_type)
}

pub fn parse_pipe_key(key: &str) -> Result<(ServiceId, ObjectType), PipeError> {
    let (service, object_type) = key
        .split_once(':')
        .ok_or_else(|| PipeError::Config(format!("malformed pipe key '{}'", key)))?;
    Ok((service.parse()?, object_type.parse()?))
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: i64,
    pub foreign_id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub send_invitation: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: i64,
    pub foreign_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: i64,
    pub foreign_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub billable: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub client_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_client_id: Option<String>,
}

/// Tasks and todo lists share one shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: i64,
    pub foreign_id: String,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub project_id: i64,
    #[serde(default)]
    pub foreign_project_id: String,
}

/// Time entry read from the workspace and exported to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeEntry {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_id: Option<String>,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default)]
    pub task_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub billable: bool,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<DateTime<Utc>>,
    pub duration_in_seconds: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub name: String,
}

fn default_true() -> bool {
    true
}
