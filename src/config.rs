//! Configuration loader and validator for the sync server.
use crate::model::ServiceId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub workspace: Workspace,
    pub scheduler: Scheduler,
    pub integrations: Vec<Integration>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Central time-tracking workspace API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workspace {
    pub api_url: String,
    pub api_token: String,
    #[serde(default = "default_lookback_days")]
    pub time_entries_lookback_days: u32,
}

/// Worker pool and periodic enqueue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub workers: usize,
    pub dequeue_batch: u32,
    pub idle_sleep_min_secs: u64,
    pub idle_sleep_max_secs: u64,
    pub autosync_min_minutes: u64,
    pub autosync_max_minutes: u64,
    pub users_run_wait_secs: u64,
}

/// One third-party service offered to tenants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Integration {
    pub id: ServiceId,
    pub name: String,
    pub api_url: String,
    #[serde(default)]
    pub premium: bool,
    pub auth_type: AuthType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Oauth1,
    Oauth2,
    Token,
}

fn default_lookback_days() -> u32 {
    30
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the file, then the data dir default.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/pipes.db", self.app.data_dir))
    }

    pub fn integration(&self, service: ServiceId) -> Option<&Integration> {
        self.integrations.iter().find(|i| i.id == service)
    }
}

impl Scheduler {
    pub fn idle_sleep_range(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.idle_sleep_min_secs),
            Duration::from_secs(self.idle_sleep_max_secs),
        )
    }

    pub fn autosync_range(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.autosync_min_minutes * 60),
            Duration::from_secs(self.autosync_max_minutes * 60),
        )
    }

    pub fn users_run_wait(&self) -> Duration {
        Duration::from_secs(self.users_run_wait_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.workspace.api_url.trim().is_empty() {
        return Err(ConfigError::Invalid("workspace.api_url must be non-empty"));
    }
    if cfg.workspace.api_token.trim().is_empty() {
        return Err(ConfigError::Invalid("workspace.api_token must be non-empty"));
    }

    let s = &cfg.scheduler;
    if s.workers == 0 {
        return Err(ConfigError::Invalid("scheduler.workers must be > 0"));
    }
    if s.dequeue_batch == 0 {
        return Err(ConfigError::Invalid("scheduler.dequeue_batch must be > 0"));
    }
    if s.idle_sleep_min_secs > s.idle_sleep_max_secs {
        return Err(ConfigError::Invalid(
            "scheduler.idle_sleep_min_secs must not exceed idle_sleep_max_secs",
        ));
    }
    if s.autosync_min_minutes == 0 {
        return Err(ConfigError::Invalid("scheduler.autosync_min_minutes must be > 0"));
    }
    if s.autosync_min_minutes > s.autosync_max_minutes {
        return Err(ConfigError::Invalid(
            "scheduler.autosync_min_minutes must not exceed autosync_max_minutes",
        ));
    }

    let mut seen = HashSet::new();
    for integration in &cfg.integrations {
        if !seen.insert(integration.id) {
            return Err(ConfigError::Invalid("integrations must not repeat an id"));
        }
        if integration.name.trim().is_empty() {
            return Err(ConfigError::Invalid("integrations[].name must be non-empty"));
        }
        if integration.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("integrations[].api_url must be non-empty"));
        }
    }

    Ok(())
}

/// Example configuration shipped with the repository.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

workspace:
  api_url: "https://track.example.com/api/v9/"
  api_token: "YOUR_WORKSPACE_API_TOKEN"
  time_entries_lookback_days: 30

scheduler:
  workers: 4
  dequeue_batch: 5
  idle_sleep_min_secs: 30
  idle_sleep_max_secs: 60
  autosync_min_minutes: 10
  autosync_max_minutes: 20
  users_run_wait_secs: 5

integrations:
  - id: basecamp
    name: "Basecamp"
    api_url: "https://basecamp.com/api/v1/"
    auth_type: oauth2
  - id: freshbooks
    name: "FreshBooks"
    api_url: "https://api.freshbooks.com/"
    auth_type: oauth1
    premium: true
  - id: asana
    name: "Asana"
    api_url: "https://app.asana.com/api/1.0/"
    auth_type: token
  - id: github
    name: "GitHub"
    api_url: "https://api.github.com/"
    auth_type: oauth2
  - id: teamweek
    name: "Teamweek"
    api_url: "https://teamweek.com/api/v4/"
    auth_type: oauth2
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.integrations.len(), 5);
        assert_eq!(
            cfg.integration(ServiceId::Freshbooks).map(|i| i.premium),
            Some(true)
        );
    }

    #[test]
    fn invalid_workspace_token() {
        let mut cfg = example_cfg();
        cfg.workspace.api_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("workspace.api_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_scheduler_ranges() {
        let mut cfg = example_cfg();
        cfg.scheduler.workers = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.scheduler.idle_sleep_min_secs = 90;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("idle_sleep_min_secs")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_cfg();
        cfg.scheduler.autosync_max_minutes = 1;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_integrations_rejected() {
        let mut cfg = example_cfg();
        let dup = cfg.integrations[0].clone();
        cfg.integrations.push(dup);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_service_fails_to_parse() {
        let yaml = example().replace("id: github", "id: jira");
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.scheduler.workers, 4);
        assert_eq!(cfg.workspace.time_entries_lookback_days, 30);
    }
}
