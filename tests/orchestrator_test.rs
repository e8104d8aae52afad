mod common;

use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};

use common::{Failure, Harness};
use pipesync::connection::{self, Connection};
use pipesync::error::{PipeError, GENERIC_ERROR_MESSAGE};
use pipesync::model::{Account, Client, ObjectType, Project, ServiceId, Task, TimeEntry, User};
use pipesync::orchestrator::Selection;
use pipesync::pipe;
use pipesync::snapshot;
use pipesync::status::{self, RunState};

fn project(foreign_id: &str, name: &str, client: Option<&str>) -> Project {
    Project {
        foreign_id: foreign_id.into(),
        name: name.into(),
        active: true,
        foreign_client_id: client.map(str::to_string),
        ..Default::default()
    }
}

fn task(foreign_id: &str, active: bool, project: &str) -> Task {
    Task {
        foreign_id: foreign_id.into(),
        name: format!("Task {}", foreign_id),
        active,
        foreign_project_id: project.into(),
        ..Default::default()
    }
}

fn user(foreign_id: &str) -> User {
    User {
        foreign_id: foreign_id.into(),
        email: format!("{}@example.com", foreign_id),
        name: foreign_id.to_uppercase(),
        ..Default::default()
    }
}

fn entry(id: i64) -> TimeEntry {
    TimeEntry {
        id,
        foreign_id: None,
        project_id: 2,
        task_id: 3,
        user_id: 5,
        billable: true,
        start: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::hours(id),
        stop: None,
        duration_in_seconds: 1800,
        description: format!("entry {}", id),
        foreign_user_id: None,
        foreign_task_id: None,
        foreign_project_id: None,
    }
}

async fn seed_connection(h: &Harness, key: &str, pairs: &[(&str, i64)]) {
    let mut conn = Connection::new(1, key);
    for (foreign_id, local_id) in pairs {
        conn.set(*foreign_id, *local_id);
    }
    connection::save(&h.pool, &conn).await.unwrap();
}

#[tokio::test]
async fn projects_sync_clients_first_and_trim_names() {
    let h = Harness::new().await;
    {
        let mut s = h.adapter.state.lock().await;
        s.clients = vec![Client {
            foreign_id: "c1".into(),
            name: "Acme".into(),
            ..Default::default()
        }];
        s.projects = vec![project("p1", " Leading ", Some("c1")), project("p2", " ", None)];
    }
    let mut pipe = h
        .pipe(1, ServiceId::Freshbooks, ObjectType::Projects, Value::Null)
        .await;

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.status, RunState::Success);
    assert_eq!(status.message, "Successfully synced 1 clients, 1 projects");
    assert_eq!(h.adapter.calls().await, vec!["clients", "projects"]);

    let imports = h.workspace.imports().await;
    let types: Vec<ObjectType> = imports.iter().map(|c| c.object_type).collect();
    assert_eq!(types, vec![ObjectType::Clients, ObjectType::Projects]);
    let posted = imports[1].body.as_array().unwrap();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0]["name"], "Leading");
    assert_eq!(posted[0]["client_id"], 101);

    let projects = connection::load(&h.pool, 1, "freshbooks:projects").await.unwrap();
    assert_eq!(projects.local_id("p1"), 102);

    let stored = pipe::load(&h.pool, 1, ServiceId::Freshbooks, ObjectType::Projects)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_sync, Some(status.sync_date));
    assert_eq!(stored.status, Some(status));
}

#[tokio::test]
async fn rerun_reuses_connected_ids() {
    let h = Harness::new().await;
    h.adapter.state.lock().await.projects = vec![project("p1", "Site", None)];
    let mut pipe = h
        .pipe(1, ServiceId::Github, ObjectType::Projects, Value::Null)
        .await;

    h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();
    h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    let imports = h.workspace.imports().await;
    assert_eq!(imports.len(), 2);
    assert!(imports[0].body[0].get("id").is_none());
    assert_eq!(imports[1].body[0]["id"], 101);
    let conn = connection::load(&h.pool, 1, "github:projects").await.unwrap();
    assert_eq!(conn.len(), 1);
}

#[tokio::test]
async fn tasks_keep_known_or_active_only() {
    let h = Harness::new().await;
    seed_connection(&h, "freshbooks:tasks", &[("t-old", 40)]).await;
    {
        let mut s = h.adapter.state.lock().await;
        s.projects = vec![project("p1", "Site", None)];
        s.tasks = vec![
            task("t-old", false, "p1"),
            task("t-new", false, "p1"),
            task("t-act", true, "p1"),
        ];
    }
    h.workspace
        .state
        .lock()
        .await
        .notifications
        .insert(ObjectType::Tasks, vec!["Task 't-act' was renamed".into()]);
    let mut pipe = h
        .pipe(1, ServiceId::Freshbooks, ObjectType::Tasks, Value::Null)
        .await;

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.message, "Successfully synced 1 projects, 2 tasks");
    assert_eq!(status.notifications, vec!["Task 't-act' was renamed".to_string()]);
    assert_eq!(status.sync_log, "/api/v1/integrations/freshbooks/pipes/tasks/log");
    assert_eq!(h.adapter.calls().await, vec!["clients", "projects", "tasks"]);

    let imports = h.workspace.imports().await;
    // No clients means no clients import.
    assert_eq!(imports[0].object_type, ObjectType::Projects);
    let tasks = &imports[1].body;
    let ids: Vec<&str> = tasks
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["foreign_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["t-old", "t-act"]);
    assert_eq!(tasks[0]["id"], 40);
    assert_eq!(tasks[0]["project_id"], 101);

    let conn = connection::load(&h.pool, 1, "freshbooks:tasks").await.unwrap();
    assert_eq!(conn.local_id("t-old"), 40);
    assert!(conn.local_id("t-act") > 0);
    assert_eq!(conn.local_id("t-new"), 0);
}

#[tokio::test]
async fn large_task_lists_post_in_chunks() {
    let h = Harness::new().await.with_max_payload(150);
    {
        let mut s = h.adapter.state.lock().await;
        s.projects = vec![project("p1", "Site", None)];
        s.tasks = (1..=4).map(|n| task(&format!("t{n}"), true, "p1")).collect();
    }
    h.workspace
        .state
        .lock()
        .await
        .notifications
        .insert(ObjectType::Tasks, vec!["Task limit reached".into()]);
    let mut pipe = h
        .pipe(1, ServiceId::Freshbooks, ObjectType::Tasks, Value::Null)
        .await;

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.status, RunState::Success);
    assert_eq!(status.message, "Successfully synced 1 projects, 4 tasks");
    assert_eq!(status.notifications.len(), 4);

    let task_imports: Vec<_> = h
        .workspace
        .imports()
        .await
        .into_iter()
        .filter(|c| c.object_type == ObjectType::Tasks)
        .collect();
    assert!(task_imports.len() >= 2);
    let posted: usize = task_imports
        .iter()
        .map(|c| c.body.as_array().unwrap().len())
        .sum();
    assert_eq!(posted, 4);

    let conn = connection::load(&h.pool, 1, "freshbooks:tasks").await.unwrap();
    assert_eq!(conn.len(), 4);
    for n in 1..=4 {
        assert!(conn.local_id(&format!("t{n}")) > 0);
    }
}

#[tokio::test]
async fn todo_lists_post_as_tasks_under_account_keys() {
    let h = Harness::new().await;
    {
        let mut s = h.adapter.state.lock().await;
        s.projects = vec![project("p1", "Site", None)];
        s.todo_lists = vec![task("l1", true, "p1")];
    }
    let mut pipe = h
        .pipe(
            1,
            ServiceId::Basecamp,
            ObjectType::TodoLists,
            json!({"account_id": 7}),
        )
        .await;

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.message, "Successfully synced 1 projects, 1 todolists");
    assert_eq!(h.adapter.calls().await, vec!["projects", "todolists"]);
    let types: Vec<ObjectType> = h
        .workspace
        .imports()
        .await
        .iter()
        .map(|c| c.object_type)
        .collect();
    assert_eq!(types, vec![ObjectType::Projects, ObjectType::Tasks]);

    let lists = connection::load(&h.pool, 1, "basecamp:account:7:todolists")
        .await
        .unwrap();
    assert!(lists.local_id("l1") > 0);
}

#[tokio::test]
async fn nested_failure_aborts_outer_stage() {
    let h = Harness::new().await;
    {
        let mut s = h.adapter.state.lock().await;
        s.failures.insert(ObjectType::Clients, Failure::Remote);
        s.projects = vec![project("p1", "Site", None)];
    }
    let mut pipe = h
        .pipe(1, ServiceId::Freshbooks, ObjectType::Projects, Value::Null)
        .await;

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.status, RunState::Error);
    assert!(status.message.contains("502"), "{}", status.message);
    assert_eq!(h.adapter.calls().await, vec!["clients"]);
    assert!(h.workspace.imports().await.is_empty());

    let stored = pipe::load(&h.pool, 1, ServiceId::Freshbooks, ObjectType::Projects)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.last_sync.is_none());
    assert_eq!(stored.status.unwrap().status, RunState::Error);
}

#[tokio::test]
async fn later_stage_error_is_not_masked_by_earlier_success() {
    let h = Harness::new().await;
    {
        let mut s = h.adapter.state.lock().await;
        s.clients = vec![Client {
            foreign_id: "c1".into(),
            name: "Acme".into(),
            ..Default::default()
        }];
        s.failures.insert(ObjectType::Projects, Failure::Auth);
    }
    let mut pipe = h
        .pipe(1, ServiceId::Freshbooks, ObjectType::Projects, Value::Null)
        .await;

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.status, RunState::Error);
    assert_eq!(status.message, "authentication failed: token revoked");
    assert_eq!(status.object_counts, vec!["1 clients".to_string()]);
}

#[tokio::test]
async fn serialization_errors_show_generic_message() {
    let h = Harness::new().await;
    h.adapter
        .state
        .lock()
        .await
        .failures
        .insert(ObjectType::Projects, Failure::Serialization);
    let mut pipe = h
        .pipe(1, ServiceId::Github, ObjectType::Projects, Value::Null)
        .await;

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.status, RunState::Error);
    assert_eq!(status.message, GENERIC_ERROR_MESSAGE);
    let stored = status::load(&h.pool, 1, ServiceId::Github, ObjectType::Projects)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.message, GENERIC_ERROR_MESSAGE);
}

#[tokio::test]
async fn missing_authorization_fails_run() {
    let h = Harness::new().await;
    let integration = h.config.integration(ServiceId::Github).unwrap();
    let mut pipe = pipe::setup(
        &h.pool,
        integration,
        1,
        ObjectType::Projects,
        Value::Null,
        false,
    )
    .await
    .unwrap();

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.status, RunState::Error);
    assert!(status.message.contains("not connected"));
    assert!(h.adapter.calls().await.is_empty());
}

#[tokio::test]
async fn users_post_only_selected_with_invitation() {
    let h = Harness::new().await;
    h.adapter.state.lock().await.users = vec![user("u1"), user("u2"), user("u3")];
    let mut pipe = h
        .pipe(1, ServiceId::Freshbooks, ObjectType::Users, Value::Null)
        .await;

    let selection = Selection::parse(br#"{"ids": ["u1", "u3"]}"#).unwrap();
    let status = h.orchestrator.run(&mut pipe, &selection).await.unwrap();

    assert_eq!(status.message, "Successfully synced 2 users");
    let imports = h.workspace.imports().await;
    assert_eq!(imports.len(), 1);
    let posted = imports[0].body.as_array().unwrap();
    assert_eq!(posted.len(), 2);
    assert!(posted.iter().all(|u| u["send_invitation"] == true));

    let conn = connection::load(&h.pool, 1, "freshbooks:users").await.unwrap();
    assert!(conn.local_id("u1") > 0);
    assert_eq!(conn.local_id("u2"), 0);
}

#[tokio::test]
async fn users_without_selection_post_nothing() {
    let h = Harness::new().await;
    h.adapter.state.lock().await.users = vec![user("u1")];
    let mut pipe = h
        .pipe(1, ServiceId::Freshbooks, ObjectType::Users, Value::Null)
        .await;

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.status, RunState::Success);
    assert_eq!(status.message, "No new objects to sync");
    assert!(h.workspace.imports().await.is_empty());
}

#[tokio::test]
async fn time_entry_failure_is_noted_and_skipped() {
    let h = Harness::new().await;
    seed_connection(&h, "freshbooks:users", &[("fu-5", 5)]).await;
    seed_connection(&h, "freshbooks:tasks", &[("ft-3", 3)]).await;
    seed_connection(&h, "freshbooks:projects", &[("fp-2", 2)]).await;
    h.workspace.state.lock().await.time_entries = (1..=10).map(entry).collect();
    h.adapter.state.lock().await.failing_entries.insert(7);
    let mut pipe = h
        .pipe(1, ServiceId::Freshbooks, ObjectType::TimeEntries, Value::Null)
        .await;

    let first = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(first.status, RunState::Success);
    assert_eq!(first.message, "Successfully synced 9 timeentries");
    assert_eq!(first.notifications.len(), 1);
    assert!(first.notifications[0].contains("#7"));
    assert!(!first.sync_log.is_empty());

    let exported = h.adapter.exported().await;
    assert_eq!(exported.len(), 9);
    assert!(exported.iter().all(|e| {
        e.foreign_user_id.as_deref() == Some("fu-5")
            && e.foreign_task_id.as_deref() == Some("ft-3")
            && e.foreign_project_id.as_deref() == Some("fp-2")
    }));

    let conn = connection::load(&h.pool, 1, "freshbooks:timeentries")
        .await
        .unwrap();
    assert_eq!(conn.len(), 9);
    let by_local = conn.reversed();
    for id in (1..=10).filter(|id| *id != 7) {
        assert!(by_local.foreign_id(id).is_some(), "entry {id} not connected");
    }
    assert!(by_local.foreign_id(7).is_none());

    let since = h.workspace.state.lock().await.since.clone();
    assert!(since[0] < Utc::now() - Duration::days(29));

    // Next run reads since the last success and updates known entries.
    h.adapter.state.lock().await.failing_entries.clear();
    let second = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();
    assert_eq!(second.status, RunState::Success);
    assert!(second.notifications.is_empty());

    let since = h.workspace.state.lock().await.since.clone();
    assert_eq!(since[1], first.sync_date);
    let exported = h.adapter.exported().await;
    let updates = exported[9..].iter().filter(|e| e.foreign_id.is_some()).count();
    assert_eq!(updates, 9);
    let conn = connection::load(&h.pool, 1, "freshbooks:timeentries")
        .await
        .unwrap();
    assert_eq!(conn.len(), 10);
}

#[tokio::test]
async fn time_entries_of_unsynced_users_are_skipped() {
    let h = Harness::new().await;
    h.workspace.state.lock().await.time_entries = vec![entry(1)];
    let mut pipe = h
        .pipe(1, ServiceId::Freshbooks, ObjectType::TimeEntries, Value::Null)
        .await;

    let status = h.orchestrator.run(&mut pipe, &Selection::default()).await.unwrap();

    assert_eq!(status.status, RunState::Success);
    assert_eq!(status.message, "No new objects to sync");
    assert!(status.notifications[0].contains("#1"));
    assert!(h.adapter.exported().await.is_empty());
}

#[tokio::test]
async fn accounts_need_authorization() {
    let h = Harness::new().await;
    h.adapter.state.lock().await.accounts = vec![Account {
        id: 3,
        name: "Main".into(),
    }];
    h.authorize(1, ServiceId::Basecamp).await;

    let accounts = h.orchestrator.accounts(1, ServiceId::Basecamp).await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].name, "Main");

    let err = h.orchestrator.accounts(1, ServiceId::Asana).await.unwrap_err();
    assert!(matches!(err, PipeError::Auth(_)));
}

#[tokio::test]
async fn fetched_users_are_kept_as_snapshot() {
    let h = Harness::new().await;
    h.adapter.state.lock().await.users = vec![user("u1"), user("u2")];
    let pipe = h
        .pipe(1, ServiceId::Asana, ObjectType::Users, json!({"account_id": 3}))
        .await;

    let users = h.orchestrator.fetch_users(&pipe).await.unwrap();
    assert_eq!(users.len(), 2);

    let (stored, _) = snapshot::latest::<User>(&h.pool, 1, "asana:account:3:users")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, users);
}
