//! Tests for project creation, lookup, and cascade deletion.

use foreman::config::GateConfig;
use foreman::gate::EpicTestingMode;
use foreman::store::{
    NewEpic, NewEpicTest, NewProject, NewTask, NewTaskTest, SandboxType, Store, StoreError,
};

fn new_project(name: &str) -> NewProject {
    NewProject {
        name: name.to_owned(),
        spec: "build a key-value store".to_owned(),
        epic_testing_mode: EpicTestingMode::Strict,
        sandbox_type: SandboxType::Docker,
        initializer_model: None,
        coding_model: None,
    }
}

async fn open_store() -> Store {
    Store::open_in_memory(GateConfig::default())
        .await
        .expect("in-memory store")
}

#[tokio::test]
async fn test_create_project_round_trip() {
    let store = open_store().await;
    let project = store
        .create_project(new_project("kvstore"))
        .await
        .expect("create");

    assert_eq!(project.name, "kvstore");
    assert!(!project.initialized);
    assert_eq!(project.epic_testing_mode, EpicTestingMode::Strict);
    assert_eq!(project.sandbox_type, SandboxType::Docker);

    let fetched = store.project(project.id).await.expect("fetch");
    assert_eq!(fetched.id, project.id);
    assert_eq!(fetched.spec, "build a key-value store");

    let by_name = store
        .project_by_name("kvstore")
        .await
        .expect("query")
        .expect("present");
    assert_eq!(by_name.id, project.id);
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let store = open_store().await;
    store
        .create_project(new_project("dup"))
        .await
        .expect("first create");

    match store.create_project(new_project("dup")).await {
        Err(StoreError::AlreadyExists { name }) => assert_eq!(name, "dup"),
        other => panic!("expected AlreadyExists, got {other:?}"),
    }
}

#[tokio::test]
async fn test_name_rule_enforced() {
    let store = open_store().await;
    for bad in ["Bad", "has space", "", "emoji🙂", "dots.here"] {
        let result = store.create_project(new_project(bad)).await;
        assert!(
            matches!(result, Err(StoreError::InvalidName { .. })),
            "{bad:?} should be rejected"
        );
    }
    for good in ["ok", "with-dash", "with_underscore", "a1b2"] {
        store
            .create_project(new_project(good))
            .await
            .unwrap_or_else(|e| panic!("{good:?} should be accepted: {e}"));
    }
}

#[tokio::test]
async fn test_empty_spec_rejected() {
    let store = open_store().await;
    let mut request = new_project("nospec");
    request.spec = "   ".to_owned();
    assert!(store.create_project(request).await.is_err());
}

#[tokio::test]
async fn test_missing_project_is_not_found() {
    let store = open_store().await;
    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        store.project(missing).await,
        Err(StoreError::NotFound { entity: "project", .. })
    ));
    assert!(store
        .project_by_name("ghost")
        .await
        .expect("query")
        .is_none());
}

#[tokio::test]
async fn test_delete_cascades_and_counts() {
    let store = open_store().await;
    let project = store
        .create_project(new_project("doomed"))
        .await
        .expect("create");

    let epic = store
        .insert_epic(
            project.id,
            NewEpic {
                name: "storage".to_owned(),
                description: String::new(),
                priority: 1,
            },
        )
        .await
        .expect("epic");
    let task = store
        .insert_task(
            epic.id,
            NewTask {
                action: "implement".to_owned(),
                description: String::new(),
                priority: 1,
            },
        )
        .await
        .expect("task");
    store
        .insert_task_test(
            task.id,
            NewTaskTest {
                category: "functional".to_owned(),
                requirements: String::new(),
                success_criteria: String::new(),
                steps: String::new(),
            },
        )
        .await
        .expect("test");
    store
        .insert_epic_test(
            epic.id,
            NewEpicTest {
                name: "integration".to_owned(),
                description: String::new(),
                depends_on_tasks: vec![task.id],
            },
        )
        .await
        .expect("epic test");
    store
        .record_session(project.id, foreman::store::SessionKind::Initializer, None)
        .await
        .expect("session");

    let counts = store.delete_project(project.id).await.expect("delete");
    assert_eq!(counts.epics, 1);
    assert_eq!(counts.tasks, 1);
    assert_eq!(counts.tests, 2, "task test + epic test");
    assert_eq!(counts.sessions, 1);

    assert!(matches!(
        store.project(project.id).await,
        Err(StoreError::NotFound { .. })
    ));
    // Children are gone with the parent.
    assert!(matches!(
        store.epic(epic.id).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_delete_missing_project_is_not_found() {
    let store = open_store().await;
    assert!(matches!(
        store.delete_project(uuid::Uuid::new_v4()).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("foreman.db");

    {
        let store = Store::open(
            &path,
            foreman::config::DatabaseConfig::default(),
            GateConfig::default(),
        )
        .await
        .expect("open");
        store
            .create_project(new_project("durable"))
            .await
            .expect("create");
    }

    let reopened = Store::open(
        &path,
        foreman::config::DatabaseConfig::default(),
        GateConfig::default(),
    )
    .await
    .expect("reopen");
    let project = reopened
        .project_by_name("durable")
        .await
        .expect("query")
        .expect("survives reopen");
    assert_eq!(project.spec, "build a key-value store");
}

#[tokio::test]
async fn test_set_initialized_completes_vacuous_epics() {
    let store = open_store().await;
    let project = store
        .create_project(new_project("sweep"))
        .await
        .expect("create");

    let vacuous = store
        .insert_epic(
            project.id,
            NewEpic {
                name: "placeholder".to_owned(),
                description: String::new(),
                priority: 1,
            },
        )
        .await
        .expect("epic");
    let real = store
        .insert_epic(
            project.id,
            NewEpic {
                name: "real work".to_owned(),
                description: String::new(),
                priority: 2,
            },
        )
        .await
        .expect("epic");
    store
        .insert_task(
            real.id,
            NewTask {
                action: "do it".to_owned(),
                description: String::new(),
                priority: 1,
            },
        )
        .await
        .expect("task");

    store
        .set_initialized(project.id, true)
        .await
        .expect("initialize");

    let vacuous = store.epic(vacuous.id).await.expect("fetch");
    assert_eq!(vacuous.status, foreman::store::EpicStatus::Completed);
    assert!(vacuous.completed_at.is_some());

    let real = store.epic(real.id).await.expect("fetch");
    assert_eq!(real.status, foreman::store::EpicStatus::Pending);
}
