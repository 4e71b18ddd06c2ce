//! Tests for the initializer session lifecycle.

use std::sync::Arc;

use foreman::events::ProjectEvent;
use foreman::gate::EpicTestingMode;
use foreman::orchestrator::{InitializeOptions, OrchestratorError};
use foreman::runner::SessionRunner;
use foreman::store::{SessionKind, SessionStatus};

use crate::support::{
    self, collect_until_terminal, create_project, orchestrator, sample_init_events, wait_until_idle,
    Behavior, ScriptedRunner,
};

#[tokio::test]
async fn test_initialize_plans_roadmap_and_sets_flag() {
    let runner = Arc::new(ScriptedRunner::completing(sample_init_events()));
    let orch = orchestrator(Arc::clone(&runner) as Arc<dyn SessionRunner>).await;
    let project = create_project(&orch, "planned", EpicTestingMode::Strict).await;

    let session = orch
        .initialize(project.id, InitializeOptions::default())
        .await
        .expect("initialize");
    assert_eq!(session.kind, SessionKind::Initializer);
    assert_eq!(session.session_number, 1);

    wait_until_idle(&orch, &project).await;

    let project_row = orch.store().project(project.id).await.expect("fetch");
    assert!(project_row.initialized);

    let epics = orch.store().epics(project.id).await.expect("epics");
    assert_eq!(epics.len(), 2);
    assert_eq!(epics[0].name, "storage layer");
    assert_eq!(epics[1].name, "query layer");

    let first_epic_tests = orch.store().epic_tests(epics[0].id).await.expect("tests");
    assert_eq!(first_epic_tests.len(), 1);
    assert_eq!(first_epic_tests[0].name, "storage integration");
    assert_eq!(
        first_epic_tests[0].depends_on_tasks.len(),
        1,
        "planning refs resolve to real task ids"
    );

    let finished = orch.get_session(session.id).await.expect("session");
    assert_eq!(finished.status, SessionStatus::Completed);
    let metrics = finished.metrics.expect("metrics recorded");
    assert_eq!(metrics.tool_uses, 3);

    let progress = orch.store().progress_snapshot(project.id).await.expect("progress");
    assert_eq!(progress.epics_total, 2);
    assert_eq!(progress.tasks_total, 2);
    assert_eq!(progress.tests_total, 1);
}

#[tokio::test]
async fn test_two_subscribers_observe_the_same_ordered_stream() {
    let runner = Arc::new(ScriptedRunner::completing(sample_init_events()));
    let orch = orchestrator(Arc::clone(&runner) as Arc<dyn SessionRunner>).await;
    let project = create_project(&orch, "observed", EpicTestingMode::Strict).await;

    let mut first = orch.subscribe(project.id).await.expect("subscribe");
    let mut second = orch.subscribe(project.id).await.expect("subscribe");

    orch.initialize(project.id, InitializeOptions::default())
        .await
        .expect("initialize");

    let first_events = collect_until_terminal(&mut first).await;
    let second_events = collect_until_terminal(&mut second).await;

    let render = |events: &[ProjectEvent]| -> Vec<String> {
        events
            .iter()
            .map(|e| serde_json::to_string(e).expect("serializable"))
            .collect()
    };
    assert_eq!(render(&first_events), render(&second_events));

    assert!(matches!(
        first_events.first(),
        Some(ProjectEvent::SessionStarted { number: 1, .. })
    ));
    assert!(matches!(
        first_events.last(),
        Some(ProjectEvent::SessionComplete {
            status: SessionStatus::Completed,
            ..
        })
    ));
    assert!(first_events
        .iter()
        .any(|e| matches!(e, ProjectEvent::AssistantMessage { .. })));
}

#[tokio::test]
async fn test_initialize_is_exclusive_while_running() {
    let runner =
        Arc::new(ScriptedRunner::completing(vec![]).with_init(Behavior::HangUntilCancel));
    let orch = orchestrator(Arc::clone(&runner) as Arc<dyn SessionRunner>).await;
    let project = create_project(&orch, "exclusive", EpicTestingMode::Strict).await;

    orch.initialize(project.id, InitializeOptions::default())
        .await
        .expect("first initialize");
    support::wait_for_started(&runner, 1).await;

    assert!(matches!(
        orch.initialize(project.id, InitializeOptions::default()).await,
        Err(OrchestratorError::Busy)
    ));

    orch.cancel_session(project.id).await.expect("cancel");
    wait_until_idle(&orch, &project).await;
}

#[tokio::test]
async fn test_initialize_twice_rejected() {
    let runner = Arc::new(ScriptedRunner::completing(sample_init_events()));
    let orch = orchestrator(Arc::clone(&runner) as Arc<dyn SessionRunner>).await;
    let project = create_project(&orch, "once", EpicTestingMode::Strict).await;

    orch.initialize(project.id, InitializeOptions::default())
        .await
        .expect("initialize");
    wait_until_idle(&orch, &project).await;

    assert!(matches!(
        orch.initialize(project.id, InitializeOptions::default()).await,
        Err(OrchestratorError::AlreadyInitialized)
    ));
}

#[tokio::test]
async fn test_initialize_unknown_project() {
    let runner = Arc::new(ScriptedRunner::completing(vec![]));
    let orch = orchestrator(runner).await;

    assert!(matches!(
        orch.initialize(uuid::Uuid::new_v4(), InitializeOptions::default())
            .await,
        Err(OrchestratorError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_cancel_initialize_round_trip() {
    let runner = Arc::new(ScriptedRunner::completing(sample_init_events()));
    let orch = orchestrator(Arc::clone(&runner) as Arc<dyn SessionRunner>).await;
    let project = create_project(&orch, "redo", EpicTestingMode::Strict).await;

    orch.initialize(project.id, InitializeOptions::default())
        .await
        .expect("initialize");
    wait_until_idle(&orch, &project).await;
    assert!(orch.store().project(project.id).await.expect("fetch").initialized);

    let counts = orch
        .cancel_initialize(project.id)
        .await
        .expect("cancel initialize");
    assert_eq!(counts.epics_deleted, 2);
    assert_eq!(counts.tasks_deleted, 2);
    assert_eq!(counts.tests_deleted, 2, "task test + epic test");

    let project_row = orch.store().project(project.id).await.expect("fetch");
    assert!(!project_row.initialized);
    assert!(orch.store().epics(project.id).await.expect("epics").is_empty());

    // Re-initialize lands a clean roadmap with no residue.
    orch.initialize(project.id, InitializeOptions::default())
        .await
        .expect("re-initialize");
    wait_until_idle(&orch, &project).await;

    let project_row = orch.store().project(project.id).await.expect("fetch");
    assert!(project_row.initialized);
    assert_eq!(orch.store().epics(project.id).await.expect("epics").len(), 2);
}

#[tokio::test]
async fn test_cancel_initialize_interrupts_running_session() {
    let runner =
        Arc::new(ScriptedRunner::completing(vec![]).with_init(Behavior::HangUntilCancel));
    let orch = orchestrator(Arc::clone(&runner) as Arc<dyn SessionRunner>).await;
    let project = create_project(&orch, "interrupted", EpicTestingMode::Strict).await;

    let session = orch
        .initialize(project.id, InitializeOptions::default())
        .await
        .expect("initialize");
    support::wait_for_started(&runner, 1).await;

    let counts = orch
        .cancel_initialize(project.id)
        .await
        .expect("cancel initialize");
    assert_eq!(counts.epics_deleted, 0, "nothing was planned yet");

    let session_row = orch.get_session(session.id).await.expect("session");
    assert_eq!(session_row.status, SessionStatus::Cancelled);
    assert!(!orch.store().project(project.id).await.expect("fetch").initialized);
    assert!(!orch.is_busy(project.id).await);
}

#[tokio::test]
async fn test_failed_initializer_leaves_project_uninitialized() {
    let runner = Arc::new(ScriptedRunner::completing(vec![]).with_init(Behavior::Fail));
    let orch = orchestrator(Arc::clone(&runner) as Arc<dyn SessionRunner>).await;
    let project = create_project(&orch, "failing", EpicTestingMode::Strict).await;

    let mut subscription = orch.subscribe(project.id).await.expect("subscribe");
    let session = orch
        .initialize(project.id, InitializeOptions::default())
        .await
        .expect("initialize");
    wait_until_idle(&orch, &project).await;

    let session_row = orch.get_session(session.id).await.expect("session");
    assert_eq!(session_row.status, SessionStatus::Failed);
    assert_eq!(session_row.failure_reason.as_deref(), Some("runner_failed"));
    assert!(!orch.store().project(project.id).await.expect("fetch").initialized);

    let events = collect_until_terminal(&mut subscription).await;
    assert!(matches!(
        events.last(),
        Some(ProjectEvent::SessionError { code, .. }) if code == "runner_failed"
    ));
}
