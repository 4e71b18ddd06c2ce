//! Tests for next-work ordering, task gating, and the epic gate.

use foreman::config::GateConfig;
use foreman::gate::{BlockReason, EpicGateOutcome, EpicTestingMode};
use foreman::store::{
    Epic, EpicStatus, EpicTest, EpicTestOutcome, NewEpic, NewEpicTest, NewProject, NewTask,
    NewTaskTest, NextWork, Project, SandboxType, Store, StoreError, Task, TaskTest,
};

async fn open_store() -> Store {
    Store::open_in_memory(GateConfig::default())
        .await
        .expect("in-memory store")
}

async fn create_project(store: &Store, name: &str, mode: EpicTestingMode) -> Project {
    store
        .create_project(NewProject {
            name: name.to_owned(),
            spec: "spec".to_owned(),
            epic_testing_mode: mode,
            sandbox_type: SandboxType::Local,
            initializer_model: None,
            coding_model: None,
        })
        .await
        .expect("create project")
}

async fn add_epic(store: &Store, project: &Project, name: &str, priority: i64) -> Epic {
    store
        .insert_epic(
            project.id,
            NewEpic {
                name: name.to_owned(),
                description: String::new(),
                priority,
            },
        )
        .await
        .expect("insert epic")
}

async fn add_task(store: &Store, epic: &Epic, action: &str, priority: i64) -> Task {
    store
        .insert_task(
            epic.id,
            NewTask {
                action: action.to_owned(),
                description: String::new(),
                priority,
            },
        )
        .await
        .expect("insert task")
}

async fn add_test(store: &Store, task: &Task) -> TaskTest {
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
        .expect("insert test")
}

async fn add_epic_test(store: &Store, epic: &Epic, name: &str) -> EpicTest {
    store
        .insert_epic_test(
            epic.id,
            NewEpicTest {
                name: name.to_owned(),
                description: String::new(),
                depends_on_tasks: vec![],
            },
        )
        .await
        .expect("insert epic test")
}

/// Pass every test on the task, then close it.
async fn finish_task(store: &Store, task: &Task) {
    for test in store.tests_for_task(task.id).await.expect("tests") {
        store
            .update_test_result(test.id, true, None, None, Some(5))
            .await
            .expect("pass test");
    }
    store
        .mark_task_done(task.id, None)
        .await
        .expect("mark done");
}

#[tokio::test]
async fn test_next_work_orders_by_epic_then_task_priority() {
    let store = open_store().await;
    let project = create_project(&store, "ordering", EpicTestingMode::Strict).await;

    let later_epic = add_epic(&store, &project, "later", 2).await;
    let first_epic = add_epic(&store, &project, "first", 1).await;
    add_task(&store, &later_epic, "later work", 1).await;
    let second_task = add_task(&store, &first_epic, "second", 5).await;
    let first_task = add_task(&store, &first_epic, "first", 1).await;

    match store.next_work(project.id).await.expect("next") {
        Some(NextWork::Task(unit)) => {
            assert_eq!(unit.task.id, first_task.id);
            assert_eq!(unit.epic.id, first_epic.id);
        }
        other => panic!("expected first task, got {other:?}"),
    }

    finish_task(&store, &first_task).await;
    match store.next_work(project.id).await.expect("next") {
        Some(NextWork::Task(unit)) => assert_eq!(unit.task.id, second_task.id),
        other => panic!("expected second task, got {other:?}"),
    }
}

#[tokio::test]
async fn test_epic_test_verification_outranks_pending_tasks() {
    let store = open_store().await;
    let project = create_project(&store, "verify_first", EpicTestingMode::Strict).await;

    let done_epic = add_epic(&store, &project, "finished tasks", 1).await;
    let task = add_task(&store, &done_epic, "only task", 1).await;
    add_epic_test(&store, &done_epic, "integration").await;

    let pending_epic = add_epic(&store, &project, "pending", 2).await;
    add_task(&store, &pending_epic, "todo", 1).await;

    finish_task(&store, &task).await;

    match store.next_work(project.id).await.expect("next") {
        Some(NextWork::EpicTestRequired(epic)) => assert_eq!(epic.id, done_epic.id),
        other => panic!("expected epic verification, got {other:?}"),
    }
}

#[tokio::test]
async fn test_zero_task_epic_requires_verification_immediately() {
    // An epic with no tasks and unpassed epic-tests has its task set
    // vacuously done, so verification is the first unit of work ever
    // dispatched for it.
    let store = open_store().await;
    let project = create_project(&store, "bare_epic", EpicTestingMode::Strict).await;

    let epic = add_epic(&store, &project, "smoke checks", 1).await;
    let first = add_epic_test(&store, &epic, "boots").await;
    let second = add_epic_test(&store, &epic, "responds").await;

    match store.next_work(project.id).await.expect("next") {
        Some(NextWork::EpicTestRequired(selected)) => assert_eq!(selected.id, epic.id),
        other => panic!("expected immediate verification, got {other:?}"),
    }

    // Dispatch stamps the epic in progress; it must not sit in pending
    // while its tests are being run.
    store
        .mark_epic_in_progress(epic.id)
        .await
        .expect("mark in progress");
    assert_eq!(
        store.epic(epic.id).await.expect("fetch").status,
        EpicStatus::InProgress
    );

    let gate = store
        .update_epic_test_result(first.id, EpicTestOutcome::Passed, None, None)
        .await
        .expect("pass")
        .expect("gate ran");
    assert_eq!(gate.outcome, EpicGateOutcome::InProgress);

    let gate = store
        .update_epic_test_result(second.id, EpicTestOutcome::Passed, None, None)
        .await
        .expect("pass")
        .expect("gate ran");
    assert_eq!(gate.outcome, EpicGateOutcome::Completed);

    let epic_row = store.epic(epic.id).await.expect("fetch");
    assert_eq!(epic_row.status, EpicStatus::Completed);
    assert!(store.next_work(project.id).await.expect("next").is_none());
}

#[tokio::test]
async fn test_next_work_none_when_roadmap_exhausted() {
    let store = open_store().await;
    let project = create_project(&store, "exhausted", EpicTestingMode::Strict).await;

    let epic = add_epic(&store, &project, "only", 1).await;
    let task = add_task(&store, &epic, "work", 1).await;
    finish_task(&store, &task).await;

    assert!(store.next_work(project.id).await.expect("next").is_none());
}

#[tokio::test]
async fn test_task_gate_refuses_then_allows() {
    // Seed scenario: one epic, one task, one unset functional test.
    let store = open_store().await;
    let project = create_project(&store, "p1", EpicTestingMode::Strict).await;
    let epic = add_epic(&store, &project, "e1", 1).await;
    let task = add_task(&store, &epic, "t1", 1).await;
    let test = add_test(&store, &task).await;

    match store.mark_task_done(task.id, None).await {
        Err(StoreError::TestsNotPassing { failing, .. }) => {
            assert_eq!(failing, vec![test.id.to_string()]);
        }
        other => panic!("expected TestsNotPassing, got {other:?}"),
    }
    let task_row = store.task(task.id).await.expect("fetch");
    assert!(!task_row.done, "gate refusal must not close the task");

    store
        .update_test_result(test.id, true, Some("all good"), None, Some(12))
        .await
        .expect("pass test");
    store.mark_task_done(task.id, None).await.expect("retry");

    let task_row = store.task(task.id).await.expect("fetch");
    assert!(task_row.done);
    assert!(task_row.completed_at.is_some());
}

#[tokio::test]
async fn test_mark_done_twice_is_noop() {
    let store = open_store().await;
    let project = create_project(&store, "twice", EpicTestingMode::Strict).await;
    let epic = add_epic(&store, &project, "e", 1).await;
    let task = add_task(&store, &epic, "t", 1).await;

    let first = store.mark_task_done(task.id, None).await.expect("first");
    assert!(first.is_some(), "last task closes the epic gate");
    let second = store.mark_task_done(task.id, None).await.expect("second");
    assert!(second.is_none());
}

#[tokio::test]
async fn test_test_result_bumps_retry_count_and_verified_at() {
    let store = open_store().await;
    let project = create_project(&store, "retries", EpicTestingMode::Strict).await;
    let epic = add_epic(&store, &project, "e", 1).await;
    let task = add_task(&store, &epic, "t", 1).await;
    let test = add_test(&store, &task).await;

    let after_fail = store
        .update_test_result(test.id, false, None, Some("assertion failed"), Some(30))
        .await
        .expect("fail");
    assert_eq!(after_fail.retry_count, 1);
    assert!(!after_fail.passes);
    assert!(after_fail.verified_at.is_none());
    assert_eq!(after_fail.last_result.as_deref(), Some("assertion failed"));

    let after_pass = store
        .update_test_result(test.id, true, Some("fixed"), None, Some(25))
        .await
        .expect("pass");
    assert_eq!(after_pass.retry_count, 1, "pass must not bump retries");
    assert!(after_pass.passes);
    assert!(after_pass.verified_at.is_some());
}

#[tokio::test]
async fn test_strict_mode_blocks_and_creates_intervention() {
    // Strict project; one failed epic-test blocks the epic once tasks close.
    let store = open_store().await;
    let project = create_project(&store, "p2", EpicTestingMode::Strict).await;
    let epic = add_epic(&store, &project, "e1", 1).await;
    let tasks = [
        add_task(&store, &epic, "t1", 1).await,
        add_task(&store, &epic, "t2", 2).await,
        add_task(&store, &epic, "t3", 3).await,
    ];
    let passed = add_epic_test(&store, &epic, "et1").await;
    let failed = add_epic_test(&store, &epic, "et2").await;

    store
        .update_epic_test_result(passed.id, EpicTestOutcome::Passed, None, None)
        .await
        .expect("record pass");
    store
        .update_epic_test_result(failed.id, EpicTestOutcome::Failed, Some("boom"), None)
        .await
        .expect("record failure");

    for task in &tasks[..2] {
        finish_task(&store, task).await;
    }
    // Closing the last task fires the gate.
    let gate = store
        .mark_task_done(tasks[2].id, None)
        .await
        .expect("mark done")
        .expect("gate ran");

    match &gate.outcome {
        EpicGateOutcome::Blocked { failing_ids, reason } => {
            assert_eq!(*reason, BlockReason::StrictMode);
            assert_eq!(failing_ids, &vec![failed.id.to_string()]);
        }
        other => panic!("expected blocked, got {other:?}"),
    }
    assert!(gate.intervention_id.is_some());

    let epic_row = store.epic(epic.id).await.expect("fetch");
    assert_eq!(epic_row.status, EpicStatus::Blocked);

    let interventions = store.open_interventions(project.id).await.expect("list");
    assert_eq!(interventions.len(), 1);
    assert_eq!(interventions[0].epic_id, epic.id);
    assert_eq!(interventions[0].failing_count, 1);
    assert_eq!(interventions[0].failing_test_ids, vec![failed.id]);

    // The blocked epic is still what the queue selects next.
    match store.next_work(project.id).await.expect("next") {
        Some(NextWork::EpicTestRequired(selected)) => assert_eq!(selected.id, epic.id),
        other => panic!("expected the blocked epic again, got {other:?}"),
    }
}

#[tokio::test]
async fn test_autonomous_mode_tolerates_then_blocks() {
    // Tolerance is 3: two failures pass through, a fourth blocks.
    let store = open_store().await;
    let project = create_project(&store, "p3", EpicTestingMode::Autonomous).await;
    let epic = add_epic(&store, &project, "reporting", 1).await;
    let task = add_task(&store, &epic, "t", 1).await;

    let mut epic_tests = Vec::new();
    for i in 0..5 {
        epic_tests.push(add_epic_test(&store, &epic, &format!("et{i}")).await);
    }
    finish_task(&store, &task).await;

    for et in &epic_tests[..3] {
        store
            .update_epic_test_result(et.id, EpicTestOutcome::Passed, None, None)
            .await
            .expect("pass");
    }
    for et in &epic_tests[3..] {
        let gate = store
            .update_epic_test_result(et.id, EpicTestOutcome::Failed, Some("flaky"), None)
            .await
            .expect("fail")
            .expect("gate ran");
        assert_eq!(
            gate.outcome,
            EpicGateOutcome::InProgress,
            "2 failures are within tolerance"
        );
    }
    assert_eq!(
        store.epic(epic.id).await.expect("fetch").status,
        EpicStatus::InProgress
    );
    assert!(store
        .open_interventions(project.id)
        .await
        .expect("list")
        .is_empty());

    // Push the failure count past the tolerance.
    for et in &epic_tests[..2] {
        store
            .update_epic_test_result(et.id, EpicTestOutcome::Failed, Some("regressed"), None)
            .await
            .expect("fail");
    }
    let gate = store
        .update_epic_test_result(epic_tests[2].id, EpicTestOutcome::Failed, None, None)
        .await
        .expect("fail")
        .expect("gate ran");
    assert!(matches!(
        gate.outcome,
        EpicGateOutcome::Blocked {
            reason: BlockReason::ToleranceExceeded,
            ..
        }
    ));
    assert_eq!(
        store.epic(epic.id).await.expect("fetch").status,
        EpicStatus::Blocked
    );
}

#[tokio::test]
async fn test_autonomous_mode_blocks_critical_epic_immediately() {
    let store = open_store().await;
    let project = create_project(&store, "critical", EpicTestingMode::Autonomous).await;
    let epic = add_epic(&store, &project, "Database Migrations", 1).await;
    let task = add_task(&store, &epic, "t", 1).await;
    let et = add_epic_test(&store, &epic, "migration check").await;

    finish_task(&store, &task).await;
    let gate = store
        .update_epic_test_result(et.id, EpicTestOutcome::Failed, None, None)
        .await
        .expect("fail")
        .expect("gate ran");

    assert!(matches!(
        gate.outcome,
        EpicGateOutcome::Blocked {
            reason: BlockReason::CriticalEpic,
            ..
        }
    ));
}

#[tokio::test]
async fn test_skipped_and_error_results_prevent_completion_without_blocking() {
    let store = open_store().await;
    let project = create_project(&store, "skips", EpicTestingMode::Strict).await;
    let epic = add_epic(&store, &project, "e", 1).await;
    let task = add_task(&store, &epic, "t", 1).await;
    let et1 = add_epic_test(&store, &epic, "et1").await;
    let et2 = add_epic_test(&store, &epic, "et2").await;

    finish_task(&store, &task).await;
    store
        .update_epic_test_result(et1.id, EpicTestOutcome::Passed, None, None)
        .await
        .expect("pass");
    let gate = store
        .update_epic_test_result(et2.id, EpicTestOutcome::Skipped, None, None)
        .await
        .expect("skip")
        .expect("gate ran");

    assert_eq!(gate.outcome, EpicGateOutcome::InProgress);
    assert_eq!(
        store.epic(epic.id).await.expect("fetch").status,
        EpicStatus::InProgress
    );
}

#[tokio::test]
async fn test_epic_completes_when_everything_passes() {
    let store = open_store().await;
    let project = create_project(&store, "completes", EpicTestingMode::Strict).await;
    let epic = add_epic(&store, &project, "e", 1).await;
    let task = add_task(&store, &epic, "t", 1).await;
    let et = add_epic_test(&store, &epic, "et").await;

    finish_task(&store, &task).await;
    let gate = store
        .update_epic_test_result(et.id, EpicTestOutcome::Passed, None, None)
        .await
        .expect("pass")
        .expect("gate ran");

    assert_eq!(gate.outcome, EpicGateOutcome::Completed);
    let epic_row = store.epic(epic.id).await.expect("fetch");
    assert_eq!(epic_row.status, EpicStatus::Completed);
    assert!(epic_row.completed_at.is_some());
}

#[tokio::test]
async fn test_retest_recommendation_on_stride() {
    // Default stride is 2: the second completed epic records a
    // recommendation referencing the most foundational one.
    let store = open_store().await;
    let project = create_project(&store, "stride", EpicTestingMode::Strict).await;

    let first = add_epic(&store, &project, "foundation", 1).await;
    let first_task = add_task(&store, &first, "t", 1).await;
    finish_task(&store, &first_task).await;

    // One completion: not on the stride yet.
    assert!(store
        .retest_recommendations(project.id)
        .await
        .expect("list")
        .is_empty());

    let second = add_epic(&store, &project, "surface", 2).await;
    let second_task = add_task(&store, &second, "t", 1).await;
    finish_task(&store, &second_task).await;

    let recommendations = store
        .retest_recommendations(project.id)
        .await
        .expect("list");
    assert_eq!(recommendations.len(), 1, "second completion crosses the stride");
    assert_eq!(recommendations[0].epic_id, first.id, "references the foundation");

    // Third completion: off-stride, nothing new.
    let third = add_epic(&store, &project, "another", 3).await;
    let third_task = add_task(&store, &third, "t", 1).await;
    finish_task(&store, &third_task).await;
    assert_eq!(
        store
            .retest_recommendations(project.id)
            .await
            .expect("list")
            .len(),
        1
    );
}

#[tokio::test]
async fn test_failure_log_appended_on_epic_test_failure() {
    let store = open_store().await;
    let project = create_project(&store, "faillog", EpicTestingMode::Autonomous).await;
    let epic = add_epic(&store, &project, "e", 1).await;
    add_task(&store, &epic, "t", 1).await;
    let et = add_epic_test(&store, &epic, "et").await;

    store
        .update_epic_test_result(et.id, EpicTestOutcome::Failed, Some("first failure"), None)
        .await
        .expect("fail");
    store
        .update_epic_test_result(et.id, EpicTestOutcome::Failed, Some("second failure"), None)
        .await
        .expect("fail");

    let (count,): (i64,) =
        sqlx::query_as("SELECT count(*) FROM epic_test_failures WHERE epic_test_id = ?1")
            .bind(et.id.to_string())
            .fetch_one(store.pool())
            .await
            .expect("count");
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_resolve_interventions_reopens_epic() {
    let store = open_store().await;
    let project = create_project(&store, "resume", EpicTestingMode::Strict).await;
    let epic = add_epic(&store, &project, "e", 1).await;
    let task = add_task(&store, &epic, "t", 1).await;
    let et = add_epic_test(&store, &epic, "et").await;

    store
        .update_epic_test_result(et.id, EpicTestOutcome::Failed, None, None)
        .await
        .expect("fail");
    finish_task(&store, &task).await;
    assert_eq!(
        store.epic(epic.id).await.expect("fetch").status,
        EpicStatus::Blocked
    );

    let resolved = store
        .resolve_interventions(project.id, epic.id)
        .await
        .expect("resolve");
    assert_eq!(resolved, 1);
    assert_eq!(
        store.epic(epic.id).await.expect("fetch").status,
        EpicStatus::InProgress
    );
    assert!(store
        .open_interventions(project.id)
        .await
        .expect("list")
        .is_empty());

    // Resolving again is a no-op.
    assert_eq!(
        store
            .resolve_interventions(project.id, epic.id)
            .await
            .expect("resolve"),
        0
    );
}

#[tokio::test]
async fn test_progress_snapshot_counts() {
    let store = open_store().await;
    let project = create_project(&store, "progress", EpicTestingMode::Strict).await;
    let epic = add_epic(&store, &project, "e", 1).await;
    let done_task = add_task(&store, &epic, "done", 1).await;
    add_task(&store, &epic, "open", 2).await;
    let test = add_test(&store, &done_task).await;
    let et = add_epic_test(&store, &epic, "et").await;

    store
        .update_test_result(test.id, true, None, None, None)
        .await
        .expect("pass");
    store
        .mark_task_done(done_task.id, None)
        .await
        .expect("done");
    store
        .update_epic_test_result(et.id, EpicTestOutcome::Failed, None, None)
        .await
        .expect("fail");

    let snapshot = store.progress_snapshot(project.id).await.expect("snapshot");
    assert_eq!(snapshot.epics_total, 1);
    assert_eq!(snapshot.epics_completed, 0);
    assert_eq!(snapshot.tasks_total, 2);
    assert_eq!(snapshot.tasks_done, 1);
    assert_eq!(snapshot.tests_total, 1);
    assert_eq!(snapshot.tests_passing, 1);
    assert_eq!(snapshot.epic_tests_total, 1);
    assert_eq!(snapshot.epic_tests_failed, 1);
}

#[tokio::test]
async fn test_purge_roadmap_round_trip() {
    let store = open_store().await;
    let project = create_project(&store, "purge", EpicTestingMode::Strict).await;
    let epic = add_epic(&store, &project, "e", 1).await;
    let task = add_task(&store, &epic, "t", 1).await;
    add_test(&store, &task).await;
    add_epic_test(&store, &epic, "et").await;
    store
        .set_initialized(project.id, true)
        .await
        .expect("initialize");

    let counts = store.purge_roadmap(project.id).await.expect("purge");
    assert_eq!(counts.epics_deleted, 1);
    assert_eq!(counts.tasks_deleted, 1);
    assert_eq!(counts.tests_deleted, 2);

    let project_row = store.project(project.id).await.expect("fetch");
    assert!(!project_row.initialized, "purge clears the flag");
    assert!(store.epics(project.id).await.expect("list").is_empty());
    assert!(store.next_work(project.id).await.expect("next").is_none());
}
