//! Tests for stale-session reclamation.

use std::sync::Arc;

use chrono::{SecondsFormat, TimeDelta, Utc};
use foreman::events::ProjectEvent;
use foreman::gate::EpicTestingMode;
use foreman::orchestrator::Orchestrator;
use foreman::runner::SessionRunner;
use foreman::store::{SessionKind, SessionStatus};
use uuid::Uuid;

use crate::support::{
    create_project, mark_initialized, orchestrator, seed_epic, wait_for_started, wait_until_idle,
    Behavior, ScriptedRunner,
};

/// Backdate a session's heartbeat directly in SQLite.
async fn backdate_heartbeat(orch: &Orchestrator, session_id: Uuid, minutes: i64) {
    let delta = TimeDelta::try_minutes(minutes).expect("delta");
    let ts = Utc::now()
        .checked_sub_signed(delta)
        .expect("in range")
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    sqlx::query("UPDATE sessions SET heartbeat_at = ?1 WHERE id = ?2")
        .bind(ts)
        .bind(session_id.to_string())
        .execute(orch.store().pool())
        .await
        .expect("backdate");
}

#[tokio::test]
async fn test_reaper_fails_abandoned_coding_session() {
    // A coding session 25 minutes past its heartbeat with no live handle:
    // reclaimed at the 20-minute bar.
    let runner = Arc::new(ScriptedRunner::completing(vec![]));
    let orch = orchestrator(runner).await;
    let project = create_project(&orch, "abandoned", EpicTestingMode::Strict).await;

    let session = orch
        .store()
        .record_session(project.id, SessionKind::Coding, None)
        .await
        .expect("record");
    backdate_heartbeat(&orch, session.id, 25).await;

    let mut subscription = orch.subscribe(project.id).await.expect("subscribe");
    let reaped = orch.reap_stale_sessions().await.expect("sweep");
    assert_eq!(reaped, 1);

    let session_row = orch.get_session(session.id).await.expect("session");
    assert_eq!(session_row.status, SessionStatus::Failed);
    assert_eq!(session_row.failure_reason.as_deref(), Some("stale"));
    assert!(session_row.ended_at.is_some());

    match subscription.recv().await {
        Some(ProjectEvent::SessionError { session_id, code, .. }) => {
            assert_eq!(session_id, session.id);
            assert_eq!(code, "stale");
        }
        other => panic!("expected stale SessionError, got {other:?}"),
    }

    // The slot is free again.
    orch.store()
        .record_session(project.id, SessionKind::Coding, None)
        .await
        .expect("slot freed");
}

#[tokio::test]
async fn test_reaper_thresholds_are_type_aware() {
    let runner = Arc::new(ScriptedRunner::completing(vec![]));
    let orch = orchestrator(runner).await;

    // An initializer idle 25 minutes is fine (2-hour bar).
    let init_project = create_project(&orch, "init_fresh", EpicTestingMode::Strict).await;
    let init_session = orch
        .store()
        .record_session(init_project.id, SessionKind::Initializer, None)
        .await
        .expect("record");
    backdate_heartbeat(&orch, init_session.id, 25).await;

    // An initializer idle 3 hours is stale.
    let old_project = create_project(&orch, "init_old", EpicTestingMode::Strict).await;
    let old_session = orch
        .store()
        .record_session(old_project.id, SessionKind::Initializer, None)
        .await
        .expect("record");
    backdate_heartbeat(&orch, old_session.id, 180).await;

    // A coding session idle 5 minutes is fine (20-minute bar).
    let fresh_project = create_project(&orch, "coding_fresh", EpicTestingMode::Strict).await;
    let fresh_session = orch
        .store()
        .record_session(fresh_project.id, SessionKind::Coding, None)
        .await
        .expect("record");
    backdate_heartbeat(&orch, fresh_session.id, 5).await;

    let reaped = orch.reap_stale_sessions().await.expect("sweep");
    assert_eq!(reaped, 1);

    assert_eq!(
        orch.get_session(init_session.id).await.expect("fetch").status,
        SessionStatus::Created
    );
    assert_eq!(
        orch.get_session(old_session.id).await.expect("fetch").status,
        SessionStatus::Failed
    );
    assert_eq!(
        orch.get_session(fresh_session.id).await.expect("fetch").status,
        SessionStatus::Created
    );
}

#[tokio::test]
async fn test_reaper_spares_sessions_with_a_live_handle() {
    // The scheduler is still driving this session in-process, so the
    // registry holds a handle and the reaper must leave it alone even
    // though the heartbeat looks ancient.
    let runner =
        Arc::new(ScriptedRunner::completing(vec![]).with_coding(Behavior::HangUntilCancel));
    let orch = orchestrator(Arc::clone(&runner) as Arc<dyn SessionRunner>).await;
    let project = create_project(&orch, "driven", EpicTestingMode::Strict).await;
    seed_epic(&orch, &project, "work", 1, 0).await;
    mark_initialized(&orch, &project).await;

    orch.start_coding(project.id, foreman::orchestrator::StartCodingOptions::default())
        .await
        .expect("start");
    wait_for_started(&runner, 1).await;

    let active = orch
        .store()
        .active_session(project.id)
        .await
        .expect("query")
        .expect("active session");
    backdate_heartbeat(&orch, active.id, 25).await;

    let reaped = orch.reap_stale_sessions().await.expect("sweep");
    assert_eq!(reaped, 0, "a held session is not abandoned");
    assert_eq!(
        orch.get_session(active.id).await.expect("fetch").status,
        SessionStatus::Running
    );

    orch.cancel_session(project.id).await.expect("cancel");
    wait_until_idle(&orch, &project).await;
}

#[tokio::test]
async fn test_reaper_ignores_terminal_sessions() {
    let runner = Arc::new(ScriptedRunner::completing(vec![]));
    let orch = orchestrator(runner).await;
    let project = create_project(&orch, "settled", EpicTestingMode::Strict).await;

    let session = orch
        .store()
        .record_session(project.id, SessionKind::Coding, None)
        .await
        .expect("record");
    orch.store()
        .update_session(
            session.id,
            foreman::store::SessionPatch {
                status: Some(SessionStatus::Completed),
                ended_at: Some(Utc::now()),
                ..foreman::store::SessionPatch::default()
            },
        )
        .await
        .expect("finish");
    backdate_heartbeat(&orch, session.id, 600).await;

    let reaped = orch.reap_stale_sessions().await.expect("sweep");
    assert_eq!(reaped, 0);
    assert_eq!(
        orch.get_session(session.id).await.expect("fetch").status,
        SessionStatus::Completed
    );
}
