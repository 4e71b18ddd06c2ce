//! Tests for session rows: numbering, the single-active invariant,
//! heartbeats, staleness, and checkpoints.

use chrono::{SecondsFormat, TimeDelta, Utc};
use foreman::config::GateConfig;
use foreman::gate::EpicTestingMode;
use foreman::store::{
    CheckpointKind, NewProject, Project, SandboxType, SessionKind, SessionMetrics, SessionPatch,
    SessionStatus, Store, StoreError,
};
use uuid::Uuid;

async fn open_store() -> Store {
    Store::open_in_memory(GateConfig::default())
        .await
        .expect("in-memory store")
}

async fn create_project(store: &Store, name: &str) -> Project {
    store
        .create_project(NewProject {
            name: name.to_owned(),
            spec: "spec".to_owned(),
            epic_testing_mode: EpicTestingMode::Strict,
            sandbox_type: SandboxType::Docker,
            initializer_model: None,
            coding_model: None,
        })
        .await
        .expect("create project")
}

/// A timestamp `minutes` in the past, in the store's column format.
fn minutes_ago(minutes: i64) -> String {
    let delta = TimeDelta::try_minutes(minutes).unwrap_or(TimeDelta::zero());
    Utc::now()
        .checked_sub_signed(delta)
        .expect("in range")
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Backdate a session's heartbeat directly in SQLite.
async fn backdate_heartbeat(store: &Store, session_id: Uuid, minutes: i64) {
    sqlx::query("UPDATE sessions SET heartbeat_at = ?1 WHERE id = ?2")
        .bind(minutes_ago(minutes))
        .bind(session_id.to_string())
        .execute(store.pool())
        .await
        .expect("backdate");
}

#[tokio::test]
async fn test_session_numbers_are_sequential_and_gap_free() {
    let store = open_store().await;
    let project = create_project(&store, "numbered").await;

    for expected in 1..=3_i64 {
        let session = store
            .record_session(project.id, SessionKind::Coding, Some("model-a"))
            .await
            .expect("record");
        assert_eq!(session.session_number, expected);
        assert_eq!(session.status, SessionStatus::Created);
        assert_eq!(session.sandbox_type, SandboxType::Docker);

        store
            .update_session(
                session.id,
                SessionPatch {
                    status: Some(SessionStatus::Completed),
                    ended_at: Some(Utc::now()),
                    ..SessionPatch::default()
                },
            )
            .await
            .expect("finish");
    }

    let sessions = store.sessions(project.id).await.expect("list");
    let numbers: Vec<i64> = sessions.iter().map(|s| s.session_number).collect();
    assert_eq!(numbers, vec![3, 2, 1], "listed newest first");
}

#[tokio::test]
async fn test_single_active_session_per_project() {
    let store = open_store().await;
    let project = create_project(&store, "contended").await;

    let first = store
        .record_session(project.id, SessionKind::Initializer, None)
        .await
        .expect("first");

    match store
        .record_session(project.id, SessionKind::Coding, None)
        .await
    {
        Err(StoreError::SessionConflict { .. }) => {}
        other => panic!("expected SessionConflict, got {other:?}"),
    }

    // A different project is unaffected.
    let other_project = create_project(&store, "free").await;
    store
        .record_session(other_project.id, SessionKind::Coding, None)
        .await
        .expect("other project unaffected");

    // Finishing the first frees the slot.
    store
        .update_session(
            first.id,
            SessionPatch {
                status: Some(SessionStatus::Failed),
                ended_at: Some(Utc::now()),
                failure_reason: Some("runner_failed".to_owned()),
                ..SessionPatch::default()
            },
        )
        .await
        .expect("finish");
    store
        .record_session(project.id, SessionKind::Coding, None)
        .await
        .expect("slot freed");
}

#[tokio::test]
async fn test_update_session_patch_semantics() {
    let store = open_store().await;
    let project = create_project(&store, "patched").await;
    let session = store
        .record_session(project.id, SessionKind::Coding, Some("model-b"))
        .await
        .expect("record");

    let started = Utc::now();
    let running = store
        .update_session(
            session.id,
            SessionPatch {
                status: Some(SessionStatus::Running),
                started_at: Some(started),
                ..SessionPatch::default()
            },
        )
        .await
        .expect("running");
    assert_eq!(running.status, SessionStatus::Running);
    assert!(running.started_at.is_some());
    assert!(running.ended_at.is_none());
    assert_eq!(running.model.as_deref(), Some("model-b"));

    let metrics = SessionMetrics {
        tool_uses: 12,
        tokens_in: 1000,
        tokens_out: 2000,
        cost_usd: 0.42,
        duration_ms: 90_000,
    };
    let finished = store
        .update_session(
            session.id,
            SessionPatch {
                status: Some(SessionStatus::Completed),
                ended_at: Some(Utc::now()),
                metrics: Some(metrics),
                ..SessionPatch::default()
            },
        )
        .await
        .expect("finish");
    assert_eq!(finished.status, SessionStatus::Completed);
    assert!(finished.started_at.is_some(), "patch keeps untouched fields");
    assert_eq!(finished.metrics, Some(metrics));
}

#[tokio::test]
async fn test_update_missing_session_is_not_found() {
    let store = open_store().await;
    assert!(matches!(
        store
            .update_session(Uuid::new_v4(), SessionPatch::default())
            .await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_active_session_lookup() {
    let store = open_store().await;
    let project = create_project(&store, "active").await;
    assert!(store
        .active_session(project.id)
        .await
        .expect("query")
        .is_none());

    let session = store
        .record_session(project.id, SessionKind::Coding, None)
        .await
        .expect("record");
    let active = store
        .active_session(project.id)
        .await
        .expect("query")
        .expect("present");
    assert_eq!(active.id, session.id);
}

#[tokio::test]
async fn test_heartbeat_touch_advances() {
    let store = open_store().await;
    let project = create_project(&store, "beating").await;
    let session = store
        .record_session(project.id, SessionKind::Coding, None)
        .await
        .expect("record");

    backdate_heartbeat(&store, session.id, 10).await;
    let before = store.session(session.id).await.expect("fetch").heartbeat_at;

    store
        .touch_session_heartbeat(session.id)
        .await
        .expect("touch");
    let after = store.session(session.id).await.expect("fetch").heartbeat_at;
    assert!(after > before);
}

#[tokio::test]
async fn test_stale_listing_is_type_aware() {
    let store = open_store().await;
    let project_a = create_project(&store, "stale_a").await;
    let project_b = create_project(&store, "stale_b").await;
    let project_c = create_project(&store, "stale_c").await;

    // A coding session idle for 25 minutes: stale at the 20-minute bar.
    let stale_coding = store
        .record_session(project_a.id, SessionKind::Coding, None)
        .await
        .expect("record");
    backdate_heartbeat(&store, stale_coding.id, 25).await;

    // An initializer idle for 25 minutes: fine at the 2-hour bar.
    let fresh_init = store
        .record_session(project_b.id, SessionKind::Initializer, None)
        .await
        .expect("record");
    backdate_heartbeat(&store, fresh_init.id, 25).await;

    // A terminal session never shows up, however old.
    let finished = store
        .record_session(project_c.id, SessionKind::Coding, None)
        .await
        .expect("record");
    store
        .update_session(
            finished.id,
            SessionPatch {
                status: Some(SessionStatus::Completed),
                ended_at: Some(Utc::now()),
                ..SessionPatch::default()
            },
        )
        .await
        .expect("finish");
    backdate_heartbeat(&store, finished.id, 600).await;

    let init_cutoff = Utc::now()
        .checked_sub_signed(TimeDelta::try_hours(2).expect("delta"))
        .expect("in range");
    let coding_cutoff = Utc::now()
        .checked_sub_signed(TimeDelta::try_minutes(20).expect("delta"))
        .expect("in range");

    let stale = store
        .stale_sessions(init_cutoff, coding_cutoff)
        .await
        .expect("list");
    let ids: Vec<Uuid> = stale.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![stale_coding.id]);
}

#[tokio::test]
async fn test_checkpoints_round_trip() {
    let store = open_store().await;
    let project = create_project(&store, "checkpointed").await;
    let session = store
        .record_session(project.id, SessionKind::Coding, None)
        .await
        .expect("record");

    store
        .record_checkpoint(
            session.id,
            CheckpointKind::TaskComplete,
            serde_json::json!({"task_id": "t-1"}),
        )
        .await
        .expect("checkpoint");
    store
        .record_checkpoint(
            session.id,
            CheckpointKind::Intervention,
            serde_json::json!({"epic_id": "e-1"}),
        )
        .await
        .expect("checkpoint");

    let checkpoints = store.checkpoints(session.id).await.expect("list");
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].kind, "task_complete");
    assert_eq!(checkpoints[0].payload["task_id"], "t-1");
    assert_eq!(checkpoints[1].kind, "intervention");

    // Checkpoints require an existing session.
    assert!(matches!(
        store
            .record_checkpoint(
                Uuid::new_v4(),
                CheckpointKind::EpicComplete,
                serde_json::json!({}),
            )
            .await,
        Err(StoreError::NotFound { .. })
    ));
}
