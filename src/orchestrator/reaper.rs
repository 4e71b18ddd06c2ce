//! Stale-session reclamation.
//!
//! Runs as a background Tokio task on a fixed cadence. A session in
//! `created`/`running` whose heartbeat has aged past its type-aware
//! threshold (initializer: 2 h, coding: 20 min by default) is abandoned:
//! the process driving it died or stopped observing events. The reaper
//! marks it failed with reason `stale`, broadcasts a terminal event, and
//! releases any registry entry still pointing at it. Sessions the registry
//! still holds a live handle for are left alone; their scheduler stamps
//! heartbeats as it observes events.

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::events::ProjectEvent;
use crate::store::{SessionPatch, SessionStatus, StoreError};

use super::Orchestrator;

/// Run the reaper loop until shutdown.
///
/// Ticks every `reaper.interval_secs`. Exits when the shutdown signal is
/// received or the watch channel closes.
pub(crate) async fn run_reaper(orch: Orchestrator, mut shutdown_rx: watch::Receiver<bool>) {
    let interval_secs = orch.config.reaper.interval_secs;
    info!(interval_secs, "reaper started");

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = sweep(&orch).await {
                    warn!(error = %e, "reaper sweep failed");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("reaper shutting down");
                    break;
                }
            }
        }
    }

    info!("reaper stopped");
}

/// One sweep: fail every abandoned session. Returns how many were reaped.
pub(crate) async fn sweep(orch: &Orchestrator) -> Result<u64, StoreError> {
    let now = Utc::now();
    let init_cutoff = cutoff(now, orch.config.reaper.init_stale_after_secs);
    let coding_cutoff = cutoff(now, orch.config.reaper.coding_stale_after_secs);

    let stale = orch.store.stale_sessions(init_cutoff, coding_cutoff).await?;
    let mut reaped: u64 = 0;

    for session in stale {
        // A live handle means this process is still driving the session;
        // its scheduler owns the heartbeat.
        if orch.registry.holds_session(session.id).await {
            continue;
        }

        let patch = SessionPatch {
            status: Some(SessionStatus::Failed),
            ended_at: Some(now),
            failure_reason: Some("stale".to_owned()),
            ..SessionPatch::default()
        };
        if let Err(e) = orch.store.update_session(session.id, patch).await {
            warn!(session_id = %session.id, error = %e, "cannot mark stale session failed");
            continue;
        }

        orch.events.publish(
            session.project_id,
            &ProjectEvent::SessionError {
                session_id: session.id,
                code: "stale".to_owned(),
                detail: format!(
                    "no heartbeat since {}; session reclaimed",
                    session.heartbeat_at.to_rfc3339()
                ),
                blocked_epic: None,
            },
        );

        // Clear any stale registry entry left pointing at this session.
        orch.registry
            .release(session.project_id, Some(session.id))
            .await;

        warn!(
            session_id = %session.id,
            project_id = %session.project_id,
            kind = session.kind.as_str(),
            "stale session reclaimed"
        );
        reaped = reaped.saturating_add(1);
    }

    Ok(reaped)
}

/// `now` minus `secs`, clamped on overflow.
fn cutoff(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let delta = i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::zero());
    now.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
