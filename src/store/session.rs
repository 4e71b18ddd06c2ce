//! Session rows, per-project numbering, heartbeats, and checkpoints.
//!
//! Session numbers are assigned `max(session_number) + 1` inside the
//! insert transaction under the project write lock, so they are strictly
//! increasing and gap-free for successful creations. The partial unique
//! index on active sessions makes a second concurrent `created`/`running`
//! row impossible regardless of what the caller does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::project::{parse_id, SandboxType};
use super::{format_ts, now_ts, parse_opt_ts, parse_ts, Store, StoreError};

/// What a session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Plans the roadmap from the project spec.
    Initializer,
    /// Executes one unit of roadmap work.
    Coding,
}

impl SessionKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializer => "initializer",
            Self::Coding => "coding",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised kind.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "initializer" => Ok(Self::Initializer),
            "coding" => Ok(Self::Coding),
            other => Err(StoreError::InvalidEnum {
                field: "sessions.kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Row exists; the runner has not started.
    Created,
    /// The runner is executing.
    Running,
    /// Terminal: the runner finished successfully.
    Completed,
    /// Terminal: the runner failed, was reaped, or hit a gate block.
    Failed,
    /// Terminal: cancelled by request.
    Cancelled,
}

impl SessionStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::InvalidEnum {
                field: "sessions.status",
                value: other.to_owned(),
            }),
        }
    }

    /// Returns `true` for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Execution metrics reported by the runner at session end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Tool invocations during the session.
    #[serde(default)]
    pub tool_uses: u64,
    /// Input tokens consumed.
    #[serde(default)]
    pub tokens_in: u64,
    /// Output tokens produced.
    #[serde(default)]
    pub tokens_out: u64,
    /// Cost in USD.
    #[serde(default)]
    pub cost_usd: f64,
    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

/// A session row.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Session identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Strictly increasing per-project ordinal.
    pub session_number: i64,
    /// What the session does.
    pub kind: SessionKind,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Model the runner was asked to use.
    pub model: Option<String>,
    /// Sandbox the runner was asked to use.
    pub sandbox_type: SandboxType,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// When the runner started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Last observed liveness signal.
    pub heartbeat_at: DateTime<Utc>,
    /// Stable failure code (`stale`, `cancel_timeout`, ...), if failed.
    pub failure_reason: Option<String>,
    /// Runner-reported metrics, once terminal.
    pub metrics: Option<SessionMetrics>,
}

/// Partial update applied by [`Store::update_session`]; `None` fields keep
/// their current value.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    /// New lifecycle state.
    pub status: Option<SessionStatus>,
    /// Runner start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Stable failure code.
    pub failure_reason: Option<String>,
    /// Runner-reported metrics.
    pub metrics: Option<SessionMetrics>,
}

/// Where a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// A task closed through the gate.
    TaskComplete,
    /// An epic completed.
    EpicComplete,
    /// The gate blocked and an intervention was created.
    Intervention,
}

impl CheckpointKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskComplete => "task_complete",
            Self::EpicComplete => "epic_complete",
            Self::Intervention => "intervention",
        }
    }
}

/// A checkpoint row: an advisory snapshot tied to a session.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    /// Checkpoint identifier.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Where it was taken.
    pub kind: String,
    /// Snapshot payload.
    pub payload: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Raw row tuple from the `sessions` table.
type SessionRow = (
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

fn session_row_into(row: SessionRow) -> Result<Session, StoreError> {
    let (
        id,
        project_id,
        session_number,
        kind,
        status,
        model,
        sandbox_type,
        created_at,
        started_at,
        ended_at,
        heartbeat_at,
        failure_reason,
        metrics,
    ) = row;
    let metrics = metrics
        .as_deref()
        .map(serde_json::from_str::<SessionMetrics>)
        .transpose()
        .map_err(|e| StoreError::Inconsistent {
            detail: format!("unparseable sessions.metrics: {e}"),
        })?;
    Ok(Session {
        id: parse_id("sessions.id", &id)?,
        project_id: parse_id("sessions.project_id", &project_id)?,
        session_number,
        kind: SessionKind::parse(&kind)?,
        status: SessionStatus::parse(&status)?,
        model,
        sandbox_type: SandboxType::parse(&sandbox_type)?,
        created_at: parse_ts("sessions.created_at", &created_at)?,
        started_at: parse_opt_ts("sessions.started_at", started_at)?,
        ended_at: parse_opt_ts("sessions.ended_at", ended_at)?,
        heartbeat_at: parse_ts("sessions.heartbeat_at", &heartbeat_at)?,
        failure_reason,
        metrics,
    })
}

const SESSION_COLUMNS: &str = "id, project_id, session_number, kind, status, model, sandbox_type, \
     created_at, started_at, ended_at, heartbeat_at, failure_reason, metrics";

impl Store {
    /// Create a session row in `created` status with the next per-project
    /// number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionConflict`] when the project already
    /// has a non-terminal session, and [`StoreError::NotFound`] when the
    /// project does not exist.
    pub async fn record_session(
        &self,
        project_id: Uuid,
        kind: SessionKind,
        model: Option<&str>,
    ) -> Result<Session, StoreError> {
        let project = self.project(project_id).await?;

        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        self.with_retry("record_session", || async move {
            let mut tx = self.pool.begin().await?;
            let pid = project_id.to_string();

            let (max_number,): (i64,) = sqlx::query_as(
                "SELECT coalesce(max(session_number), 0) FROM sessions WHERE project_id = ?1",
            )
            .bind(&pid)
            .fetch_one(&mut *tx)
            .await?;
            let number = max_number.saturating_add(1);

            let id = Uuid::new_v4();
            let now = now_ts();
            let result = sqlx::query(
                "INSERT INTO sessions (id, project_id, session_number, kind, status, model, \
                                       sandbox_type, created_at, heartbeat_at) \
                 VALUES (?1, ?2, ?3, ?4, 'created', ?5, ?6, ?7, ?7)",
            )
            .bind(id.to_string())
            .bind(&pid)
            .bind(number)
            .bind(kind.as_str())
            .bind(model)
            .bind(project.sandbox_type.as_str())
            .bind(&now)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    return Err(StoreError::SessionConflict { project_id: pid });
                }
                Err(e) => return Err(e.into()),
            }

            tx.commit().await?;
            info!(session_id = %id, project_id = %project_id, number, kind = kind.as_str(), "session recorded");
            self.session(id).await
        })
        .await
    }

    /// Apply a partial update to a session; `None` fields are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the session does not exist.
    pub async fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> Result<Session, StoreError> {
        let metrics_json = patch
            .metrics
            .map(|m| {
                serde_json::to_string(&m).map_err(|e| StoreError::Inconsistent {
                    detail: format!("cannot serialize session metrics: {e}"),
                })
            })
            .transpose()?;

        let updated = sqlx::query(
            "UPDATE sessions SET \
                status = COALESCE(?2, status), \
                started_at = COALESCE(?3, started_at), \
                ended_at = COALESCE(?4, ended_at), \
                failure_reason = COALESCE(?5, failure_reason), \
                metrics = COALESCE(?6, metrics) \
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.started_at.map(format_ts))
        .bind(patch.ended_at.map(format_ts))
        .bind(&patch.failure_reason)
        .bind(&metrics_json)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }

        self.session(id).await
    }

    /// Stamp a session's heartbeat with the current time.
    ///
    /// Called on every observed runner event and on scheduler progress
    /// ticks; the reaper compares this against the type-aware thresholds.
    pub async fn touch_session_heartbeat(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET heartbeat_at = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch a session by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the session does not exist.
    pub async fn session(&self, id: Uuid) -> Result<Session, StoreError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => session_row_into(row),
            None => Err(StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            }),
        }
    }

    /// List a project's sessions, newest first.
    pub async fn sessions(&self, project_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE project_id = ?1 \
             ORDER BY session_number DESC"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(session_row_into).collect()
    }

    /// The project's non-terminal session, if any.
    pub async fn active_session(&self, project_id: Uuid) -> Result<Option<Session>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE project_id = ?1 AND status IN ('created', 'running') LIMIT 1"
        );
        let row: Option<SessionRow> = sqlx::query_as(&query)
            .bind(project_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(session_row_into).transpose()
    }

    /// Sessions in `created`/`running` whose heartbeat predates the
    /// type-specific cutoff.
    pub async fn stale_sessions(
        &self,
        init_cutoff: DateTime<Utc>,
        coding_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE status IN ('created', 'running') \
               AND ((kind = 'initializer' AND heartbeat_at < ?1) \
                 OR (kind = 'coding' AND heartbeat_at < ?2)) \
             ORDER BY heartbeat_at ASC"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&query)
            .bind(format_ts(init_cutoff))
            .bind(format_ts(coding_cutoff))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(session_row_into).collect()
    }

    /// Record an advisory checkpoint for a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the session does not exist.
    pub async fn record_checkpoint(
        &self,
        session_id: Uuid,
        kind: CheckpointKind,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.session(session_id).await?;

        sqlx::query(
            "INSERT INTO checkpoints (id, session_id, kind, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id.to_string())
        .bind(kind.as_str())
        .bind(payload.to_string())
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        debug!(session_id = %session_id, kind = kind.as_str(), "checkpoint recorded");
        Ok(())
    }

    /// List a session's checkpoints, oldest first.
    pub async fn checkpoints(&self, session_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, session_id, kind, payload, created_at FROM checkpoints \
             WHERE session_id = ?1 ORDER BY created_at ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, session_id, kind, payload, created_at)| {
                Ok(Checkpoint {
                    id: parse_id("checkpoints.id", &id)?,
                    session_id: parse_id("checkpoints.session_id", &session_id)?,
                    kind,
                    payload: serde_json::from_str(&payload).map_err(|e| {
                        StoreError::Inconsistent {
                            detail: format!("unparseable checkpoints.payload: {e}"),
                        }
                    })?,
                    created_at: parse_ts("checkpoints.created_at", &created_at)?,
                })
            })
            .collect()
    }
}
