//! Durable state backed by SQLite.
//!
//! The [`Store`] is the single source of truth for projects, roadmaps,
//! sessions, interventions, and checkpoints. All multi-statement logic runs
//! inside a transaction, and every invariant the orchestrator relies on
//! (task gating, the single-active-session rule, epic completion) is
//! enforced here rather than in the callers.
//!
//! Writers mutating the same project are serialized through an in-process
//! per-project lock; the schema additionally carries a partial unique index
//! so the one-active-session invariant holds even against buggy callers.
//! Transient SQLite errors (busy, locked, I/O) are retried with exponential
//! backoff and jitter under a per-operation deadline.

pub mod project;
pub mod roadmap;
pub mod session;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{DatabaseConfig, GateConfig};
use crate::gate::InvalidMode;

pub use project::{DeletionCounts, NewProject, Project, SandboxType};
pub use roadmap::{
    Epic, EpicStatus, EpicTest, EpicTestOutcome, GateApplication, Intervention, NewEpic,
    NewEpicTest, NewTask, NewTaskTest, NextWork, ProgressSnapshot, RetestRecommendation,
    RoadmapCounts, Task, TaskTest, TaskUnit,
};
pub use session::{
    Checkpoint, CheckpointKind, Session, SessionKind, SessionMetrics, SessionPatch, SessionStatus,
};

/// Base delay for the exponential retry backoff.
const RETRY_BASE_DELAY_MS: u64 = 50;

/// Upper bound on the random jitter added to each retry delay.
const RETRY_JITTER_MS: u64 = 25;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed after exhausting retries.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The requested row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (e.g. "project", "task").
        entity: &'static str,
        /// Identifier that missed.
        id: String,
    },

    /// A project with this name already exists.
    #[error("project already exists: {name}")]
    AlreadyExists {
        /// The conflicting name.
        name: String,
    },

    /// The project name does not match `[a-z0-9_-]+`.
    #[error("invalid project name: {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// A task cannot be marked done while attached tests are not passing.
    #[error("task {task_id} has {} non-passing tests", failing.len())]
    TestsNotPassing {
        /// The gated task.
        task_id: String,
        /// Ids of the non-passing tests.
        failing: Vec<String>,
    },

    /// Another session is already active for this project.
    #[error("project {project_id} already has an active session")]
    SessionConflict {
        /// The contended project.
        project_id: String,
    },

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which column contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// A stored row violates an invariant (bad timestamp, impossible state).
    #[error("inconsistent store state: {detail}")]
    Inconsistent {
        /// What was found.
        detail: String,
    },

    /// The per-operation deadline elapsed before the operation finished.
    #[error("store operation timed out: {op}")]
    Timeout {
        /// Operation name for diagnostics.
        op: &'static str,
    },
}

impl From<InvalidMode> for StoreError {
    fn from(e: InvalidMode) -> Self {
        StoreError::InvalidEnum {
            field: "epic_testing_mode",
            value: e.0,
        }
    }
}

impl StoreError {
    /// Returns `true` for the transient error class worth retrying.
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Io(_)) => true,
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            StoreError::Database(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6).
                matches!(db.code().as_deref(), Some("5") | Some("6"))
            }
            _ => false,
        }
    }
}

/// Transactional persistence for the orchestrator.
pub struct Store {
    /// Shared SQLite pool.
    pool: SqlitePool,
    /// Per-project write locks, created on first use.
    project_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Retry and deadline tuning.
    db_config: DatabaseConfig,
    /// Completion-gate policy applied inside gating transactions.
    gate_config: GateConfig,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db_config", &self.db_config)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database at the given path and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be applied.
    pub async fn open(
        path: &Path,
        db_config: DatabaseConfig,
        gate_config: GateConfig,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Inconsistent {
                detail: format!("cannot create data directory {}: {e}", parent.display()),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(db_config.pool_max)
            .min_connections(db_config.pool_idle)
            .connect_with(options)
            .await?;

        Self::from_pool(pool, db_config, gate_config).await
    }

    /// Open an in-memory database, used by tests.
    ///
    /// The pool is pinned to a single connection because each SQLite
    /// in-memory connection is its own database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn open_in_memory(gate_config: GateConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::from_pool(pool, DatabaseConfig::default(), gate_config).await
    }

    /// Wrap an existing pool and apply the schema migration.
    async fn from_pool(
        pool: SqlitePool,
        db_config: DatabaseConfig,
        gate_config: GateConfig,
    ) -> Result<Self, StoreError> {
        let migration_sql = include_str!("../../migrations/001_schema.sql");
        sqlx::raw_sql(migration_sql).execute(&pool).await?;

        debug!("store schema applied");

        Ok(Self {
            pool,
            project_locks: Mutex::new(HashMap::new()),
            db_config,
            gate_config,
        })
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the gate configuration applied by gating transactions.
    pub fn gate_config(&self) -> &GateConfig {
        &self.gate_config
    }

    /// Returns the write lock for a project, creating it on first use.
    ///
    /// Held only for the duration of individual transactions; serializes
    /// writers mutating the same project.
    pub(crate) async fn project_lock(&self, project_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.project_locks.lock().await;
        Arc::clone(locks.entry(project_id).or_default())
    }

    /// Drop the write lock entry for a deleted project.
    pub(crate) async fn forget_project_lock(&self, project_id: Uuid) {
        let mut locks = self.project_locks.lock().await;
        locks.remove(&project_id);
    }

    /// Run an operation with transient-error retry under the configured
    /// per-operation deadline.
    ///
    /// The closure is re-invoked for each attempt; non-transient errors
    /// propagate immediately.
    pub(crate) async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        f: F,
    ) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let deadline = Duration::from_secs(self.db_config.op_timeout_secs);
        let attempts = self.db_config.retry_attempts.max(1);

        let run = async {
            let mut attempt: u32 = 0;
            loop {
                match f().await {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_transient() && attempt.saturating_add(1) < attempts => {
                        let backoff = RETRY_BASE_DELAY_MS
                            .saturating_mul(1_u64.checked_shl(attempt).unwrap_or(u64::MAX));
                        let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
                        let delay_ms = backoff.saturating_add(jitter);
                        warn!(op, attempt, error = %e, delay_ms, "transient store error, retrying");
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt = attempt.saturating_add(1);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout { op }),
        }
    }
}

/// Current time as the fixed-width RFC 3339 form stored in every
/// timestamp column (millisecond precision, `Z` suffix, lexically
/// ordered).
pub(crate) fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format an arbitrary instant the same way as [`now_ts`].
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp column.
pub(crate) fn parse_ts(field: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Inconsistent {
            detail: format!("unparseable {field} timestamp: {value:?}"),
        })
}

/// Parse an optional stored timestamp column.
pub(crate) fn parse_opt_ts(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|v| parse_ts(field, &v)).transpose()
}
