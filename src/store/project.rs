//! Project rows: creation, lookup, initialization flag, cascade deletion.
//!
//! A project exists once its spec has been persisted; the roadmap arrives
//! later through an initializer session. Deleting a project cascades
//! through epics, tasks, tests, sessions, interventions, and checkpoints,
//! returning the removed row counts for response composition.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::gate::EpicTestingMode;

use super::{now_ts, parse_ts, Store, StoreError};

/// Where the agent driver executes a project's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxType {
    /// Containerised execution.
    Docker,
    /// Direct execution on the host.
    Local,
}

impl SandboxType {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Local => "local",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised sandbox type.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            other => Err(StoreError::InvalidEnum {
                field: "sandbox_type",
                value: other.to_owned(),
            }),
        }
    }
}

/// A project row.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    /// Opaque project identifier.
    pub id: Uuid,
    /// Unique project name, `[a-z0-9_-]+`.
    pub name: String,
    /// The persisted specification text.
    pub spec: String,
    /// Whether an initializer session has produced a roadmap.
    pub initialized: bool,
    /// How failing epic-tests are treated at completion time.
    pub epic_testing_mode: EpicTestingMode,
    /// Where sessions for this project execute.
    pub sandbox_type: SandboxType,
    /// Model override for initializer sessions.
    pub initializer_model: Option<String>,
    /// Model override for coding sessions.
    pub coding_model: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Input for [`Store::create_project`].
#[derive(Debug, Clone)]
pub struct NewProject {
    /// Unique project name, `[a-z0-9_-]+`.
    pub name: String,
    /// Specification text; must be non-empty.
    pub spec: String,
    /// Epic-test gating mode.
    pub epic_testing_mode: EpicTestingMode,
    /// Sandbox for this project's sessions.
    pub sandbox_type: SandboxType,
    /// Model override for initializer sessions.
    pub initializer_model: Option<String>,
    /// Model override for coding sessions.
    pub coding_model: Option<String>,
}

/// Rows removed by a cascading project deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeletionCounts {
    /// Epics removed.
    pub epics: u64,
    /// Tasks removed.
    pub tasks: u64,
    /// Task-level and epic-level tests removed.
    pub tests: u64,
    /// Sessions removed.
    pub sessions: u64,
}

/// Compiled project-name rule.
fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-z0-9_-]+$").expect("static pattern compiles"))
}

/// Returns `true` if `name` is a valid project name.
pub fn valid_project_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

/// Raw row tuple from the `projects` table.
type ProjectRow = (
    String,
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

/// Convert a raw `projects` row tuple into a [`Project`].
fn project_row_into(row: ProjectRow) -> Result<Project, StoreError> {
    let (
        id,
        name,
        spec,
        initialized,
        epic_testing_mode,
        sandbox_type,
        initializer_model,
        coding_model,
        created_at,
        updated_at,
    ) = row;
    Ok(Project {
        id: parse_id("projects.id", &id)?,
        name,
        spec,
        initialized: initialized != 0,
        epic_testing_mode: EpicTestingMode::parse(&epic_testing_mode)?,
        sandbox_type: SandboxType::parse(&sandbox_type)?,
        initializer_model,
        coding_model,
        created_at: parse_ts("projects.created_at", &created_at)?,
        updated_at: parse_ts("projects.updated_at", &updated_at)?,
    })
}

/// Parse a stored UUID column.
pub(crate) fn parse_id(field: &'static str, value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| StoreError::Inconsistent {
        detail: format!("unparseable {field} id: {value:?}"),
    })
}

const PROJECT_COLUMNS: &str = "id, name, spec, initialized, epic_testing_mode, sandbox_type, \
     initializer_model, coding_model, created_at, updated_at";

impl Store {
    /// Create a project with a persisted spec.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidName`] when the name breaks the
    /// `[a-z0-9_-]+` rule, [`StoreError::AlreadyExists`] when the name is
    /// taken, and [`StoreError::Inconsistent`] when the spec is empty.
    pub async fn create_project(&self, new: NewProject) -> Result<Project, StoreError> {
        if !valid_project_name(&new.name) {
            return Err(StoreError::InvalidName {
                name: new.name.clone(),
            });
        }
        if new.spec.trim().is_empty() {
            return Err(StoreError::Inconsistent {
                detail: "project spec must be non-empty".to_owned(),
            });
        }

        let id = Uuid::new_v4();
        let now = now_ts();

        let result = sqlx::query(
            "INSERT INTO projects (id, name, spec, initialized, epic_testing_mode, sandbox_type, \
                                   initializer_model, coding_model, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?8)",
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(&new.spec)
        .bind(new.epic_testing_mode.as_str())
        .bind(new.sandbox_type.as_str())
        .bind(&new.initializer_model)
        .bind(&new.coding_model)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(StoreError::AlreadyExists { name: new.name });
            }
            Err(e) => return Err(e.into()),
        }

        info!(project_id = %id, name = %new.name, "project created");
        self.project(id).await
    }

    /// Fetch a project by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the project does not exist.
    pub async fn project(&self, id: Uuid) -> Result<Project, StoreError> {
        let query = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1");
        let row: Option<ProjectRow> = sqlx::query_as(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => project_row_into(row),
            None => Err(StoreError::NotFound {
                entity: "project",
                id: id.to_string(),
            }),
        }
    }

    /// Fetch a project by name.
    pub async fn project_by_name(&self, name: &str) -> Result<Option<Project>, StoreError> {
        let query = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?1");
        let row: Option<ProjectRow> = sqlx::query_as(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(project_row_into).transpose()
    }

    /// List all projects ordered by name.
    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let query = format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name ASC");
        let rows: Vec<ProjectRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;

        rows.into_iter().map(project_row_into).collect()
    }

    /// Flip the `initialized` flag.
    ///
    /// When setting the flag, epics with neither tasks nor epic-tests are
    /// completed in the same transaction so the work queue can never wedge
    /// on them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the project does not exist.
    pub async fn set_initialized(&self, id: Uuid, initialized: bool) -> Result<(), StoreError> {
        let lock = self.project_lock(id).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let now = now_ts();

        let updated = sqlx::query("UPDATE projects SET initialized = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(i64::from(initialized))
            .bind(&now)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "project",
                id: id.to_string(),
            });
        }

        if initialized {
            let swept = sqlx::query(
                "UPDATE epics SET status = 'completed', completed_at = ?1 \
                 WHERE project_id = ?2 AND status != 'completed' \
                   AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.epic_id = epics.id) \
                   AND NOT EXISTS (SELECT 1 FROM epic_tests et WHERE et.epic_id = epics.id)",
            )
            .bind(&now)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            if swept.rows_affected() > 0 {
                debug!(project_id = %id, count = swept.rows_affected(), "completed vacuous epics");
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a project and everything it owns.
    ///
    /// Returns the removed row counts. The caller is responsible for
    /// ensuring no session is active; the store only guarantees the
    /// cascade is atomic.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the project does not exist.
    pub async fn delete_project(&self, id: Uuid) -> Result<DeletionCounts, StoreError> {
        let lock = self.project_lock(id).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let pid = id.to_string();

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM projects WHERE id = ?1")
            .bind(&pid)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound {
                entity: "project",
                id: pid,
            });
        }

        let epics = count(&mut tx, "SELECT count(*) FROM epics WHERE project_id = ?1", &pid).await?;
        let tasks = count(&mut tx, "SELECT count(*) FROM tasks WHERE project_id = ?1", &pid).await?;
        let task_tests = count(
            &mut tx,
            "SELECT count(*) FROM tests WHERE task_id IN (SELECT id FROM tasks WHERE project_id = ?1)",
            &pid,
        )
        .await?;
        let epic_tests = count(
            &mut tx,
            "SELECT count(*) FROM epic_tests WHERE epic_id IN (SELECT id FROM epics WHERE project_id = ?1)",
            &pid,
        )
        .await?;
        let sessions = count(
            &mut tx,
            "SELECT count(*) FROM sessions WHERE project_id = ?1",
            &pid,
        )
        .await?;

        sqlx::query("DELETE FROM projects WHERE id = ?1")
            .bind(&pid)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.forget_project_lock(id).await;

        let counts = DeletionCounts {
            epics,
            tasks,
            tests: task_tests.saturating_add(epic_tests),
            sessions,
        };
        info!(project_id = %id, ?counts, "project deleted");
        Ok(counts)
    }
}

/// Run a single-bind `count(*)` query inside a transaction.
async fn count(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    query: &str,
    bind: &str,
) -> Result<u64, StoreError> {
    let row: (i64,) = sqlx::query_as(query).bind(bind).fetch_one(&mut **tx).await?;
    Ok(row.0.cast_unsigned())
}
