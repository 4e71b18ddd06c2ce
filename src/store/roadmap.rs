//! Roadmap rows and the completion protocol.
//!
//! Epics, tasks, task-level tests, and epic-tests form the roadmap tree an
//! initializer session plans. This module owns the ordered "next unit of
//! work" query, the task gate (a task cannot close while any attached test
//! is not passing), and the transactional application of the epic gate:
//! tallying epic-test results, classifying through [`crate::gate`], and
//! writing the resulting status, intervention, and retest recommendation
//! in the same transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gate::{self, EpicGateOutcome, EpicTestTally, EpicTestingMode};

use super::project::parse_id;
use super::{now_ts, parse_opt_ts, parse_ts, Store, StoreError};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Lifecycle state of an epic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    /// No work dispatched yet.
    Pending,
    /// Work has been dispatched; not all gates have passed.
    InProgress,
    /// The completion gate blocked; an intervention is open.
    Blocked,
    /// All tasks done and all epic-tests passed.
    Completed,
}

impl EpicStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            other => Err(StoreError::InvalidEnum {
                field: "epics.status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Outcome of one epic-test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EpicTestOutcome {
    /// The test passed.
    Passed,
    /// The test ran and failed.
    Failed,
    /// The test was skipped.
    Skipped,
    /// The harness errored before a verdict.
    Error,
}

impl EpicTestOutcome {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised outcome.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "error" => Ok(Self::Error),
            other => Err(StoreError::InvalidEnum {
                field: "epic_tests.last_result",
                value: other.to_owned(),
            }),
        }
    }
}

/// An epic row.
#[derive(Debug, Clone, Serialize)]
pub struct Epic {
    /// Epic identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Epic name; also the input to critical-epic matching.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Ordering within the project (lower runs earlier).
    pub priority: i64,
    /// Lifecycle state.
    pub status: EpicStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time, once all gates pass.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task row.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Task identifier.
    pub id: Uuid,
    /// Owning epic.
    pub epic_id: Uuid,
    /// Owning project (denormalised for the ordering query).
    pub project_id: Uuid,
    /// Ordering within the epic.
    pub priority: i64,
    /// What the coding session should do.
    pub action: String,
    /// Free-form description.
    pub description: String,
    /// Whether the task has closed through the gate.
    pub done: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task-level test row. Identity is immutable once created; only the
/// execution metadata changes.
#[derive(Debug, Clone, Serialize)]
pub struct TaskTest {
    /// Test identifier.
    pub id: Uuid,
    /// Owning task.
    pub task_id: Uuid,
    /// Test category (e.g. "functional", "regression").
    pub category: String,
    /// What the test requires.
    pub requirements: String,
    /// What counts as success.
    pub success_criteria: String,
    /// Reproduction steps.
    pub steps: String,
    /// Whether the testing entity has confirmed a pass.
    pub passes: bool,
    /// Free-form detail from the last run.
    pub last_result: Option<String>,
    /// Duration of the last run.
    pub execution_time_ms: Option<i64>,
    /// Number of failed runs recorded.
    pub retry_count: i64,
    /// When the test last passed.
    pub verified_at: Option<DateTime<Utc>>,
}

/// An epic-test row.
#[derive(Debug, Clone, Serialize)]
pub struct EpicTest {
    /// Epic-test identifier.
    pub id: Uuid,
    /// Owning epic.
    pub epic_id: Uuid,
    /// Test name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Outcome of the most recent run, if any.
    pub last_result: Option<EpicTestOutcome>,
    /// Tasks this test depends on (non-ownership references).
    pub depends_on_tasks: Vec<Uuid>,
    /// When the test last ran.
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Input for [`Store::insert_epic`].
#[derive(Debug, Clone)]
pub struct NewEpic {
    /// Epic name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Ordering within the project.
    pub priority: i64,
}

/// Input for [`Store::insert_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    /// What the coding session should do.
    pub action: String,
    /// Free-form description.
    pub description: String,
    /// Ordering within the epic.
    pub priority: i64,
}

/// Input for [`Store::insert_task_test`].
#[derive(Debug, Clone)]
pub struct NewTaskTest {
    /// Test category.
    pub category: String,
    /// What the test requires.
    pub requirements: String,
    /// What counts as success.
    pub success_criteria: String,
    /// Reproduction steps.
    pub steps: String,
}

/// Input for [`Store::insert_epic_test`].
#[derive(Debug, Clone)]
pub struct NewEpicTest {
    /// Test name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Tasks this test depends on.
    pub depends_on_tasks: Vec<Uuid>,
}

/// The next unit of work for a project.
#[derive(Debug, Clone)]
pub enum NextWork {
    /// A pending task, with its epic for context.
    Task(TaskUnit),
    /// An epic whose tasks are all done but whose epic-tests have not all
    /// passed; the next session must run verification.
    EpicTestRequired(Epic),
}

/// A dispatched task together with its epic.
#[derive(Debug, Clone)]
pub struct TaskUnit {
    /// The task to execute.
    pub task: Task,
    /// The epic it belongs to.
    pub epic: Epic,
}

/// Result of applying the epic gate inside a store transaction.
#[derive(Debug, Clone)]
pub struct GateApplication {
    /// The gated epic.
    pub epic_id: Uuid,
    /// The epic's name at gating time.
    pub epic_name: String,
    /// What the gate decided.
    pub outcome: EpicGateOutcome,
    /// Intervention row created when the gate blocked.
    pub intervention_id: Option<Uuid>,
}

/// An intervention row: a blocked epic awaiting external resolution.
#[derive(Debug, Clone, Serialize)]
pub struct Intervention {
    /// Intervention identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// The blocked epic.
    pub epic_id: Uuid,
    /// Session that observed the block, if any.
    pub session_id: Option<Uuid>,
    /// Ids of the failing epic-tests.
    pub failing_test_ids: Vec<Uuid>,
    /// Number of failing epic-tests.
    pub failing_count: u32,
    /// Why the gate blocked.
    pub reason: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Resolution time, once explicitly resumed.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Rows removed by a roadmap purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoadmapCounts {
    /// Epics removed.
    pub epics_deleted: u64,
    /// Tasks removed.
    pub tasks_deleted: u64,
    /// Task-level and epic-level tests removed.
    pub tests_deleted: u64,
}

/// Point-in-time roadmap progress, computed from rows.
///
/// Counters are not strongly consistent with in-flight mutations; they are
/// a snapshot for display and progress events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Total epics.
    pub epics_total: u64,
    /// Completed epics.
    pub epics_completed: u64,
    /// Blocked epics.
    pub epics_blocked: u64,
    /// Total tasks.
    pub tasks_total: u64,
    /// Done tasks.
    pub tasks_done: u64,
    /// Total task-level tests.
    pub tests_total: u64,
    /// Task-level tests currently passing.
    pub tests_passing: u64,
    /// Total epic-tests.
    pub epic_tests_total: u64,
    /// Epic-tests whose last run passed.
    pub epic_tests_passed: u64,
    /// Epic-tests whose last run failed.
    pub epic_tests_failed: u64,
}

/// An advisory recommendation to re-run foundational epic tests.
#[derive(Debug, Clone, Serialize)]
pub struct RetestRecommendation {
    /// Recommendation identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// The epic recommended for retesting.
    pub epic_id: Uuid,
    /// Human-readable rationale.
    pub reason: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

/// Raw row tuple from the `epics` table.
type EpicRow = (
    String,
    String,
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
);

fn epic_row_into(row: EpicRow) -> Result<Epic, StoreError> {
    let (id, project_id, name, description, priority, status, created_at, completed_at) = row;
    Ok(Epic {
        id: parse_id("epics.id", &id)?,
        project_id: parse_id("epics.project_id", &project_id)?,
        name,
        description,
        priority,
        status: EpicStatus::parse(&status)?,
        created_at: parse_ts("epics.created_at", &created_at)?,
        completed_at: parse_opt_ts("epics.completed_at", completed_at)?,
    })
}

/// Raw row tuple from the `tasks` table.
type TaskRow = (
    String,
    String,
    String,
    i64,
    String,
    String,
    i64,
    String,
    Option<String>,
);

fn task_row_into(row: TaskRow) -> Result<Task, StoreError> {
    let (id, epic_id, project_id, priority, action, description, done, created_at, completed_at) =
        row;
    Ok(Task {
        id: parse_id("tasks.id", &id)?,
        epic_id: parse_id("tasks.epic_id", &epic_id)?,
        project_id: parse_id("tasks.project_id", &project_id)?,
        priority,
        action,
        description,
        done: done != 0,
        created_at: parse_ts("tasks.created_at", &created_at)?,
        completed_at: parse_opt_ts("tasks.completed_at", completed_at)?,
    })
}

/// Raw row tuple from the `tests` table.
type TaskTestRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<i64>,
    i64,
    Option<String>,
);

fn task_test_row_into(row: TaskTestRow) -> Result<TaskTest, StoreError> {
    let (
        id,
        task_id,
        category,
        requirements,
        success_criteria,
        steps,
        passes,
        last_result,
        execution_time_ms,
        retry_count,
        verified_at,
    ) = row;
    Ok(TaskTest {
        id: parse_id("tests.id", &id)?,
        task_id: parse_id("tests.task_id", &task_id)?,
        category,
        requirements,
        success_criteria,
        steps,
        passes: passes != 0,
        last_result,
        execution_time_ms,
        retry_count,
        verified_at: parse_opt_ts("tests.verified_at", verified_at)?,
    })
}

/// Raw row tuple from the `epic_tests` table.
type EpicTestRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
);

fn epic_test_row_into(row: EpicTestRow) -> Result<EpicTest, StoreError> {
    let (id, epic_id, name, description, last_result, depends_on_tasks, last_run_at) = row;
    let depends: Vec<Uuid> =
        serde_json::from_str(&depends_on_tasks).map_err(|_| StoreError::Inconsistent {
            detail: format!("unparseable epic_tests.depends_on_tasks: {depends_on_tasks:?}"),
        })?;
    Ok(EpicTest {
        id: parse_id("epic_tests.id", &id)?,
        epic_id: parse_id("epic_tests.epic_id", &epic_id)?,
        name,
        description,
        last_result: last_result.as_deref().map(EpicTestOutcome::parse).transpose()?,
        depends_on_tasks: depends,
        last_run_at: parse_opt_ts("epic_tests.last_run_at", last_run_at)?,
    })
}

/// Raw row tuple from the `interventions` table.
type InterventionRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    i64,
    String,
    String,
    Option<String>,
);

fn intervention_row_into(row: InterventionRow) -> Result<Intervention, StoreError> {
    let (
        id,
        project_id,
        epic_id,
        session_id,
        failing_test_ids,
        failing_count,
        reason,
        created_at,
        resolved_at,
    ) = row;
    let failing: Vec<Uuid> =
        serde_json::from_str(&failing_test_ids).map_err(|_| StoreError::Inconsistent {
            detail: format!("unparseable interventions.failing_test_ids: {failing_test_ids:?}"),
        })?;
    Ok(Intervention {
        id: parse_id("interventions.id", &id)?,
        project_id: parse_id("interventions.project_id", &project_id)?,
        epic_id: parse_id("interventions.epic_id", &epic_id)?,
        session_id: session_id
            .as_deref()
            .map(|s| parse_id("interventions.session_id", s))
            .transpose()?,
        failing_count: u32::try_from(failing_count).unwrap_or(0),
        failing_test_ids: failing,
        reason,
        created_at: parse_ts("interventions.created_at", &created_at)?,
        resolved_at: parse_opt_ts("interventions.resolved_at", resolved_at)?,
    })
}

const EPIC_COLUMNS: &str =
    "id, project_id, name, description, priority, status, created_at, completed_at";
const TASK_COLUMNS: &str =
    "id, epic_id, project_id, priority, action, description, done, created_at, completed_at";
const TASK_TEST_COLUMNS: &str = "id, task_id, category, requirements, success_criteria, steps, \
     passes, last_result, execution_time_ms, retry_count, verified_at";
const EPIC_TEST_COLUMNS: &str =
    "id, epic_id, name, description, last_result, depends_on_tasks, last_run_at";
const INTERVENTION_COLUMNS: &str = "id, project_id, epic_id, session_id, failing_test_ids, \
     failing_count, reason, created_at, resolved_at";

// ---------------------------------------------------------------------------
// Roadmap operations
// ---------------------------------------------------------------------------

impl Store {
    /// Insert an epic into a project's roadmap.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the project does not exist.
    pub async fn insert_epic(&self, project_id: Uuid, new: NewEpic) -> Result<Epic, StoreError> {
        // Surface a typed error instead of a foreign-key violation.
        self.project(project_id).await?;

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO epics (id, project_id, name, description, priority, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
        )
        .bind(id.to_string())
        .bind(project_id.to_string())
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.priority)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        self.epic(id).await
    }

    /// Insert a task under an epic.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the epic does not exist.
    pub async fn insert_task(&self, epic_id: Uuid, new: NewTask) -> Result<Task, StoreError> {
        let epic = self.epic(epic_id).await?;

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tasks (id, epic_id, project_id, priority, action, description, done, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        )
        .bind(id.to_string())
        .bind(epic_id.to_string())
        .bind(epic.project_id.to_string())
        .bind(new.priority)
        .bind(&new.action)
        .bind(&new.description)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        self.task(id).await
    }

    /// Attach a test to a task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the task does not exist.
    pub async fn insert_task_test(
        &self,
        task_id: Uuid,
        new: NewTaskTest,
    ) -> Result<TaskTest, StoreError> {
        self.task(task_id).await?;

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tests (id, task_id, category, requirements, success_criteria, steps) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.to_string())
        .bind(task_id.to_string())
        .bind(&new.category)
        .bind(&new.requirements)
        .bind(&new.success_criteria)
        .bind(&new.steps)
        .execute(&self.pool)
        .await?;

        self.task_test(id).await
    }

    /// Attach an epic-test to an epic.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the epic does not exist.
    pub async fn insert_epic_test(
        &self,
        epic_id: Uuid,
        new: NewEpicTest,
    ) -> Result<EpicTest, StoreError> {
        self.epic(epic_id).await?;

        let id = Uuid::new_v4();
        let depends = serde_json::to_string(&new.depends_on_tasks).map_err(|e| {
            StoreError::Inconsistent {
                detail: format!("cannot serialize depends_on_tasks: {e}"),
            }
        })?;
        sqlx::query(
            "INSERT INTO epic_tests (id, epic_id, name, description, depends_on_tasks) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id.to_string())
        .bind(epic_id.to_string())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&depends)
        .execute(&self.pool)
        .await?;

        self.epic_test(id).await
    }

    /// Fetch an epic by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the epic does not exist.
    pub async fn epic(&self, id: Uuid) -> Result<Epic, StoreError> {
        let query = format!("SELECT {EPIC_COLUMNS} FROM epics WHERE id = ?1");
        let row: Option<EpicRow> = sqlx::query_as(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => epic_row_into(row),
            None => Err(StoreError::NotFound {
                entity: "epic",
                id: id.to_string(),
            }),
        }
    }

    /// List a project's epics in roadmap order.
    pub async fn epics(&self, project_id: Uuid) -> Result<Vec<Epic>, StoreError> {
        let query = format!(
            "SELECT {EPIC_COLUMNS} FROM epics WHERE project_id = ?1 ORDER BY priority ASC, id ASC"
        );
        let rows: Vec<EpicRow> = sqlx::query_as(&query)
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(epic_row_into).collect()
    }

    /// Fetch a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the task does not exist.
    pub async fn task(&self, id: Uuid) -> Result<Task, StoreError> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row: Option<TaskRow> = sqlx::query_as(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => task_row_into(row),
            None => Err(StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            }),
        }
    }

    /// Fetch a task-level test by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the test does not exist.
    pub async fn task_test(&self, id: Uuid) -> Result<TaskTest, StoreError> {
        let query = format!("SELECT {TASK_TEST_COLUMNS} FROM tests WHERE id = ?1");
        let row: Option<TaskTestRow> = sqlx::query_as(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => task_test_row_into(row),
            None => Err(StoreError::NotFound {
                entity: "test",
                id: id.to_string(),
            }),
        }
    }

    /// List the tests attached to a task.
    pub async fn tests_for_task(&self, task_id: Uuid) -> Result<Vec<TaskTest>, StoreError> {
        let query = format!("SELECT {TASK_TEST_COLUMNS} FROM tests WHERE task_id = ?1 ORDER BY id");
        let rows: Vec<TaskTestRow> = sqlx::query_as(&query)
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(task_test_row_into).collect()
    }

    /// Fetch an epic-test by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the epic-test does not exist.
    pub async fn epic_test(&self, id: Uuid) -> Result<EpicTest, StoreError> {
        let query = format!("SELECT {EPIC_TEST_COLUMNS} FROM epic_tests WHERE id = ?1");
        let row: Option<EpicTestRow> = sqlx::query_as(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => epic_test_row_into(row),
            None => Err(StoreError::NotFound {
                entity: "epic_test",
                id: id.to_string(),
            }),
        }
    }

    /// List the epic-tests attached to an epic.
    pub async fn epic_tests(&self, epic_id: Uuid) -> Result<Vec<EpicTest>, StoreError> {
        let query =
            format!("SELECT {EPIC_TEST_COLUMNS} FROM epic_tests WHERE epic_id = ?1 ORDER BY id");
        let rows: Vec<EpicTestRow> = sqlx::query_as(&query)
            .bind(epic_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(epic_test_row_into).collect()
    }

    /// The next unit of work for a project.
    ///
    /// Verification first: an epic whose tasks are all done but whose
    /// epic-tests have not all passed outranks any pending task. Otherwise
    /// the lowest `(epic.priority, task.priority, task.id)` pending task.
    /// `None` means the roadmap is exhausted.
    pub async fn next_work(&self, project_id: Uuid) -> Result<Option<NextWork>, StoreError> {
        self.with_retry("next_work", || async move {
            let pid = project_id.to_string();

            let epic_query = format!(
                "SELECT {EPIC_COLUMNS} FROM epics e \
                 WHERE e.project_id = ?1 AND e.status != 'completed' \
                   AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.epic_id = e.id AND t.done = 0) \
                   AND EXISTS (SELECT 1 FROM epic_tests et WHERE et.epic_id = e.id \
                               AND (et.last_result IS NULL OR et.last_result != 'passed')) \
                 ORDER BY e.priority ASC, e.id ASC LIMIT 1"
            );
            let epic_row: Option<EpicRow> = sqlx::query_as(&epic_query)
                .bind(&pid)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = epic_row {
                return Ok(Some(NextWork::EpicTestRequired(epic_row_into(row)?)));
            }

            let task_query = format!(
                "SELECT {TASK_COLUMNS} FROM tasks t \
                 JOIN epics e ON e.id = t.epic_id \
                 WHERE t.project_id = ?1 AND t.done = 0 \
                 ORDER BY e.priority ASC, t.priority ASC, t.id ASC LIMIT 1"
            );
            let task_row: Option<TaskRow> = sqlx::query_as(&task_query)
                .bind(&pid)
                .fetch_optional(&self.pool)
                .await?;
            match task_row {
                Some(row) => {
                    let task = task_row_into(row)?;
                    let epic = self.epic(task.epic_id).await?;
                    Ok(Some(NextWork::Task(TaskUnit { task, epic })))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Move a pending epic to `in_progress`; no-op in any other state.
    pub async fn mark_epic_in_progress(&self, epic_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE epics SET status = 'in_progress' WHERE id = ?1 AND status = 'pending'")
            .bind(epic_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the result of a task-level test run.
    ///
    /// Only the testing entity may claim a pass. A pass stamps
    /// `verified_at`; a failure bumps `retry_count`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the test does not exist.
    pub async fn update_test_result(
        &self,
        test_id: Uuid,
        passes: bool,
        notes: Option<&str>,
        error: Option<&str>,
        duration_ms: Option<i64>,
    ) -> Result<TaskTest, StoreError> {
        let last_result = match (error, notes) {
            (Some(err), _) => Some(err.to_owned()),
            (None, Some(n)) => Some(n.to_owned()),
            (None, None) => None,
        };

        let updated = sqlx::query(
            "UPDATE tests SET \
                passes = ?2, \
                last_result = COALESCE(?3, last_result), \
                execution_time_ms = COALESCE(?4, execution_time_ms), \
                retry_count = retry_count + CASE WHEN ?2 THEN 0 ELSE 1 END, \
                verified_at = CASE WHEN ?2 THEN ?5 ELSE verified_at END \
             WHERE id = ?1",
        )
        .bind(test_id.to_string())
        .bind(passes)
        .bind(&last_result)
        .bind(duration_ms)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "test",
                id: test_id.to_string(),
            });
        }

        debug!(test_id = %test_id, passes, "test result recorded");
        self.task_test(test_id).await
    }

    /// Close a task through the task gate.
    ///
    /// Fails with [`StoreError::TestsNotPassing`] while any attached test
    /// is not passing. Closing the last pending task of an epic applies
    /// the epic gate in the same transaction; the returned
    /// [`GateApplication`] reports what the gate decided. Closing an
    /// already-done task is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the task does not exist.
    pub async fn mark_task_done(
        &self,
        task_id: Uuid,
        session_id: Option<Uuid>,
    ) -> Result<Option<GateApplication>, StoreError> {
        let task = self.task(task_id).await?;
        if task.done {
            return Ok(None);
        }

        let lock = self.project_lock(task.project_id).await;
        let _guard = lock.lock().await;

        self.with_retry("mark_task_done", || async move {
            let mut tx = self.pool.begin().await?;
            let tid = task_id.to_string();

            let current: Option<(i64,)> = sqlx::query_as("SELECT done FROM tasks WHERE id = ?1")
                .bind(&tid)
                .fetch_optional(&mut *tx)
                .await?;
            match current {
                None => {
                    return Err(StoreError::NotFound {
                        entity: "task",
                        id: tid,
                    })
                }
                Some((done,)) if done != 0 => return Ok(None),
                Some(_) => {}
            }

            let failing: Vec<(String,)> =
                sqlx::query_as("SELECT id FROM tests WHERE task_id = ?1 AND passes = 0 ORDER BY id")
                    .bind(&tid)
                    .fetch_all(&mut *tx)
                    .await?;
            if !failing.is_empty() {
                return Err(StoreError::TestsNotPassing {
                    task_id: tid,
                    failing: failing.into_iter().map(|(id,)| id).collect(),
                });
            }

            sqlx::query("UPDATE tasks SET done = 1, completed_at = ?2 WHERE id = ?1")
                .bind(&tid)
                .bind(now_ts())
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE epics SET status = 'in_progress' WHERE id = ?1 AND status = 'pending'",
            )
            .bind(task.epic_id.to_string())
            .execute(&mut *tx)
            .await?;

            let (remaining,): (i64,) =
                sqlx::query_as("SELECT count(*) FROM tasks WHERE epic_id = ?1 AND done = 0")
                    .bind(task.epic_id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;

            let gate = if remaining == 0 {
                Some(self.apply_epic_gate(&mut tx, task.epic_id, session_id).await?)
            } else {
                None
            };

            tx.commit().await?;
            info!(task_id = %task_id, epic_id = %task.epic_id, "task done");
            Ok(gate)
        })
        .await
    }

    /// Record the result of an epic-test run.
    ///
    /// Failures are also appended to the failure log. When the owning
    /// epic has no pending tasks the epic gate is applied in the same
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the epic-test does not exist.
    pub async fn update_epic_test_result(
        &self,
        epic_test_id: Uuid,
        outcome: EpicTestOutcome,
        detail: Option<&str>,
        session_id: Option<Uuid>,
    ) -> Result<Option<GateApplication>, StoreError> {
        let epic_test = self.epic_test(epic_test_id).await?;
        let epic = self.epic(epic_test.epic_id).await?;

        let lock = self.project_lock(epic.project_id).await;
        let _guard = lock.lock().await;

        self.with_retry("update_epic_test_result", || async move {
            let mut tx = self.pool.begin().await?;
            let now = now_ts();

            sqlx::query("UPDATE epic_tests SET last_result = ?2, last_run_at = ?3 WHERE id = ?1")
                .bind(epic_test_id.to_string())
                .bind(outcome.as_str())
                .bind(&now)
                .execute(&mut *tx)
                .await?;

            if outcome == EpicTestOutcome::Failed {
                sqlx::query(
                    "INSERT INTO epic_test_failures (epic_test_id, session_id, detail, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(epic_test_id.to_string())
                .bind(session_id.map(|s| s.to_string()))
                .bind(detail.unwrap_or_default())
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }

            let (remaining,): (i64,) =
                sqlx::query_as("SELECT count(*) FROM tasks WHERE epic_id = ?1 AND done = 0")
                    .bind(epic.id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;

            let gate = if remaining == 0 {
                Some(self.apply_epic_gate(&mut tx, epic.id, session_id).await?)
            } else {
                None
            };

            tx.commit().await?;
            debug!(epic_test_id = %epic_test_id, outcome = outcome.as_str(), "epic-test result recorded");
            Ok(gate)
        })
        .await
    }

    /// Tally, classify, and apply the epic gate inside `tx`.
    ///
    /// Pure with respect to rows visible in the transaction; writes the
    /// decided status plus any intervention and retest recommendation.
    async fn apply_epic_gate(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        epic_id: Uuid,
        session_id: Option<Uuid>,
    ) -> Result<GateApplication, StoreError> {
        let eid = epic_id.to_string();

        let epic_row: Option<(String, String, String)> =
            sqlx::query_as("SELECT project_id, name, status FROM epics WHERE id = ?1")
                .bind(&eid)
                .fetch_optional(&mut **tx)
                .await?;
        let (project_id, epic_name, _status) = epic_row.ok_or_else(|| StoreError::NotFound {
            entity: "epic",
            id: eid.clone(),
        })?;

        let mode_row: Option<(String,)> =
            sqlx::query_as("SELECT epic_testing_mode FROM projects WHERE id = ?1")
                .bind(&project_id)
                .fetch_optional(&mut **tx)
                .await?;
        let mode = EpicTestingMode::parse(
            &mode_row
                .ok_or_else(|| StoreError::NotFound {
                    entity: "project",
                    id: project_id.clone(),
                })?
                .0,
        )?;

        let results: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT id, last_result FROM epic_tests WHERE epic_id = ?1 ORDER BY id")
                .bind(&eid)
                .fetch_all(&mut **tx)
                .await?;

        let mut tally = EpicTestTally::default();
        for (id, result) in &results {
            match result.as_deref() {
                Some("passed") => tally.passed = tally.passed.saturating_add(1),
                Some("failed") => {
                    tally.failed = tally.failed.saturating_add(1);
                    tally.failing_ids.push(id.clone());
                }
                _ => tally.pending = tally.pending.saturating_add(1),
            }
        }

        let outcome = gate::classify_epic(mode, &epic_name, &tally, &self.gate_config);
        let now = now_ts();
        let mut intervention_id = None;

        match &outcome {
            EpicGateOutcome::Completed => {
                sqlx::query(
                    "UPDATE epics SET status = 'completed', completed_at = ?2 WHERE id = ?1",
                )
                .bind(&eid)
                .bind(&now)
                .execute(&mut **tx)
                .await?;
                info!(epic_id = %epic_id, "epic completed");

                self.maybe_record_retest(tx, &project_id, &now).await?;
            }
            EpicGateOutcome::InProgress => {
                sqlx::query(
                    "UPDATE epics SET status = 'in_progress' WHERE id = ?1 AND status != 'completed'",
                )
                .bind(&eid)
                .execute(&mut **tx)
                .await?;
            }
            EpicGateOutcome::Blocked { failing_ids, reason } => {
                sqlx::query("UPDATE epics SET status = 'blocked' WHERE id = ?1")
                    .bind(&eid)
                    .execute(&mut **tx)
                    .await?;

                // One open intervention per epic; repeated failures while
                // already blocked do not stack new rows.
                let (open,): (i64,) = sqlx::query_as(
                    "SELECT count(*) FROM interventions WHERE epic_id = ?1 AND resolved_at IS NULL",
                )
                .bind(&eid)
                .fetch_one(&mut **tx)
                .await?;

                if open == 0 {
                    let iid = Uuid::new_v4();
                    let failing_json =
                        serde_json::to_string(failing_ids).map_err(|e| StoreError::Inconsistent {
                            detail: format!("cannot serialize failing ids: {e}"),
                        })?;
                    sqlx::query(
                        "INSERT INTO interventions (id, project_id, epic_id, session_id, \
                                                    failing_test_ids, failing_count, reason, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )
                    .bind(iid.to_string())
                    .bind(&project_id)
                    .bind(&eid)
                    .bind(session_id.map(|s| s.to_string()))
                    .bind(&failing_json)
                    .bind(i64::from(u32::try_from(failing_ids.len()).unwrap_or(u32::MAX)))
                    .bind(reason.as_str())
                    .bind(&now)
                    .execute(&mut **tx)
                    .await?;

                    warn!(
                        epic_id = %epic_id,
                        reason = reason.as_str(),
                        failing = failing_ids.len(),
                        "epic blocked, intervention created"
                    );
                    intervention_id = Some(iid);
                }
            }
        }

        Ok(GateApplication {
            epic_id,
            epic_name,
            outcome,
            intervention_id,
        })
    }

    /// Record a retest recommendation when the completed-epic count
    /// crosses the configured stride. Advisory only.
    async fn maybe_record_retest(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        project_id: &str,
        now: &str,
    ) -> Result<(), StoreError> {
        let (completed,): (i64,) = sqlx::query_as(
            "SELECT count(*) FROM epics WHERE project_id = ?1 AND status = 'completed'",
        )
        .bind(project_id)
        .fetch_one(&mut **tx)
        .await?;
        let completed = u32::try_from(completed).unwrap_or(0);

        if !gate::retest_due(completed, self.gate_config.retest_stride) {
            return Ok(());
        }

        // The most foundational completed epic: lowest priority value.
        let foundation: Option<(String, String)> = sqlx::query_as(
            "SELECT id, name FROM epics WHERE project_id = ?1 AND status = 'completed' \
             ORDER BY priority ASC, id ASC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some((epic_id, epic_name)) = foundation {
            let reason = format!(
                "{completed} epics completed; re-run epic tests for foundational epic {epic_name:?}"
            );
            sqlx::query(
                "INSERT INTO retest_recommendations (id, project_id, epic_id, reason, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(project_id)
            .bind(&epic_id)
            .bind(&reason)
            .bind(now)
            .execute(&mut **tx)
            .await?;
            debug!(project_id = %project_id, epic_id = %epic_id, "retest recommendation recorded");
        }

        Ok(())
    }

    /// List a project's unresolved interventions, oldest first.
    pub async fn open_interventions(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<Intervention>, StoreError> {
        let query = format!(
            "SELECT {INTERVENTION_COLUMNS} FROM interventions \
             WHERE project_id = ?1 AND resolved_at IS NULL ORDER BY created_at ASC"
        );
        let rows: Vec<InterventionRow> = sqlx::query_as(&query)
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(intervention_row_into).collect()
    }

    /// Resolve a blocked epic's open interventions and move it back to
    /// `in_progress` so the next coding loop re-verifies it.
    ///
    /// Returns the number of interventions resolved. Resolving an epic
    /// with nothing open is a no-op.
    pub async fn resolve_interventions(
        &self,
        project_id: Uuid,
        epic_id: Uuid,
    ) -> Result<u64, StoreError> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let now = now_ts();

        let resolved = sqlx::query(
            "UPDATE interventions SET resolved_at = ?3 \
             WHERE project_id = ?1 AND epic_id = ?2 AND resolved_at IS NULL",
        )
        .bind(project_id.to_string())
        .bind(epic_id.to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if resolved > 0 {
            sqlx::query("UPDATE epics SET status = 'in_progress' WHERE id = ?1 AND status = 'blocked'")
                .bind(epic_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        if resolved > 0 {
            info!(project_id = %project_id, epic_id = %epic_id, resolved, "interventions resolved");
        }
        Ok(resolved)
    }

    /// List a project's retest recommendations, newest first.
    pub async fn retest_recommendations(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<RetestRecommendation>, StoreError> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, project_id, epic_id, reason, created_at FROM retest_recommendations \
             WHERE project_id = ?1 ORDER BY created_at DESC",
        )
        .bind(project_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, project_id, epic_id, reason, created_at)| {
                Ok(RetestRecommendation {
                    id: parse_id("retest_recommendations.id", &id)?,
                    project_id: parse_id("retest_recommendations.project_id", &project_id)?,
                    epic_id: parse_id("retest_recommendations.epic_id", &epic_id)?,
                    reason,
                    created_at: parse_ts("retest_recommendations.created_at", &created_at)?,
                })
            })
            .collect()
    }

    /// Compute a progress snapshot from current rows.
    pub async fn progress_snapshot(
        &self,
        project_id: Uuid,
    ) -> Result<ProgressSnapshot, StoreError> {
        let pid = project_id.to_string();

        let (epics_total, epics_completed, epics_blocked): (i64, i64, i64) = sqlx::query_as(
            "SELECT count(*), \
                    coalesce(sum(status = 'completed'), 0), \
                    coalesce(sum(status = 'blocked'), 0) \
             FROM epics WHERE project_id = ?1",
        )
        .bind(&pid)
        .fetch_one(&self.pool)
        .await?;

        let (tasks_total, tasks_done): (i64, i64) = sqlx::query_as(
            "SELECT count(*), coalesce(sum(done), 0) FROM tasks WHERE project_id = ?1",
        )
        .bind(&pid)
        .fetch_one(&self.pool)
        .await?;

        let (tests_total, tests_passing): (i64, i64) = sqlx::query_as(
            "SELECT count(*), coalesce(sum(passes), 0) FROM tests \
             WHERE task_id IN (SELECT id FROM tasks WHERE project_id = ?1)",
        )
        .bind(&pid)
        .fetch_one(&self.pool)
        .await?;

        let (epic_tests_total, epic_tests_passed, epic_tests_failed): (i64, i64, i64) =
            sqlx::query_as(
                "SELECT count(*), \
                        coalesce(sum(last_result = 'passed'), 0), \
                        coalesce(sum(last_result = 'failed'), 0) \
                 FROM epic_tests \
                 WHERE epic_id IN (SELECT id FROM epics WHERE project_id = ?1)",
            )
            .bind(&pid)
            .fetch_one(&self.pool)
            .await?;

        Ok(ProgressSnapshot {
            epics_total: epics_total.cast_unsigned(),
            epics_completed: epics_completed.cast_unsigned(),
            epics_blocked: epics_blocked.cast_unsigned(),
            tasks_total: tasks_total.cast_unsigned(),
            tasks_done: tasks_done.cast_unsigned(),
            tests_total: tests_total.cast_unsigned(),
            tests_passing: tests_passing.cast_unsigned(),
            epic_tests_total: epic_tests_total.cast_unsigned(),
            epic_tests_passed: epic_tests_passed.cast_unsigned(),
            epic_tests_failed: epic_tests_failed.cast_unsigned(),
        })
    }

    /// Atomically remove a project's roadmap and clear `initialized`.
    ///
    /// Used after a cancelled initialization so a re-run starts from a
    /// clean slate. Returns the removed row counts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the project does not exist.
    pub async fn purge_roadmap(&self, project_id: Uuid) -> Result<RoadmapCounts, StoreError> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        self.with_retry("purge_roadmap", || async move {
            let mut tx = self.pool.begin().await?;
            let pid = project_id.to_string();

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

            let (epics,): (i64,) =
                sqlx::query_as("SELECT count(*) FROM epics WHERE project_id = ?1")
                    .bind(&pid)
                    .fetch_one(&mut *tx)
                    .await?;
            let (tasks,): (i64,) =
                sqlx::query_as("SELECT count(*) FROM tasks WHERE project_id = ?1")
                    .bind(&pid)
                    .fetch_one(&mut *tx)
                    .await?;
            let (task_tests,): (i64,) = sqlx::query_as(
                "SELECT count(*) FROM tests \
                 WHERE task_id IN (SELECT id FROM tasks WHERE project_id = ?1)",
            )
            .bind(&pid)
            .fetch_one(&mut *tx)
            .await?;
            let (epic_tests,): (i64,) = sqlx::query_as(
                "SELECT count(*) FROM epic_tests \
                 WHERE epic_id IN (SELECT id FROM epics WHERE project_id = ?1)",
            )
            .bind(&pid)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM epics WHERE project_id = ?1")
                .bind(&pid)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE projects SET initialized = 0, updated_at = ?2 WHERE id = ?1")
                .bind(&pid)
                .bind(now_ts())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            let counts = RoadmapCounts {
                epics_deleted: epics.cast_unsigned(),
                tasks_deleted: tasks.cast_unsigned(),
                tests_deleted: task_tests.saturating_add(epic_tests).cast_unsigned(),
            };
            info!(project_id = %project_id, ?counts, "roadmap purged");
            Ok(counts)
        })
        .await
    }
}
