//! Session execution abstractions.
//!
//! A [`SessionRunner`] executes exactly one session for a project: an
//! initializer session that plans the roadmap, or a coding session that
//! executes one unit of work. The runner emits [`RunnerEvent`]s while it
//! works and resolves to a [`RunnerOutcome`]; the event stream ends exactly
//! when the call resolves. The runner never writes to the store: the
//! orchestrator mediates every write from the events it observes.
//!
//! The cancel receiver must lead to a `Cancelled` outcome within a bounded
//! interval; a runner that ignores it is detached by the scheduler after
//! the configured grace period.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub mod process;

use crate::store::{
    Epic, EpicTest, EpicTestOutcome, SandboxType, SessionMetrics, Task, TaskTest,
};

/// Identity and environment for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    /// The project being driven.
    pub project_id: Uuid,
    /// The session row this run belongs to.
    pub session_id: Uuid,
    /// Project name, for runner-side workspace naming.
    pub project_name: String,
    /// Where the runner should execute.
    pub sandbox: SandboxType,
    /// Model the runner should use, if overridden.
    pub model: Option<String>,
}

/// What a coding session must do.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum CodingDirective {
    /// Implement one task and make its tests pass.
    ExecuteTask {
        /// The task to implement.
        task: Task,
        /// Its epic, for context.
        epic: Epic,
        /// Tests that must pass before the task can close.
        tests: Vec<TaskTest>,
    },
    /// Run an epic's integration tests and report each outcome.
    VerifyEpic {
        /// The epic to verify.
        epic: Epic,
        /// The epic-tests to run.
        epic_tests: Vec<EpicTest>,
    },
}

/// An event emitted by a runner while a session executes.
///
/// Planning events carry runner-local `ref` strings because the runner
/// does not mint row ids; the orchestrator resolves refs to rows as it
/// applies them. Result events reference real ids taken from the
/// directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// The runner invoked a tool.
    ToolUse {
        /// Tool name.
        tool_name: String,
    },
    /// The runner produced an assistant message.
    AssistantMessage {
        /// Message text.
        text: String,
    },
    /// Initializer: a planned epic.
    EpicPlanned {
        /// Runner-local reference for later planning events.
        ref_id: String,
        /// Epic name.
        name: String,
        /// Free-form description.
        #[serde(default)]
        description: String,
        /// Ordering within the project.
        priority: i64,
    },
    /// Initializer: a planned task under a previously planned epic.
    TaskPlanned {
        /// Runner-local reference for later planning events.
        ref_id: String,
        /// The owning epic's `ref_id`.
        epic_ref: String,
        /// What the coding session should do.
        action: String,
        /// Free-form description.
        #[serde(default)]
        description: String,
        /// Ordering within the epic.
        priority: i64,
    },
    /// Initializer: a planned test under a previously planned task.
    TaskTestPlanned {
        /// The owning task's `ref_id`.
        task_ref: String,
        /// Test category.
        #[serde(default)]
        category: String,
        /// What the test requires.
        #[serde(default)]
        requirements: String,
        /// What counts as success.
        #[serde(default)]
        success_criteria: String,
        /// Reproduction steps.
        #[serde(default)]
        steps: String,
    },
    /// Initializer: a planned epic-test under a previously planned epic.
    EpicTestPlanned {
        /// The owning epic's `ref_id`.
        epic_ref: String,
        /// Test name.
        name: String,
        /// Free-form description.
        #[serde(default)]
        description: String,
        /// `ref_id`s of tasks this test depends on.
        #[serde(default)]
        depends_on_task_refs: Vec<String>,
    },
    /// Coding: a task-level test was run.
    TestResult {
        /// The test, by row id from the directive.
        test_id: Uuid,
        /// Whether it passed.
        passed: bool,
        /// Free-form notes.
        #[serde(default)]
        notes: Option<String>,
        /// Error detail on failure.
        #[serde(default)]
        error: Option<String>,
        /// Run duration.
        #[serde(default)]
        duration_ms: Option<i64>,
    },
    /// Coding: the runner considers the task complete.
    TaskCompleted {
        /// The task, by row id from the directive.
        task_id: Uuid,
    },
    /// Coding: an epic-test was run.
    EpicTestResult {
        /// The epic-test, by row id from the directive.
        epic_test_id: Uuid,
        /// The outcome.
        outcome: EpicTestOutcomeWire,
        /// Failure or skip detail.
        #[serde(default)]
        detail: Option<String>,
    },
}

/// Wire form of an epic-test outcome.
///
/// Mirrors [`EpicTestOutcome`] but derives `Deserialize` so runner
/// processes can report it over JSONL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpicTestOutcomeWire {
    /// The test passed.
    Passed,
    /// The test ran and failed.
    Failed,
    /// The test was skipped.
    Skipped,
    /// The harness errored before a verdict.
    Error,
}

impl From<EpicTestOutcomeWire> for EpicTestOutcome {
    fn from(wire: EpicTestOutcomeWire) -> Self {
        match wire {
            EpicTestOutcomeWire::Passed => EpicTestOutcome::Passed,
            EpicTestOutcomeWire::Failed => EpicTestOutcome::Failed,
            EpicTestOutcomeWire::Skipped => EpicTestOutcome::Skipped,
            EpicTestOutcomeWire::Error => EpicTestOutcome::Error,
        }
    }
}

/// Terminal result of one session run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerOutcome {
    /// The session finished its work.
    Completed(SessionMetrics),
    /// The session observed the cancel signal and stopped.
    Cancelled,
    /// The session failed.
    Failed {
        /// Human-readable error.
        error: String,
    },
}

/// Infrastructure errors from a runner implementation.
///
/// Distinct from [`RunnerOutcome::Failed`]: these mean the runner could
/// not be driven at all (spawn failure, broken pipe), not that the agent's
/// work failed.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The runner process could not be spawned.
    #[error("failed to spawn runner {command:?}: {source}")]
    Spawn {
        /// The attempted command.
        command: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// I/O failure while driving the runner.
    #[error("runner i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The session payload could not be serialized.
    #[error("cannot serialize session payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Capability that executes one session and emits its events.
///
/// Supplied by the agent driver; the orchestrator depends only on this
/// contract.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    /// Run an initializer session: read the spec, emit planning events,
    /// resolve when the roadmap is fully planned.
    async fn run_init(
        &self,
        ctx: &SessionContext,
        spec: &str,
        events: mpsc::Sender<RunnerEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunnerOutcome, RunnerError>;

    /// Run a coding session against one directive.
    async fn run_coding(
        &self,
        ctx: &SessionContext,
        directive: &CodingDirective,
        events: mpsc::Sender<RunnerEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunnerOutcome, RunnerError>;
}
