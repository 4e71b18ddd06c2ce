//! Session loops: one initializer run, or the auto-continue coding loop.
//!
//! Each loop runs as an isolated supervised Tokio task. The loop drives
//! exactly one session at a time: it records the row, streams runner
//! events, applies their stateful effects through the store, broadcasts
//! progress, and finalizes the session on the runner's terminal outcome.
//! Stop is observed between iterations and never interrupts the current
//! session; cancel interrupts it and is enforced with a grace period after
//! which the session is detached and failed.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{BlockedEpic, ProjectEvent};
use crate::gate::EpicGateOutcome;
use crate::registry::ActiveClaim;
use crate::runner::{
    CodingDirective, RunnerError, RunnerEvent, RunnerOutcome, SessionContext,
};
use crate::store::{
    CheckpointKind, GateApplication, NewEpic, NewEpicTest, NewTask, NewTaskTest, NextWork,
    Project, Session, SessionKind, SessionPatch, SessionStatus, StoreError,
};

use super::{Orchestrator, OrchestratorError, StartCodingOptions};

/// Buffer between the runner's event stream and the applier.
const RUNNER_EVENT_CAPACITY: usize = 256;

/// Cadence of heartbeat stamps while the runner is quiet.
const HEARTBEAT_TICK_SECS: u64 = 30;

/// Spawn a supervised initializer session task.
pub(crate) fn spawn_init(
    orch: Orchestrator,
    claim: ActiveClaim,
    project: Project,
    session: Session,
) {
    let supervisor = orch.clone();
    let project_id = project.id;
    let inner = tokio::spawn(async move {
        run_init_session(orch, claim, project, session).await;
    });
    tokio::spawn(async move {
        supervise(supervisor, project_id, inner).await;
    });
}

/// Spawn a supervised coding-loop task.
pub(crate) fn spawn_coding(
    orch: Orchestrator,
    claim: ActiveClaim,
    project: Project,
    opts: StartCodingOptions,
) {
    let supervisor = orch.clone();
    let project_id = project.id;
    let inner = tokio::spawn(async move {
        run_coding_loop(orch, claim, project, opts).await;
    });
    tokio::spawn(async move {
        supervise(supervisor, project_id, inner).await;
    });
}

/// Tear down after a panicked loop: release the slot, fail the session,
/// broadcast. A panic in one loop never poisons another project's loop.
async fn supervise(
    orch: Orchestrator,
    project_id: Uuid,
    inner: tokio::task::JoinHandle<()>,
) {
    let Err(join_err) = inner.await else {
        return;
    };
    if !join_err.is_panic() {
        return;
    }
    error!(project_id = %project_id, "scheduler loop panicked; tearing down its slot");

    let held = orch.registry.force_release(project_id).await;
    if let Some(session_id) = held.and_then(|info| info.session_id) {
        let patch = SessionPatch {
            status: Some(SessionStatus::Failed),
            ended_at: Some(Utc::now()),
            failure_reason: Some("panic".to_owned()),
            ..SessionPatch::default()
        };
        if let Err(e) = orch.store.update_session(session_id, patch).await {
            error!(session_id = %session_id, error = %e, "failed to mark panicked session");
        }
        orch.events.publish(
            project_id,
            &ProjectEvent::SessionError {
                session_id,
                code: "panic".to_owned(),
                detail: "scheduler loop panicked".to_owned(),
                blocked_epic: None,
            },
        );
    }
}

/// Run one initializer session to its terminal state, then release the
/// registry slot.
async fn run_init_session(
    orch: Orchestrator,
    claim: ActiveClaim,
    project: Project,
    session: Session,
) {
    let end = run_session(
        &orch,
        &claim,
        &project,
        &session,
        SessionWork::Init {
            spec: &project.spec,
        },
    )
    .await;
    orch.registry.release(project.id, Some(session.id)).await;
    info!(project_id = %project.id, session_id = %session.id, ?end, "initializer session finished");
}

/// The auto-continue coding loop: one session per unit of work until the
/// roadmap is exhausted or a stop condition fires.
async fn run_coding_loop(
    orch: Orchestrator,
    claim: ActiveClaim,
    project: Project,
    opts: StartCodingOptions,
) {
    let mut iterations: u64 = 0;
    let mut last_session: Option<Uuid> = None;

    loop {
        if opts.max_iterations > 0 && iterations >= opts.max_iterations {
            info!(project_id = %project.id, iterations, "iteration budget reached");
            break;
        }
        if claim.stop_requested() {
            info!(project_id = %project.id, "stop observed, not starting another session");
            break;
        }
        if claim.cancelled() {
            info!(project_id = %project.id, "cancel observed between iterations");
            break;
        }

        let next = match orch.store.next_work(project.id).await {
            Ok(next) => next,
            Err(e) => {
                error!(project_id = %project.id, error = %e, "cannot fetch next unit of work");
                break;
            }
        };
        let Some(work) = next else {
            info!(project_id = %project.id, "roadmap exhausted, project complete");
            if let Ok(snapshot) = orch.store.progress_snapshot(project.id).await {
                orch.events
                    .publish(project.id, &ProjectEvent::ProgressUpdate { snapshot });
            }
            break;
        };

        let model = opts
            .model
            .clone()
            .or_else(|| project.coding_model.clone())
            .unwrap_or_else(|| orch.config.models.coding.clone());

        let session = match orch
            .store
            .record_session(project.id, SessionKind::Coding, Some(&model))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(project_id = %project.id, error = %e, "cannot record coding session");
                break;
            }
        };
        orch.registry.bind_session(project.id, session.id).await;
        last_session = Some(session.id);

        let directive = match build_directive(&orch, work).await {
            Ok(directive) => directive,
            Err(e) => {
                error!(project_id = %project.id, error = %e, "cannot build session directive");
                finalize_failed(&orch, &project, &session, "store_error", &e.to_string()).await;
                break;
            }
        };

        let end = run_session(
            &orch,
            &claim,
            &project,
            &session,
            SessionWork::Coding {
                directive: &directive,
            },
        )
        .await;
        iterations = iterations.saturating_add(1);

        match end {
            SessionEnd::Completed => {}
            SessionEnd::Blocked => {
                info!(project_id = %project.id, "completion gate blocked, ending loop");
                break;
            }
            SessionEnd::Cancelled
            | SessionEnd::Failed
            | SessionEnd::CancelTimeout => break,
        }
    }

    orch.registry.release(project.id, last_session).await;
    info!(project_id = %project.id, iterations, "coding loop finished");
}

/// Resolve a unit of work into a runner directive, stamping the epic
/// `in_progress` when work for it is first dispatched. Verification
/// dispatch counts: a zero-task epic must not sit in `pending` while its
/// epic-tests are being run.
async fn build_directive(
    orch: &Orchestrator,
    work: NextWork,
) -> Result<CodingDirective, StoreError> {
    match work {
        NextWork::Task(unit) => {
            orch.store.mark_epic_in_progress(unit.epic.id).await?;
            let tests = orch.store.tests_for_task(unit.task.id).await?;
            Ok(CodingDirective::ExecuteTask {
                task: unit.task,
                epic: unit.epic,
                tests,
            })
        }
        NextWork::EpicTestRequired(epic) => {
            orch.store.mark_epic_in_progress(epic.id).await?;
            let epic_tests = orch.store.epic_tests(epic.id).await?;
            Ok(CodingDirective::VerifyEpic { epic, epic_tests })
        }
    }
}

// ---------------------------------------------------------------------------
// One session
// ---------------------------------------------------------------------------

/// What a session executes.
enum SessionWork<'a> {
    /// Plan the roadmap from the spec.
    Init { spec: &'a str },
    /// Execute one coding directive.
    Coding { directive: &'a CodingDirective },
}

/// How a session ended, as seen by the loop above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The runner completed its work.
    Completed,
    /// The runner was cancelled.
    Cancelled,
    /// The runner or a store operation failed.
    Failed,
    /// The completion gate blocked the epic.
    Blocked,
    /// The runner ignored cancellation past the grace period.
    CancelTimeout,
}

/// Terminal condition of the event loop.
enum Terminal {
    /// The runner resolved.
    Outcome(Result<RunnerOutcome, RunnerError>),
    /// Applying an observed event failed: a completion-gate block
    /// ([`OrchestratorError::EpicTestBlocked`]) or a store write failure.
    ApplyFailed(OrchestratorError),
    /// Cancel grace expired with the runner still live.
    CancelTimeout,
}

/// Drive one session: stream events, apply effects, finalize the row, and
/// broadcast the terminal event.
async fn run_session(
    orch: &Orchestrator,
    claim: &ActiveClaim,
    project: &Project,
    session: &Session,
    work: SessionWork<'_>,
) -> SessionEnd {
    let started = Utc::now();
    let patch = SessionPatch {
        status: Some(SessionStatus::Running),
        started_at: Some(started),
        ..SessionPatch::default()
    };
    if let Err(e) = orch.store.update_session(session.id, patch).await {
        error!(session_id = %session.id, error = %e, "cannot mark session running");
        finalize_failed(orch, project, session, "store_error", &e.to_string()).await;
        return SessionEnd::Failed;
    }

    orch.events.publish(
        project.id,
        &ProjectEvent::SessionStarted {
            session_id: session.id,
            number: session.session_number,
            kind: session.kind,
        },
    );

    let ctx = SessionContext {
        project_id: project.id,
        session_id: session.id,
        project_name: project.name.clone(),
        sandbox: project.sandbox_type,
        model: session.model.clone(),
    };

    let (tx, mut rx) = mpsc::channel::<RunnerEvent>(RUNNER_EVENT_CAPACITY);
    let mut run: Pin<Box<dyn std::future::Future<Output = Result<RunnerOutcome, RunnerError>> + Send + '_>> =
        match &work {
            SessionWork::Init { spec } => {
                Box::pin(orch.runner.run_init(&ctx, spec, tx, claim.cancel_rx.clone()))
            }
            SessionWork::Coding { directive } => {
                Box::pin(orch.runner.run_coding(&ctx, directive, tx, claim.cancel_rx.clone()))
            }
        };

    let mut applier = match &work {
        SessionWork::Init { .. } => Applier::Init(InitApplier::default()),
        SessionWork::Coding { .. } => Applier::Coding(CodingApplier::default()),
    };

    let mut cancel_watch = claim.cancel_rx.clone();
    let mut events_open = true;
    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_TICK_SECS));
    heartbeat.tick().await;

    let mut terminal: Terminal = 'session: {
        // Normal phase: events, runner completion, heartbeat, cancel.
        loop {
            tokio::select! {
                maybe = rx.recv(), if events_open => {
                    match maybe {
                        Some(event) => {
                            let _ = orch.store.touch_session_heartbeat(session.id).await;
                            if let Err(e) = applier.apply(orch, project, session, event).await {
                                break 'session Terminal::ApplyFailed(e);
                            }
                        }
                        None => events_open = false,
                    }
                }
                result = &mut run => break 'session Terminal::Outcome(result),
                _ = heartbeat.tick() => {
                    let _ = orch.store.touch_session_heartbeat(session.id).await;
                }
                () = cancel_signalled(&mut cancel_watch) => break,
            }
        }

        // Cancelled phase: the runner must terminate within the grace
        // period or be detached.
        let grace = tokio::time::sleep(Duration::from_secs(orch.config.runner.cancel_grace_secs));
        tokio::pin!(grace);
        loop {
            tokio::select! {
                maybe = rx.recv(), if events_open => {
                    match maybe {
                        Some(event) => {
                            let _ = orch.store.touch_session_heartbeat(session.id).await;
                            if let Err(e) = applier.apply(orch, project, session, event).await {
                                break 'session Terminal::ApplyFailed(e);
                            }
                        }
                        None => events_open = false,
                    }
                }
                result = &mut run => break 'session Terminal::Outcome(result),
                () = &mut grace => break 'session Terminal::CancelTimeout,
            }
        }
    };

    // The runner resolved; apply anything still buffered so no observed
    // effect is lost.
    if matches!(terminal, Terminal::Outcome(_)) {
        while let Ok(event) = rx.try_recv() {
            if let Err(e) = applier.apply(orch, project, session, event).await {
                terminal = Terminal::ApplyFailed(e);
                break;
            }
        }
    }

    // Detaching drops the runner future, which tears down its resources.
    drop(run);

    match terminal {
        Terminal::Outcome(Ok(RunnerOutcome::Completed(metrics))) => {
            // An initializer success makes the project schedulable before
            // anyone observes the terminal event.
            if session.kind == SessionKind::Initializer {
                if let Err(e) = orch.store.set_initialized(project.id, true).await {
                    error!(project_id = %project.id, error = %e, "cannot set initialized");
                    finalize_failed(orch, project, session, "store_error", &e.to_string()).await;
                    return SessionEnd::Failed;
                }
            }

            let ended = Utc::now();
            let patch = SessionPatch {
                status: Some(SessionStatus::Completed),
                ended_at: Some(ended),
                metrics: Some(metrics),
                ..SessionPatch::default()
            };
            if let Err(e) = orch.store.update_session(session.id, patch).await {
                error!(session_id = %session.id, error = %e, "cannot finalize session");
            }

            if let Ok(snapshot) = orch.store.progress_snapshot(project.id).await {
                orch.events
                    .publish(project.id, &ProjectEvent::ProgressUpdate { snapshot });
            }
            orch.events.publish(
                project.id,
                &ProjectEvent::SessionComplete {
                    session_id: session.id,
                    status: SessionStatus::Completed,
                    duration_s: duration_secs(started, ended),
                },
            );
            SessionEnd::Completed
        }
        Terminal::Outcome(Ok(RunnerOutcome::Cancelled)) => {
            let ended = Utc::now();
            let patch = SessionPatch {
                status: Some(SessionStatus::Cancelled),
                ended_at: Some(ended),
                ..SessionPatch::default()
            };
            if let Err(e) = orch.store.update_session(session.id, patch).await {
                error!(session_id = %session.id, error = %e, "cannot finalize cancelled session");
            }
            orch.events.publish(
                project.id,
                &ProjectEvent::SessionComplete {
                    session_id: session.id,
                    status: SessionStatus::Cancelled,
                    duration_s: duration_secs(started, ended),
                },
            );
            SessionEnd::Cancelled
        }
        Terminal::Outcome(Ok(RunnerOutcome::Failed { error })) => {
            finalize_failed(orch, project, session, "runner_failed", &error).await;
            SessionEnd::Failed
        }
        Terminal::Outcome(Err(e)) => {
            finalize_failed(orch, project, session, "runner_failed", &e.to_string()).await;
            SessionEnd::Failed
        }
        Terminal::ApplyFailed(OrchestratorError::EpicTestBlocked { epic_id, failing }) => {
            finalize_blocked(orch, project, session, epic_id, failing).await;
            SessionEnd::Blocked
        }
        Terminal::ApplyFailed(e) => {
            finalize_failed(orch, project, session, "store_error", &e.to_string()).await;
            SessionEnd::Failed
        }
        Terminal::CancelTimeout => {
            warn!(session_id = %session.id, "runner ignored cancellation, detaching");
            finalize_failed(
                orch,
                project,
                session,
                "cancel_timeout",
                "runner did not terminate within the cancellation grace period",
            )
            .await;
            SessionEnd::CancelTimeout
        }
    }
}

/// Mark a session failed with a stable code and broadcast the error.
async fn finalize_failed(
    orch: &Orchestrator,
    project: &Project,
    session: &Session,
    code: &str,
    detail: &str,
) {
    let patch = SessionPatch {
        status: Some(SessionStatus::Failed),
        ended_at: Some(Utc::now()),
        failure_reason: Some(code.to_owned()),
        ..SessionPatch::default()
    };
    if let Err(e) = orch.store.update_session(session.id, patch).await {
        error!(session_id = %session.id, error = %e, "cannot mark session failed");
    }
    orch.events.publish(
        project.id,
        &ProjectEvent::SessionError {
            session_id: session.id,
            code: code.to_owned(),
            detail: detail.to_owned(),
            blocked_epic: None,
        },
    );
}

/// Mark a session failed on a completion-gate block and broadcast the
/// error with the epic and failing test ids as structured fields.
async fn finalize_blocked(
    orch: &Orchestrator,
    project: &Project,
    session: &Session,
    epic_id: Uuid,
    failing_ids: Vec<String>,
) {
    let patch = SessionPatch {
        status: Some(SessionStatus::Failed),
        ended_at: Some(Utc::now()),
        failure_reason: Some("epic_test_blocked".to_owned()),
        ..SessionPatch::default()
    };
    if let Err(e) = orch.store.update_session(session.id, patch).await {
        error!(session_id = %session.id, error = %e, "cannot mark blocked session failed");
    }
    let detail = format!(
        "epic {epic_id} blocked by {} failing epic-tests; intervention required",
        failing_ids.len()
    );
    orch.events.publish(
        project.id,
        &ProjectEvent::SessionError {
            session_id: session.id,
            code: "epic_test_blocked".to_owned(),
            detail,
            blocked_epic: Some(BlockedEpic {
                epic_id,
                failing_ids,
            }),
        },
    );
}

/// Completes once the cancel flag is raised; pends forever if it never is.
async fn cancel_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Seconds between two instants, clamped at zero.
fn duration_secs(started: chrono::DateTime<Utc>, ended: chrono::DateTime<Utc>) -> u64 {
    u64::try_from(ended.signed_duration_since(started).num_seconds()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Event application
// ---------------------------------------------------------------------------

/// Per-session state for applying runner events.
///
/// Applying fails with [`OrchestratorError::EpicTestBlocked`] when the
/// completion gate blocks, or with a store error; either ends the session.
enum Applier {
    Init(InitApplier),
    Coding(CodingApplier),
}

impl Applier {
    async fn apply(
        &mut self,
        orch: &Orchestrator,
        project: &Project,
        session: &Session,
        event: RunnerEvent,
    ) -> Result<(), OrchestratorError> {
        match self {
            Applier::Init(applier) => applier.apply(orch, project, event).await,
            Applier::Coding(applier) => applier.apply(orch, project, session, event).await,
        }
    }
}

/// Applies initializer planning events, resolving runner-local refs to
/// freshly minted rows.
#[derive(Default)]
struct InitApplier {
    epic_refs: HashMap<String, Uuid>,
    task_refs: HashMap<String, Uuid>,
    tool_count: u64,
}

impl InitApplier {
    async fn apply(
        &mut self,
        orch: &Orchestrator,
        project: &Project,
        event: RunnerEvent,
    ) -> Result<(), OrchestratorError> {
        match event {
            RunnerEvent::ToolUse { tool_name } => {
                self.tool_count = self.tool_count.saturating_add(1);
                orch.events.publish(
                    project.id,
                    &ProjectEvent::ToolUse {
                        tool_name,
                        cumulative_count: self.tool_count,
                    },
                );
            }
            RunnerEvent::AssistantMessage { text } => {
                orch.events.publish(
                    project.id,
                    &ProjectEvent::AssistantMessage {
                        text,
                        ts: Utc::now(),
                    },
                );
            }
            RunnerEvent::EpicPlanned {
                ref_id,
                name,
                description,
                priority,
            } => {
                let epic = orch
                    .store
                    .insert_epic(
                        project.id,
                        NewEpic {
                            name,
                            description,
                            priority,
                        },
                    )
                    .await?;
                self.epic_refs.insert(ref_id, epic.id);
                self.publish_progress(orch, project).await;
            }
            RunnerEvent::TaskPlanned {
                ref_id,
                epic_ref,
                action,
                description,
                priority,
            } => {
                let Some(&epic_id) = self.epic_refs.get(&epic_ref) else {
                    warn!(epic_ref, "task planned under unknown epic ref, skipping");
                    return Ok(());
                };
                let task = orch
                    .store
                    .insert_task(
                        epic_id,
                        NewTask {
                            action,
                            description,
                            priority,
                        },
                    )
                    .await?;
                self.task_refs.insert(ref_id, task.id);
                self.publish_progress(orch, project).await;
            }
            RunnerEvent::TaskTestPlanned {
                task_ref,
                category,
                requirements,
                success_criteria,
                steps,
            } => {
                let Some(&task_id) = self.task_refs.get(&task_ref) else {
                    warn!(task_ref, "test planned under unknown task ref, skipping");
                    return Ok(());
                };
                orch.store
                    .insert_task_test(
                        task_id,
                        NewTaskTest {
                            category: if category.is_empty() {
                                "functional".to_owned()
                            } else {
                                category
                            },
                            requirements,
                            success_criteria,
                            steps,
                        },
                    )
                    .await?;
                self.publish_progress(orch, project).await;
            }
            RunnerEvent::EpicTestPlanned {
                epic_ref,
                name,
                description,
                depends_on_task_refs,
            } => {
                let Some(&epic_id) = self.epic_refs.get(&epic_ref) else {
                    warn!(epic_ref, "epic-test planned under unknown epic ref, skipping");
                    return Ok(());
                };
                let depends_on_tasks = depends_on_task_refs
                    .iter()
                    .filter_map(|r| self.task_refs.get(r).copied())
                    .collect();
                orch.store
                    .insert_epic_test(
                        epic_id,
                        NewEpicTest {
                            name,
                            description,
                            depends_on_tasks,
                        },
                    )
                    .await?;
                self.publish_progress(orch, project).await;
            }
            other => {
                warn!(event = ?other, "unexpected event during initialization, ignoring");
            }
        }
        Ok(())
    }

    async fn publish_progress(&self, orch: &Orchestrator, project: &Project) {
        if let Ok(snapshot) = orch.store.progress_snapshot(project.id).await {
            orch.events
                .publish(project.id, &ProjectEvent::ProgressUpdate { snapshot });
        }
    }
}

/// Applies coding-session events: test results, task completion, epic-test
/// verification. A gate block surfaces as
/// [`OrchestratorError::EpicTestBlocked`].
#[derive(Default)]
struct CodingApplier {
    tool_count: u64,
}

impl CodingApplier {
    async fn apply(
        &mut self,
        orch: &Orchestrator,
        project: &Project,
        session: &Session,
        event: RunnerEvent,
    ) -> Result<(), OrchestratorError> {
        match event {
            RunnerEvent::ToolUse { tool_name } => {
                self.tool_count = self.tool_count.saturating_add(1);
                orch.events.publish(
                    project.id,
                    &ProjectEvent::ToolUse {
                        tool_name,
                        cumulative_count: self.tool_count,
                    },
                );
            }
            RunnerEvent::AssistantMessage { text } => {
                orch.events.publish(
                    project.id,
                    &ProjectEvent::AssistantMessage {
                        text,
                        ts: Utc::now(),
                    },
                );
            }
            RunnerEvent::TestResult {
                test_id,
                passed,
                notes,
                error,
                duration_ms,
            } => {
                orch.store
                    .update_test_result(
                        test_id,
                        passed,
                        notes.as_deref(),
                        error.as_deref(),
                        duration_ms,
                    )
                    .await?;
                self.publish_progress(orch, project).await;
            }
            RunnerEvent::TaskCompleted { task_id } => {
                match orch.store.mark_task_done(task_id, Some(session.id)).await {
                    Ok(gate) => {
                        let _ = orch
                            .store
                            .record_checkpoint(
                                session.id,
                                CheckpointKind::TaskComplete,
                                serde_json::json!({ "task_id": task_id }),
                            )
                            .await;
                        if let Some(gate) = gate {
                            self.handle_gate(orch, project, session, gate).await?;
                        }
                        self.publish_progress(orch, project).await;
                    }
                    Err(StoreError::TestsNotPassing { task_id, failing }) => {
                        warn!(
                            task_id = %task_id,
                            failing = failing.len(),
                            "runner claimed completion but tests are not passing; task stays open"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            RunnerEvent::EpicTestResult {
                epic_test_id,
                outcome,
                detail,
            } => {
                let gate = orch
                    .store
                    .update_epic_test_result(
                        epic_test_id,
                        outcome.into(),
                        detail.as_deref(),
                        Some(session.id),
                    )
                    .await?;
                if let Some(gate) = gate {
                    self.handle_gate(orch, project, session, gate).await?;
                }
                self.publish_progress(orch, project).await;
            }
            other => {
                warn!(event = ?other, "unexpected planning event during coding session, ignoring");
            }
        }
        Ok(())
    }

    /// Checkpoint and translate a gate decision. A block returns
    /// [`OrchestratorError::EpicTestBlocked`], which ends the session.
    async fn handle_gate(
        &self,
        orch: &Orchestrator,
        project: &Project,
        session: &Session,
        gate: GateApplication,
    ) -> Result<(), OrchestratorError> {
        match &gate.outcome {
            EpicGateOutcome::Completed => {
                let _ = orch
                    .store
                    .record_checkpoint(
                        session.id,
                        CheckpointKind::EpicComplete,
                        serde_json::json!({ "epic_id": gate.epic_id }),
                    )
                    .await;
                debug!(epic_id = %gate.epic_id, "epic gate passed");
                Ok(())
            }
            EpicGateOutcome::InProgress => Ok(()),
            EpicGateOutcome::Blocked { failing_ids, reason } => {
                let _ = orch
                    .store
                    .record_checkpoint(
                        session.id,
                        CheckpointKind::Intervention,
                        serde_json::json!({
                            "epic_id": gate.epic_id,
                            "failing": failing_ids,
                            "reason": reason.as_str(),
                        }),
                    )
                    .await;
                self.publish_progress(orch, project).await;
                warn!(
                    epic = %gate.epic_name,
                    reason = reason.as_str(),
                    "completion gate blocked the epic"
                );
                Err(OrchestratorError::EpicTestBlocked {
                    epic_id: gate.epic_id,
                    failing: failing_ids.clone(),
                })
            }
        }
    }

    async fn publish_progress(&self, orch: &Orchestrator, project: &Project) {
        if let Ok(snapshot) = orch.store.progress_snapshot(project.id).await {
            orch.events
                .publish(project.id, &ProjectEvent::ProgressUpdate { snapshot });
        }
    }
}
