//! Public orchestration API.
//!
//! The [`Orchestrator`] glues the store, the event bus, the session
//! registry, and the session runner into the project lifecycle: create,
//! initialize (plan the roadmap), run the auto-continue coding loop, stop,
//! cancel, resume, delete, status. Preconditions are validated against the
//! store, the single-active-session rule against the registry, and every
//! state transition is persisted before it is broadcast.

pub mod reaper;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{EventBus, Subscription};
use crate::gate::EpicTestingMode;
use crate::registry::{Busy, SessionRegistry};
use crate::runner::SessionRunner;
use crate::store::{
    DeletionCounts, Intervention, NewProject, NextWork, ProgressSnapshot, Project, RoadmapCounts,
    SandboxType, Session, SessionKind, Store, StoreError,
};

/// How long `cancel_initialize` waits for the cancelled session to release
/// its slot before purging anyway.
const CANCEL_SETTLE_POLL_MS: u64 = 50;

/// Errors surfaced by the orchestration API.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The referenced project (or session) does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
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

    /// The project already has a roadmap.
    #[error("project is already initialized")]
    AlreadyInitialized,

    /// The project has no roadmap yet.
    #[error("project is not initialized")]
    NotInitialized,

    /// Another session is active for this project.
    #[error("project has an active session")]
    Busy,

    /// The project name does not match `[a-z0-9_-]+`.
    #[error("invalid project name: {name:?}")]
    InvalidProjectName {
        /// The rejected name.
        name: String,
    },

    /// The request carried no spec.
    #[error("project spec is missing or empty")]
    SpecMissing,

    /// A configuration value is unusable.
    #[error("bad configuration: {0}")]
    BadConfiguration(String),

    /// A task cannot close while attached tests are not passing.
    #[error("task {task_id} has non-passing tests")]
    TestsNotPassing {
        /// The gated task.
        task_id: String,
        /// Ids of the non-passing tests.
        failing: Vec<String>,
    },

    /// The completion gate blocked an epic on failing epic-tests; the
    /// enclosing session fails and an intervention is opened.
    #[error("epic {epic_id} blocked by {} failing epic-tests", failing.len())]
    EpicTestBlocked {
        /// The blocked epic.
        epic_id: Uuid,
        /// Ids of the failing epic-tests.
        failing: Vec<String>,
    },

    /// Any other store failure (transient budget exhausted, inconsistent
    /// rows, timeouts).
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => OrchestratorError::NotFound { entity, id },
            StoreError::AlreadyExists { name } => OrchestratorError::AlreadyExists { name },
            StoreError::InvalidName { name } => OrchestratorError::InvalidProjectName { name },
            StoreError::TestsNotPassing { task_id, failing } => {
                OrchestratorError::TestsNotPassing { task_id, failing }
            }
            StoreError::SessionConflict { .. } => OrchestratorError::Busy,
            other => OrchestratorError::Store(other),
        }
    }
}

impl From<Busy> for OrchestratorError {
    fn from(_: Busy) -> Self {
        OrchestratorError::Busy
    }
}

/// Request to create a project.
#[derive(Debug, Clone)]
pub struct CreateProjectRequest {
    /// Unique project name, `[a-z0-9_-]+`.
    pub name: String,
    /// Specification text.
    pub spec: String,
    /// Epic-test gating mode; defaults to strict.
    pub epic_testing_mode: Option<EpicTestingMode>,
    /// Sandbox for sessions; defaults to docker.
    pub sandbox_type: Option<SandboxType>,
    /// Model override for initializer sessions.
    pub initializer_model: Option<String>,
    /// Model override for coding sessions.
    pub coding_model: Option<String>,
}

/// Options for [`Orchestrator::initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitializeOptions {
    /// Model override for this initializer session.
    pub model: Option<String>,
}

/// Options for [`Orchestrator::start_coding`].
#[derive(Debug, Clone, Default)]
pub struct StartCodingOptions {
    /// Number of sessions to run; `0` means until the roadmap is
    /// exhausted or a stop condition fires.
    pub max_iterations: u64,
    /// Model override for this loop's coding sessions.
    pub model: Option<String>,
}

/// Point-in-time view of a project.
#[derive(Debug, Clone)]
pub struct ProjectStatus {
    /// The project row.
    pub project: Project,
    /// Roadmap progress computed from rows.
    pub progress: ProgressSnapshot,
    /// The next unit of work, if the roadmap is not exhausted.
    pub next_work: Option<NextWork>,
    /// The non-terminal session, if one exists.
    pub active_session: Option<Session>,
    /// Unresolved interventions, oldest first.
    pub open_interventions: Vec<Intervention>,
}

/// The orchestration facade. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) store: Arc<Store>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) runner: Arc<dyn SessionRunner>,
    pub(crate) config: Arc<Config>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Compose the orchestrator from its parts.
    ///
    /// This is the composition root: construct the store, bus, registry,
    /// and runner once at startup and hand the orchestrator to every
    /// caller.
    pub fn new(store: Arc<Store>, runner: Arc<dyn SessionRunner>, config: Config) -> Self {
        let events = Arc::new(EventBus::new(config.events.buffer_per_subscriber));
        Self {
            store,
            events,
            registry: Arc::new(SessionRegistry::new()),
            runner,
            config: Arc::new(config),
        }
    }

    /// Returns the underlying store, for read-through callers.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create a project with a persisted spec.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when the name is taken, `InvalidProjectName` or
    /// `SpecMissing` on validation failure.
    pub async fn create_project(
        &self,
        request: CreateProjectRequest,
    ) -> Result<Project, OrchestratorError> {
        if request.spec.trim().is_empty() {
            return Err(OrchestratorError::SpecMissing);
        }

        let project = self
            .store
            .create_project(NewProject {
                name: request.name,
                spec: request.spec,
                epic_testing_mode: request
                    .epic_testing_mode
                    .unwrap_or(EpicTestingMode::Strict),
                sandbox_type: request.sandbox_type.unwrap_or(SandboxType::Docker),
                initializer_model: request.initializer_model,
                coding_model: request.coding_model,
            })
            .await?;
        Ok(project)
    }

    /// Start an initializer session that plans the project's roadmap.
    ///
    /// Returns the created session; the roadmap is applied asynchronously
    /// as the runner emits planning events. Subscribe for progress.
    ///
    /// # Errors
    ///
    /// `NotFound`, `AlreadyInitialized`, `Busy`.
    pub async fn initialize(
        &self,
        project_id: Uuid,
        opts: InitializeOptions,
    ) -> Result<Session, OrchestratorError> {
        let project = self.store.project(project_id).await?;
        if project.initialized {
            return Err(OrchestratorError::AlreadyInitialized);
        }

        let claim = self
            .registry
            .try_claim(project_id, SessionKind::Initializer)
            .await?;

        let model = opts
            .model
            .or_else(|| project.initializer_model.clone())
            .unwrap_or_else(|| self.config.models.initializer.clone());

        let session = match self
            .store
            .record_session(project_id, SessionKind::Initializer, Some(&model))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.registry.release(project_id, None).await;
                return Err(e.into());
            }
        };
        self.registry.bind_session(project_id, session.id).await;

        scheduler::spawn_init(self.clone(), claim, project, session.clone());

        Ok(session)
    }

    /// Cancel a running initialization and purge the partial roadmap.
    ///
    /// Works after a completed initialization too: the roadmap is removed
    /// and `initialized` cleared, so a re-run starts clean. Returns the
    /// deletion counts.
    ///
    /// # Errors
    ///
    /// `NotFound` if the project does not exist; `Busy` if the active
    /// session is a coding session.
    pub async fn cancel_initialize(
        &self,
        project_id: Uuid,
    ) -> Result<RoadmapCounts, OrchestratorError> {
        self.store.project(project_id).await?;

        if let Some(active) = self.registry.active(project_id).await {
            if active.kind == SessionKind::Coding {
                return Err(OrchestratorError::Busy);
            }
            self.registry.cancel(project_id).await;
            self.wait_for_release(project_id).await;
        }

        let counts = self.store.purge_roadmap(project_id).await?;
        info!(project_id = %project_id, ?counts, "initialization cancelled");
        Ok(counts)
    }

    /// Start the auto-continue coding loop.
    ///
    /// The loop runs until the roadmap is exhausted, `max_iterations`
    /// sessions have run, a stop or cancel is requested, or the completion
    /// gate blocks.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotInitialized`, `Busy`.
    pub async fn start_coding(
        &self,
        project_id: Uuid,
        opts: StartCodingOptions,
    ) -> Result<(), OrchestratorError> {
        let project = self.store.project(project_id).await?;
        if !project.initialized {
            return Err(OrchestratorError::NotInitialized);
        }

        let claim = self
            .registry
            .try_claim(project_id, SessionKind::Coding)
            .await?;

        scheduler::spawn_coding(self.clone(), claim, project, opts);

        Ok(())
    }

    /// Request a cooperative stop: the current session finishes, no new
    /// session starts. Idempotent.
    ///
    /// Returns `true` if a running loop was signalled.
    pub async fn stop_coding(&self, project_id: Uuid) -> Result<bool, OrchestratorError> {
        self.store.project(project_id).await?;
        Ok(self.registry.request_stop(project_id).await)
    }

    /// Cancel the running session immediately. Idempotent.
    ///
    /// Returns `true` if an active session was signalled.
    pub async fn cancel_session(&self, project_id: Uuid) -> Result<bool, OrchestratorError> {
        self.store.project(project_id).await?;
        Ok(self.registry.cancel(project_id).await)
    }

    /// Delete a project and everything it owns.
    ///
    /// Idempotent: deleting an absent project reports zero counts.
    ///
    /// # Errors
    ///
    /// `Busy` while a session is active.
    pub async fn delete_project(
        &self,
        project_id: Uuid,
    ) -> Result<DeletionCounts, OrchestratorError> {
        if self.registry.active(project_id).await.is_some() {
            return Err(OrchestratorError::Busy);
        }

        let counts = match self.store.delete_project(project_id).await {
            Ok(counts) => counts,
            Err(StoreError::NotFound { .. }) => DeletionCounts::default(),
            Err(e) => return Err(e.into()),
        };
        self.events.close_project(project_id);
        Ok(counts)
    }

    /// Resolve a blocked epic's interventions so the next coding loop can
    /// re-verify it.
    ///
    /// Returns the number of interventions resolved.
    pub async fn resolve_intervention(
        &self,
        project_id: Uuid,
        epic_id: Uuid,
    ) -> Result<u64, OrchestratorError> {
        self.store.project(project_id).await?;
        Ok(self.store.resolve_interventions(project_id, epic_id).await?)
    }

    /// Current project status: row, progress, next unit of work, active
    /// session, open interventions.
    pub async fn status(&self, project_id: Uuid) -> Result<ProjectStatus, OrchestratorError> {
        let project = self.store.project(project_id).await?;
        let progress = self.store.progress_snapshot(project_id).await?;
        let next_work = self.store.next_work(project_id).await?;
        let active_session = self.store.active_session(project_id).await?;
        let open_interventions = self.store.open_interventions(project_id).await?;

        Ok(ProjectStatus {
            project,
            progress,
            next_work,
            active_session,
            open_interventions,
        })
    }

    /// Subscribe to a project's subsequent events.
    ///
    /// # Errors
    ///
    /// `NotFound` if the project does not exist.
    pub async fn subscribe(&self, project_id: Uuid) -> Result<Subscription, OrchestratorError> {
        self.store.project(project_id).await?;
        Ok(self.events.subscribe(project_id))
    }

    /// List a project's sessions, newest first. Read-through to the store.
    pub async fn list_sessions(&self, project_id: Uuid) -> Result<Vec<Session>, OrchestratorError> {
        self.store.project(project_id).await?;
        Ok(self.store.sessions(project_id).await?)
    }

    /// Fetch one session. Read-through to the store.
    pub async fn get_session(&self, session_id: Uuid) -> Result<Session, OrchestratorError> {
        Ok(self.store.session(session_id).await?)
    }

    /// Returns `true` while a scheduler loop holds the project's session
    /// slot (including between coding iterations).
    pub async fn is_busy(&self, project_id: Uuid) -> bool {
        self.registry.active(project_id).await.is_some()
    }

    /// Run one reaper sweep now.
    ///
    /// Also used for startup reconciliation: sessions left non-terminal by
    /// a previous process age out here once their heartbeat exceeds the
    /// type-aware threshold.
    pub async fn reap_stale_sessions(&self) -> Result<u64, OrchestratorError> {
        Ok(reaper::sweep(self).await?)
    }

    /// Spawn the background reaper at the configured cadence.
    ///
    /// Exits when `shutdown_rx` observes `true` or the sender is dropped.
    pub fn spawn_reaper(&self, shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let orch = self.clone();
        tokio::spawn(async move {
            reaper::run_reaper(orch, shutdown_rx).await;
        })
    }

    /// Wait briefly for the cancelled session to release the registry
    /// slot; proceeds regardless once the grace period elapses.
    async fn wait_for_release(&self, project_id: Uuid) {
        let grace = Duration::from_secs(self.config.runner.cancel_grace_secs.saturating_add(5));
        let poll = Duration::from_millis(CANCEL_SETTLE_POLL_MS);
        let wait = async {
            while self.registry.active(project_id).await.is_some() {
                tokio::time::sleep(poll).await;
            }
        };
        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!(project_id = %project_id, "cancelled session did not settle before purge");
        }
    }
}
