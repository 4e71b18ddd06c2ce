//! Process-wide index of active sessions.
//!
//! The registry answers "is a session active for this project right now"
//! and enforces the single-active-session rule at claim time; the store is
//! the authority on what has happened. Stop and cancel travel over
//! per-claim `watch` channels: stop is cooperative and read between
//! scheduler iterations, cancel interrupts the running session.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::SessionKind;

/// One registry entry.
struct Entry {
    /// Bound once the session row exists.
    session_id: Option<Uuid>,
    kind: SessionKind,
    started_at: DateTime<Utc>,
    stop_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
}

/// Snapshot of an active session, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSessionInfo {
    /// The bound session, if the row exists yet.
    pub session_id: Option<Uuid>,
    /// Initializer or coding.
    pub kind: SessionKind,
    /// When the slot was claimed.
    pub started_at: DateTime<Utc>,
}

/// Signal receivers handed to the scheduler loop that holds the claim.
#[derive(Debug)]
pub struct ActiveClaim {
    /// The claimed project.
    pub project_id: Uuid,
    /// `true` once a cooperative stop has been requested.
    pub stop_rx: watch::Receiver<bool>,
    /// `true` once cancellation has been requested.
    pub cancel_rx: watch::Receiver<bool>,
}

impl ActiveClaim {
    /// Returns `true` if a cooperative stop has been requested.
    pub fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Returns `true` if cancellation has been requested.
    pub fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

/// The project already has an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("project already has an active session")]
pub struct Busy;

/// In-memory map of `project_id → active session`, guarded by a mutex.
/// All operations are O(1).
pub struct SessionRegistry {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the project's single session slot.
    ///
    /// # Errors
    ///
    /// Returns [`Busy`] if any entry exists for the project.
    pub async fn try_claim(
        &self,
        project_id: Uuid,
        kind: SessionKind,
    ) -> Result<ActiveClaim, Busy> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&project_id) {
            return Err(Busy);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        entries.insert(
            project_id,
            Entry {
                session_id: None,
                kind,
                started_at: Utc::now(),
                stop_tx,
                cancel_tx,
            },
        );
        debug!(project_id = %project_id, kind = kind.as_str(), "registry slot claimed");

        Ok(ActiveClaim {
            project_id,
            stop_rx,
            cancel_rx,
        })
    }

    /// Bind the session row id to the held claim.
    ///
    /// No-op if the project has no entry (already released).
    pub async fn bind_session(&self, project_id: Uuid, session_id: Uuid) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&project_id) {
            entry.session_id = Some(session_id);
        }
    }

    /// Release the slot held for `session_id`.
    ///
    /// Idempotent: releasing an absent entry, or one bound to a different
    /// session, is a no-op.
    pub async fn release(&self, project_id: Uuid, session_id: Option<Uuid>) {
        let mut entries = self.entries.lock().await;
        let matches = entries
            .get(&project_id)
            .is_some_and(|entry| entry.session_id == session_id);
        if matches {
            entries.remove(&project_id);
            debug!(project_id = %project_id, "registry slot released");
        }
    }

    /// Signal cancellation to the held session, if any.
    ///
    /// Returns `true` if a claim was signalled. Idempotent.
    pub async fn cancel(&self, project_id: Uuid) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(&project_id) {
            Some(entry) => {
                if entry.cancel_tx.send(true).is_err() {
                    warn!(project_id = %project_id, "cancel receiver already gone");
                }
                true
            }
            None => false,
        }
    }

    /// Set the stop flag observed by the scheduler between iterations.
    ///
    /// Returns `true` if a claim was signalled. Idempotent; the current
    /// session is unaffected.
    pub async fn request_stop(&self, project_id: Uuid) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(&project_id) {
            Some(entry) => {
                if entry.stop_tx.send(true).is_err() {
                    warn!(project_id = %project_id, "stop receiver already gone");
                }
                true
            }
            None => false,
        }
    }

    /// Snapshot the active session for a project, if any.
    pub async fn active(&self, project_id: Uuid) -> Option<ActiveSessionInfo> {
        let entries = self.entries.lock().await;
        entries.get(&project_id).map(|entry| ActiveSessionInfo {
            session_id: entry.session_id,
            kind: entry.kind,
            started_at: entry.started_at,
        })
    }

    /// Unconditionally remove a project's entry, returning what was held.
    ///
    /// Supervision only: used when a scheduler task panicked and cannot
    /// release its own slot.
    pub(crate) async fn force_release(&self, project_id: Uuid) -> Option<ActiveSessionInfo> {
        let mut entries = self.entries.lock().await;
        entries.remove(&project_id).map(|entry| ActiveSessionInfo {
            session_id: entry.session_id,
            kind: entry.kind,
            started_at: entry.started_at,
        })
    }

    /// Returns `true` if any claim is bound to `session_id`.
    ///
    /// Used by the reaper to avoid failing a session the process still
    /// drives.
    pub async fn holds_session(&self, session_id: Uuid) -> bool {
        let entries = self.entries.lock().await;
        entries
            .values()
            .any(|entry| entry.session_id == Some(session_id))
    }

    /// Number of active claims across all projects.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns `true` when no claims are held.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
