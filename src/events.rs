//! Per-project ordered event fan-out.
//!
//! The orchestrator publishes [`ProjectEvent`]s; any number of live
//! subscribers consume them independently. Each subscriber owns a bounded
//! buffer: a slow consumer never blocks the publisher or its peers.
//! On overflow the oldest non-terminal events are dropped and folded into
//! a single synthetic [`ProjectEvent::Lagged`] delivered at the gap;
//! terminal events ([`ProjectEvent::SessionComplete`],
//! [`ProjectEvent::SessionError`]) are never dropped, even if that lets
//! the buffer exceed its bound. There is no replay: a fresh subscriber
//! sees only subsequent events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::store::{ProgressSnapshot, SessionKind, SessionStatus};

/// A progress event observed by project subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProjectEvent {
    /// A session began running.
    SessionStarted {
        /// The session.
        session_id: Uuid,
        /// Per-project ordinal.
        number: i64,
        /// Initializer or coding.
        kind: SessionKind,
    },
    /// The runner invoked a tool.
    ToolUse {
        /// Tool name as reported by the runner.
        tool_name: String,
        /// Tool invocations so far in this session.
        cumulative_count: u64,
    },
    /// The runner produced an assistant message.
    AssistantMessage {
        /// Message text.
        text: String,
        /// When it was observed.
        ts: DateTime<Utc>,
    },
    /// Roadmap progress changed.
    ProgressUpdate {
        /// Snapshot computed from store rows.
        snapshot: ProgressSnapshot,
    },
    /// Terminal: the session ended without a runtime error.
    SessionComplete {
        /// The session.
        session_id: Uuid,
        /// Final status (completed or cancelled).
        status: SessionStatus,
        /// Wall-clock duration in seconds.
        duration_s: u64,
    },
    /// Terminal: the session failed.
    SessionError {
        /// The session.
        session_id: Uuid,
        /// Stable error code (`stale`, `cancel_timeout`,
        /// `epic_test_blocked`, `runner_failed`).
        code: String,
        /// Human-readable detail.
        detail: String,
        /// Structured gate data, present when `code` is
        /// `epic_test_blocked`.
        #[serde(skip_serializing_if = "Option::is_none")]
        blocked_epic: Option<BlockedEpic>,
    },
    /// Synthetic: this subscriber fell behind and events were dropped.
    Lagged {
        /// How many events were dropped.
        dropped: u64,
    },
}

impl ProjectEvent {
    /// Returns `true` for events that must never be dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectEvent::SessionComplete { .. } | ProjectEvent::SessionError { .. }
        )
    }
}

/// The epic the completion gate blocked, as carried by
/// [`ProjectEvent::SessionError`]. Subscribers get the ids directly
/// instead of parsing them out of the detail text.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedEpic {
    /// The blocked epic.
    pub epic_id: Uuid,
    /// Ids of the failing epic-tests.
    pub failing_ids: Vec<String>,
}

/// Buffer state for one subscriber.
struct SubscriberState {
    queue: VecDeque<ProjectEvent>,
    dropped: u64,
    closed: bool,
}

/// Shared between the bus (publisher side) and a [`Subscription`].
struct SubscriberShared {
    state: Mutex<SubscriberState>,
    notify: Notify,
}

impl SubscriberShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SubscriberState {
                queue: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.notify.notify_one();
    }
}

/// A live subscription to one project's event stream.
///
/// Dropping the handle unsubscribes; doing so twice is impossible and
/// unsubscribing an already-closed stream is a no-op, so release is
/// idempotent.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    /// Receive the next event in publication order.
    ///
    /// Returns `None` once the stream is closed (project deleted) and the
    /// buffer is drained. A gap from dropped events is reported as one
    /// [`ProjectEvent::Lagged`] before the next surviving event.
    pub async fn recv(&mut self) -> Option<ProjectEvent> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().ok()?;
                if state.dropped > 0 {
                    let dropped = state.dropped;
                    state.dropped = 0;
                    return Some(ProjectEvent::Lagged { dropped });
                }
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Explicitly release the subscription; equivalent to dropping it.
    pub fn unsubscribe(self) {
        // Drop impl does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Per-project event fan-out with bounded per-subscriber buffers.
pub struct EventBus {
    subscribers: Mutex<HashMap<Uuid, Vec<Arc<SubscriberShared>>>>,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a project's subsequent events.
    pub fn subscribe(&self, project_id: Uuid) -> Subscription {
        let shared = Arc::new(SubscriberShared::new());
        if let Ok(mut map) = self.subscribers.lock() {
            map.entry(project_id).or_default().push(Arc::clone(&shared));
        }
        debug!(project_id = %project_id, "subscriber attached");
        Subscription { shared }
    }

    /// Publish an event to every live subscriber of a project.
    ///
    /// Non-blocking: slow subscribers lose their oldest non-terminal
    /// events instead of exerting backpressure. Dead subscribers are
    /// pruned in passing.
    pub fn publish(&self, project_id: Uuid, event: &ProjectEvent) {
        let Ok(mut map) = self.subscribers.lock() else {
            return;
        };
        let Some(subs) = map.get_mut(&project_id) else {
            return;
        };

        subs.retain(|shared| {
            let Ok(mut state) = shared.state.lock() else {
                return false;
            };
            if state.closed {
                return false;
            }

            if state.queue.len() >= self.capacity {
                // Shed the oldest event that is safe to lose.
                match state.queue.iter().position(|e| !e.is_terminal()) {
                    Some(idx) => {
                        let _ = state.queue.remove(idx);
                        state.dropped = state.dropped.saturating_add(1);
                    }
                    None => {
                        // Only terminal events buffered; keep them all.
                    }
                }
            }
            state.queue.push_back(event.clone());
            drop(state);
            shared.notify.notify_one();
            true
        });

        if subs.is_empty() {
            map.remove(&project_id);
        }
    }

    /// Close every subscription for a project, ending their streams.
    ///
    /// Called when the project is deleted; subscribers drain what they
    /// have already received and then observe end-of-stream.
    pub fn close_project(&self, project_id: Uuid) {
        let shared = {
            let Ok(mut map) = self.subscribers.lock() else {
                return;
            };
            map.remove(&project_id)
        };
        if let Some(subs) = shared {
            for sub in subs {
                sub.close();
            }
        }
    }

    /// Number of live subscribers for a project.
    pub fn subscriber_count(&self, project_id: Uuid) -> usize {
        self.subscribers
            .lock()
            .ok()
            .and_then(|map| map.get(&project_id).map(Vec::len))
            .unwrap_or(0)
    }
}
