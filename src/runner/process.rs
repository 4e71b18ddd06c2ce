//! Agent driver as a child process.
//!
//! [`ProcessRunner`] launches the configured agent command once per
//! session, hands it the session payload on stdin as a single JSON
//! document, and decodes newline-delimited JSON events from its stdout.
//! stderr is forwarded to the log. A line of the form
//! `{"type": "session_result", "metrics": {...}}` carries the final
//! metrics; otherwise the exit status decides the outcome. Cancellation
//! kills the child and reports `Cancelled`.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::RunnerConfig;
use crate::store::SessionMetrics;

use super::{
    CodingDirective, RunnerError, RunnerEvent, RunnerOutcome, SessionContext, SessionRunner,
};

/// Runs the external agent driver as one child process per session.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

/// Payload written to the child's stdin.
#[derive(Serialize)]
struct SessionPayload<'a> {
    context: &'a SessionContext,
    #[serde(flatten)]
    work: PayloadWork<'a>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PayloadWork<'a> {
    Init {
        spec: &'a str,
    },
    Coding {
        #[serde(flatten)]
        directive: &'a CodingDirective,
    },
}

impl ProcessRunner {
    /// Create a runner from the configured command line.
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Spawn the agent command with piped stdio.
    fn spawn(&self) -> Result<Child, RunnerError> {
        Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                command: self.config.command.clone(),
                source,
            })
    }

    /// Drive one spawned session to its terminal outcome.
    async fn drive(
        &self,
        payload: SessionPayload<'_>,
        events: mpsc::Sender<RunnerEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunnerOutcome, RunnerError> {
        let mut child = self.spawn()?;

        // Hand over the payload and close stdin so the child sees EOF.
        let payload_json = serde_json::to_vec(&payload)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload_json).await?;
            stdin.write_all(b"\n").await?;
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            RunnerError::Io(std::io::Error::other("runner stdout not captured"))
        })?;
        let mut lines = BufReader::new(stdout).lines();

        if let Some(stderr) = child.stderr.take() {
            let command = self.config.command.clone();
            tokio::spawn(async move {
                let mut err_lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = err_lines.next_line().await {
                    debug!(runner = %command, "{line}");
                }
            });
        }

        let mut metrics: Option<SessionMetrics> = None;
        let mut cancelled = false;
        let mut watch_cancel = true;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match decode_line(&line) {
                                Ok(WireLine::Event(event)) => {
                                    if events.send(event).await.is_err() {
                                        // Observer gone; keep draining so the
                                        // child can exit cleanly.
                                        debug!("event receiver dropped, draining runner output");
                                    }
                                }
                                Ok(WireLine::Result(m)) => metrics = Some(m),
                                Err(e) => {
                                    warn!(error = %e, line = %line, "undecodable runner event, skipping");
                                }
                            }
                        }
                        None => break,
                    }
                }
                changed = cancel.changed(), if watch_cancel => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            cancelled = true;
                            watch_cancel = false;
                            debug!("cancel requested, killing runner process");
                            if let Err(e) = child.start_kill() {
                                warn!(error = %e, "failed to kill runner process");
                            }
                        }
                        Ok(()) => {}
                        Err(_) => watch_cancel = false,
                    }
                }
            }
        }

        let status = child.wait().await?;

        if cancelled {
            return Ok(RunnerOutcome::Cancelled);
        }
        if let Some(metrics) = metrics {
            return Ok(RunnerOutcome::Completed(metrics));
        }
        if status.success() {
            return Ok(RunnerOutcome::Completed(SessionMetrics::default()));
        }
        Ok(RunnerOutcome::Failed {
            error: format!("runner exited with {status}"),
        })
    }
}

/// A decoded stdout line.
enum WireLine {
    /// A session event to forward.
    Event(RunnerEvent),
    /// The final metrics report.
    Result(SessionMetrics),
}

/// Decode one stdout line.
///
/// `session_result` lines are intercepted here; everything else must be a
/// [`RunnerEvent`].
fn decode_line(line: &str) -> Result<WireLine, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("type").and_then(|t| t.as_str()) == Some("session_result") {
        let metrics = value
            .get("metrics")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        return Ok(WireLine::Result(metrics));
    }
    Ok(WireLine::Event(serde_json::from_value(value)?))
}

#[async_trait]
impl SessionRunner for ProcessRunner {
    async fn run_init(
        &self,
        ctx: &SessionContext,
        spec: &str,
        events: mpsc::Sender<RunnerEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunnerOutcome, RunnerError> {
        let payload = SessionPayload {
            context: ctx,
            work: PayloadWork::Init { spec },
        };
        self.drive(payload, events, cancel).await
    }

    async fn run_coding(
        &self,
        ctx: &SessionContext,
        directive: &CodingDirective,
        events: mpsc::Sender<RunnerEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunnerOutcome, RunnerError> {
        let payload = SessionPayload {
            context: ctx,
            work: PayloadWork::Coding { directive },
        };
        self.drive(payload, events, cancel).await
    }
}
