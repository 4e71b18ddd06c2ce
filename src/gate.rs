//! Completion gating policy for tasks and epics.
//!
//! The gate is a pure function of roadmap rows: given the tally of an
//! epic's test results and the project's testing mode, it decides whether
//! the epic completes, stays in progress, or blocks pending human
//! intervention. The store applies these decisions transactionally; this
//! module holds no state and performs no I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GateConfig;

/// How a project treats failing epic-tests at completion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpicTestingMode {
    /// Any failing epic-test blocks the epic.
    Strict,
    /// Failures are tolerated up to a limit, except on critical epics.
    Autonomous,
}

/// Error for an unrecognised testing-mode value read from storage.
#[derive(Debug, Error)]
#[error("invalid epic_testing_mode value: {0:?}")]
pub struct InvalidMode(
    /// The rejected value.
    pub String,
);

impl EpicTestingMode {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Autonomous => "autonomous",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidMode`] if the value is not a recognised mode.
    pub fn parse(s: &str) -> Result<Self, InvalidMode> {
        match s {
            "strict" => Ok(Self::Strict),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(InvalidMode(other.to_owned())),
        }
    }
}

/// Tally of an epic's test results at gating time.
///
/// `pending` counts tests that have never run as well as `skipped` and
/// `error` outcomes: none of those pass the epic, but none of them count
/// toward the failure tolerance either.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpicTestTally {
    /// Tests whose last result is `passed`.
    pub passed: u32,
    /// Tests whose last result is `failed`.
    pub failed: u32,
    /// Tests that are unrun, skipped, or errored.
    pub pending: u32,
    /// Ids of the tests counted in `failed`.
    pub failing_ids: Vec<String>,
}

impl EpicTestTally {
    /// Total number of epic-tests in the tally.
    pub fn total(&self) -> u32 {
        self.passed
            .saturating_add(self.failed)
            .saturating_add(self.pending)
    }
}

/// Why a blocked epic was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// The project runs in strict mode and at least one epic-test failed.
    StrictMode,
    /// The epic's name matches a configured critical keyword.
    CriticalEpic,
    /// More epic-tests failed than the autonomous tolerance allows.
    ToleranceExceeded,
}

impl BlockReason {
    /// Human-readable form used in intervention rows and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrictMode => "strict_mode",
            Self::CriticalEpic => "critical_epic",
            Self::ToleranceExceeded => "tolerance_exceeded",
        }
    }
}

/// Outcome of gating one epic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpicGateOutcome {
    /// Every epic-test passed; the epic completes.
    Completed,
    /// Unrun tests remain, or failures are tolerated; the epic stays in
    /// progress and is never marked completed.
    InProgress,
    /// The epic must block pending intervention.
    Blocked {
        /// Ids of the failing epic-tests.
        failing_ids: Vec<String>,
        /// Why the block fired.
        reason: BlockReason,
    },
}

/// Returns `true` when the epic name marks it as critical.
///
/// Matching is a case-insensitive substring check against the configured
/// keyword set.
pub fn is_critical_epic(epic_name: &str, keywords: &[String]) -> bool {
    let name = epic_name.to_lowercase();
    keywords.iter().any(|k| name.contains(&k.to_lowercase()))
}

/// Gate an epic whose tasks are all done.
///
/// Pure: the decision depends only on the arguments, never on event
/// ordering or prior gate invocations.
pub fn classify_epic(
    mode: EpicTestingMode,
    epic_name: &str,
    tally: &EpicTestTally,
    config: &GateConfig,
) -> EpicGateOutcome {
    if tally.failed > 0 {
        let blocked_reason = match mode {
            EpicTestingMode::Strict => Some(BlockReason::StrictMode),
            EpicTestingMode::Autonomous => {
                if is_critical_epic(epic_name, &config.critical_epic_keywords) {
                    Some(BlockReason::CriticalEpic)
                } else if tally.failed > config.auto_failure_tolerance {
                    Some(BlockReason::ToleranceExceeded)
                } else {
                    None
                }
            }
        };
        return match blocked_reason {
            Some(reason) => EpicGateOutcome::Blocked {
                failing_ids: tally.failing_ids.clone(),
                reason,
            },
            None => EpicGateOutcome::InProgress,
        };
    }

    if tally.pending > 0 {
        return EpicGateOutcome::InProgress;
    }

    EpicGateOutcome::Completed
}

/// Returns `true` when crossing `completed_count` total completed epics
/// should record a retest recommendation.
pub fn retest_due(completed_count: u32, stride: u32) -> bool {
    stride > 0 && completed_count > 0 && completed_count.is_multiple_of(stride)
}
