//! Outcome model shared by every task and stage.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal result of a task or stage. There is no "unknown" variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed)
    }

    /// Outcome for a completed process exit status.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a stage was skipped. Keeps "disabled" observably distinct from
/// "blocked by an upstream failure".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Turned off by configuration.
    Disabled,
    /// A non-continuable upstream stage failed.
    UpstreamFailed { stage: String },
    /// The run was halted by a fatal error in another stage.
    RunHalted { stage: String },
    /// The stage has nothing to do for this run (attesting an empty plan).
    NotApplicable,
}

impl SkipReason {
    /// Whether this skip must propagate to dependents.
    pub fn blocks_dependents(&self) -> bool {
        matches!(
            self,
            SkipReason::UpstreamFailed { .. } | SkipReason::RunHalted { .. }
        )
    }
}

/// Whether a failing stage stops its dependents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatingPolicy {
    /// Failure skips every dependent stage.
    #[default]
    Strict,
    /// Failure is recorded but dependents still run.
    ReportingOnly,
}

impl GatingPolicy {
    /// Map a `continueOnError` flag onto a policy.
    pub fn from_continue_on_error(continue_on_error: bool) -> Self {
        if continue_on_error {
            GatingPolicy::ReportingOnly
        } else {
            GatingPolicy::Strict
        }
    }

    pub fn continues_on_error(&self) -> bool {
        matches!(self, GatingPolicy::ReportingOnly)
    }
}

/// Lifecycle state of a stage.
///
/// `Pending -> Running -> {Succeeded, Failed}` on execution, or
/// `Pending -> Skipped` directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Done { outcome: Outcome },
    Skipped { skip: SkipReason },
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Done { .. } | StageState::Skipped { .. })
    }

    /// Terminal outcome, if reached.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            StageState::Done { outcome } => Some(*outcome),
            StageState::Skipped { .. } => Some(Outcome::Skipped),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            StageState::Skipped { skip } => Some(skip),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &StageState) -> bool {
        match (self, next) {
            (StageState::Pending, StageState::Running) => true,
            (StageState::Pending, StageState::Skipped { .. }) => true,
            (StageState::Running, StageState::Done { outcome }) => {
                matches!(outcome, Outcome::Succeeded | Outcome::Failed)
            }
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Done {
                outcome: Outcome::Succeeded,
            } => "succeeded",
            StageState::Done {
                outcome: Outcome::Failed,
            } => "failed",
            StageState::Done {
                outcome: Outcome::Skipped,
            }
            | StageState::Skipped { .. } => "skipped",
        }
    }
}
