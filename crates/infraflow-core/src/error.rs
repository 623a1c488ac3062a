//! Error taxonomy for pipeline runs.
//!
//! Task-local failures never surface here: they become `Outcome::Failed`
//! entries in a [`crate::runner::TaskResult`]. The variants below are the
//! conditions that abort a stage or the whole run.

use thiserror::Error;

/// Errors produced by the orchestration layer.
///
/// Every variant owns its data as strings so a run record can keep the error
/// that halted it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A required parameter is absent or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A scanner crashed, could not be started, or exceeded its budget.
    #[error("scanner {scanner} execution error: {reason}")]
    ScannerExecution { scanner: String, reason: String },

    /// A scanner ran to completion but its findings breach the threshold.
    #[error("scanner {scanner} reported a policy violation (exit code {exit_code})")]
    PolicyViolation { scanner: String, exit_code: i32 },

    /// Backend access could not be established before planning.
    #[error("backend authentication failed: {0}")]
    BackendAuth(String),

    /// The plan command did not run to completion.
    #[error("plan execution failed: {0}")]
    PlanExecution(String),

    /// The plan summary matched no known pattern.
    #[error("plan summary could not be parsed: {0}")]
    PlanParse(#[from] PlanParseError),

    /// Signing the plan artifact failed.
    #[error("attestation failed: {0}")]
    Attestation(String),

    /// A dependency edge would introduce a cycle.
    #[error("dependency cycle detected involving stages: {stages:?}")]
    GraphCycle { stages: Vec<String> },

    /// A referenced stage is not part of the graph.
    #[error("stage not found in graph: {stage}")]
    StageNotFound { stage: String },

    /// Report or artifact storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stage task ended without producing a result (panicked or cancelled).
    #[error("stage {stage} aborted: {reason}")]
    StageAborted { stage: String, reason: String },
}

impl PipelineError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration_error",
            PipelineError::ScannerExecution { .. } => "scanner_execution_error",
            PipelineError::PolicyViolation { .. } => "policy_violation",
            PipelineError::BackendAuth(_) => "backend_auth_error",
            PipelineError::PlanExecution(_) => "plan_execution_error",
            PipelineError::PlanParse(_) => "plan_parse_error",
            PipelineError::Attestation(_) => "attestation_error",
            PipelineError::GraphCycle { .. } => "graph_cycle",
            PipelineError::StageNotFound { .. } => "stage_not_found",
            PipelineError::Storage(_) => "storage_error",
            PipelineError::StageAborted { .. } => "stage_aborted",
        }
    }
}

/// The plan summary did not contain a recognized resource-count line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no resource-count summary found in plan output ({excerpt:?})")]
pub struct PlanParseError {
    /// Trailing portion of the summary, for diagnostics.
    pub excerpt: String,
}

/// Errors returned by external tool collaborators (scanners, plan, validate).
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("empty command for {0}")]
    EmptyCommand(String),

    #[error("backend initialisation failed: {0}")]
    BackendInit(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type for orchestration operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
