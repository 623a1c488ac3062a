//! infraflow core library
//!
//! Orchestrates an infrastructure-change validation run: validate, a
//! parallel fan-out of policy scanners, an aggregation gate, a plan stage
//! with change detection, and attestation of non-empty plans.

pub mod aggregate;
pub mod attest;
pub mod config;
pub mod digest;
pub mod error;
pub mod fakes;
pub mod graph;
pub mod obs;
pub mod outcome;
pub mod pipeline;
pub mod plan;
pub mod process;
pub mod report;
pub mod runner;
pub mod scanner;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;
pub mod validate;

pub use aggregate::{aggregate, scan_group_outcome, AggregateResult};
pub use attest::{
    verify_attestation, AttestOutcome, Attestation, AttestationGate, Ed25519Signer, Signer,
};
pub use config::{PlanSettings, RunConfig, RunConfigBuilder, ScannerConfig, ValidateSettings};
pub use error::{PipelineError, PipelineResult, PlanParseError, ToolError};
pub use graph::{StageGraph, StageKind, StageNode};
pub use outcome::{GatingPolicy, Outcome, SkipReason, StageState};
pub use pipeline::{Collaborators, Pipeline, PipelineRun};
pub use plan::{
    classify, parse_plan_summary, ChangeCounts, PlanOutput, PlanPhase, PlanRequest, PlanResult,
    PlanStage, PlanState, PlanTool, TerraformPlanTool, CHANGES_DETECTED_EXIT_SIGNAL,
};
pub use report::{FsReportStore, MemoryReportStore, ReportCategory, ReportRef, ReportStore};
pub use runner::{CommandScanner, ScanOutput, ScanRequest, Scanner, TaskFailure, TaskResult, TaskRunner};
pub use scanner::{BuiltinScanner, SeverityThreshold};
pub use scheduler::{ScheduleReport, Scheduler, StageHalt, StageHandler, StageRecord, Transition};
pub use validate::{TerraformValidator, ValidateOutput, ValidateRequest, Validator};

pub use obs::run_span;
pub use telemetry::init_tracing;

/// infraflow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
