//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span via [`run_span`]
//! - Emission functions for lifecycle events, each tagged with a stable
//!   `event` field so log pipelines can filter on it
//!
//! Events are emitted at `info!` level, halts at `warn!`. Filtering follows
//! `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::outcome::{Outcome, SkipReason};

/// Span tagging every event of one run with its id and environment.
///
/// Attach it to the run future with `tracing::Instrument` rather than
/// entering it, so the future stays `Send`:
///
/// ```ignore
/// execute(config).instrument(run_span(&run_id, "prod")).await
/// ```
pub fn run_span(run_id: &str, environment: &str) -> tracing::Span {
    tracing::info_span!("infraflow.run", run_id = %run_id, environment = %environment)
}

pub fn emit_run_started(run_id: &str, environment: &str, stages: usize) {
    info!(event = "run.started", run_id = %run_id, environment = %environment, stages);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, exit_code: i32) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms,
        exit_code,
        success = exit_code == 0,
    );
}

/// A fatal error stopped the run; pending stages will be skipped.
pub fn emit_run_halted(stage: &str, error: &PipelineError) {
    warn!(event = "run.halted", stage = %stage, kind = error.kind(), error = %error);
}

pub fn emit_stage_started(stage: &str) {
    info!(event = "stage.started", stage = %stage);
}

pub fn emit_stage_finished(stage: &str, outcome: Outcome, duration_ms: u64) {
    info!(event = "stage.finished", stage = %stage, outcome = %outcome, duration_ms);
}

pub fn emit_stage_skipped(stage: &str, reason: &SkipReason) {
    info!(event = "stage.skipped", stage = %stage, reason = ?reason);
}

/// Aggregation gate decided.
pub fn emit_gate_evaluated(enabled: usize, failing: &[&str], passed: bool) {
    info!(
        event = "gate.evaluated",
        enabled,
        failing = ?failing,
        passed,
    );
}
