//! End-to-end pipeline run.
//!
//! [`Pipeline::run`] builds the standard stage graph for a [`RunConfig`],
//! drives it through the [`Scheduler`] and returns a [`PipelineRun`] record.
//! Each stage kind is backed by one collaborator:
//!
//! | stage        | collaborator                         |
//! |--------------|--------------------------------------|
//! | `validate`   | [`Validator`]                        |
//! | `scan:<name>`| [`TaskRunner`] over a [`Scanner`]    |
//! | `aggregate`  | [`aggregate`] (pure)                 |
//! | `plan`       | [`PlanStage`] over a [`PlanTool`]    |
//! | `attest`     | [`AttestationGate`] over a [`Signer`] |

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{aggregate, scan_group_outcome, AggregateResult};
use crate::attest::{AttestOutcome, AttestationGate, Signer};
use crate::config::RunConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::graph::{StageGraph, StageKind, StageNode};
use crate::obs;
use crate::outcome::{GatingPolicy, Outcome, SkipReason};
use crate::plan::{PlanRequest, PlanResult, PlanStage, PlanTool, TerraformPlanTool};
use crate::report::{ReportCategory, ReportStore};
use crate::runner::{CommandScanner, Scanner, TaskResult, TaskRunner};
use crate::scheduler::{Scheduler, StageHalt, StageHandler, StageRecord, Transition};
use crate::validate::{TerraformValidator, ValidateRequest, Validator};

/// External tools and stores a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn Validator>,
    pub scanner: Arc<dyn Scanner>,
    pub plan_tool: Arc<dyn PlanTool>,
    pub signer: Arc<dyn Signer>,
    pub store: Arc<dyn ReportStore>,
}

impl Collaborators {
    /// Command-line terraform tooling with the given signer and store.
    pub fn terraform(signer: Arc<dyn Signer>, store: Arc<dyn ReportStore>) -> Self {
        Self {
            validator: Arc::new(TerraformValidator::default()),
            scanner: Arc::new(CommandScanner::new()),
            plan_tool: Arc::new(TerraformPlanTool::default()),
            signer,
            store,
        }
    }
}

/// Record of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub environment: String,
    pub stages: BTreeMap<String, StageRecord>,
    pub transitions: Vec<Transition>,
    /// One entry per scanner that reached the task runner.
    pub task_results: Vec<TaskResult>,
    /// Rollup of the scan stage group, honouring each scanner's
    /// `continue_on_error`.
    pub scan_group: Outcome,
    pub aggregate: Option<AggregateResult>,
    pub plan: Option<PlanResult>,
    pub attestation: Option<AttestOutcome>,
    pub halted_by: Option<StageHalt>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Process exit code for the run.
    ///
    /// Nonzero when the run was halted by a fatal error, a `Strict` stage
    /// failed, or the scan group failed. Zero otherwise, whether or not the
    /// plan had changes.
    pub fn exit_code(&self) -> i32 {
        let strict_failure = self.stages.values().any(|r| {
            r.policy == GatingPolicy::Strict
                && r.state.outcome() == Some(Outcome::Failed)
        });
        if self.halted_by.is_some() || strict_failure || self.scan_group == Outcome::Failed {
            1
        } else {
            0
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == 0
    }

    pub fn stage_outcome(&self, stage: &str) -> Option<Outcome> {
        self.stages.get(stage).and_then(|r| r.state.outcome())
    }

    pub fn skip_reason(&self, stage: &str) -> Option<&SkipReason> {
        self.stages.get(stage).and_then(|r| r.state.skip_reason())
    }

    pub fn task_result(&self, scanner: &str) -> Option<&TaskResult> {
        self.task_results.iter().find(|r| r.scanner_name == scanner)
    }
}

/// A configured pipeline, ready to run.
pub struct Pipeline {
    config: Arc<RunConfig>,
    collaborators: Collaborators,
    subject_identity: String,
    max_concurrency: Option<usize>,
}

impl Pipeline {
    pub fn new(
        config: RunConfig,
        collaborators: Collaborators,
        subject_identity: impl Into<String>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            collaborators,
            subject_identity: subject_identity.into(),
            max_concurrency: None,
        }
    }

    /// Cap concurrently executing stages. Unlimited by default.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn graph(&self) -> PipelineResult<StageGraph> {
        StageGraph::standard(&self.config)
    }

    /// Execute the pipeline once.
    ///
    /// Stage failures and fatal errors are reported in the returned record;
    /// `Err` is only returned when the stage graph cannot be built.
    pub async fn run(&self) -> PipelineResult<PipelineRun> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id, &self.config.environment);
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&self, run_id: String) -> PipelineResult<PipelineRun> {
        let graph = self.graph()?;
        let started_at = Utc::now();
        let clock = Instant::now();
        obs::emit_run_started(&run_id, &self.config.environment, graph.len());

        let handler = Arc::new(PipelineHandler::new(
            Arc::clone(&self.config),
            &self.collaborators,
            &self.subject_identity,
        ));
        let mut scheduler = Scheduler::new(graph);
        if let Some(limit) = self.max_concurrency {
            scheduler = scheduler.with_max_concurrency(limit);
        }
        let report = scheduler.run(Arc::clone(&handler)).await?;

        let collected = handler.take();
        let task_results: Vec<TaskResult> = self
            .config
            .scanners
            .iter()
            .filter_map(|s| collected.task_results.get(&s.name).cloned())
            .collect();

        let run = PipelineRun {
            run_id,
            environment: self.config.environment.clone(),
            stages: report.stages,
            transitions: report.transitions,
            scan_group: scan_group_outcome(&task_results),
            task_results,
            aggregate: collected.aggregate,
            plan: collected.plan,
            attestation: collected.attestation,
            halted_by: report.halted,
            started_at,
            finished_at: Utc::now(),
        };
        obs::emit_run_finished(
            &run.run_id,
            clock.elapsed().as_millis() as u64,
            run.exit_code(),
        );
        Ok(run)
    }
}

/// Results gathered by stages as they finish.
#[derive(Debug, Default)]
struct Collected {
    task_results: BTreeMap<String, TaskResult>,
    aggregate: Option<AggregateResult>,
    plan: Option<PlanResult>,
    attestation: Option<AttestOutcome>,
}

struct PipelineHandler {
    config: Arc<RunConfig>,
    validator: Arc<dyn Validator>,
    runner: TaskRunner,
    plan_tool: Arc<dyn PlanTool>,
    gate: AttestationGate,
    collected: Mutex<Collected>,
}

impl PipelineHandler {
    fn new(config: Arc<RunConfig>, c: &Collaborators, subject_identity: &str) -> Self {
        Self {
            runner: TaskRunner::new(
                Arc::clone(&c.scanner),
                Arc::clone(&c.store),
                config.environment.clone(),
                config.isolate_scans,
            ),
            gate: AttestationGate::new(
                Arc::clone(&c.signer),
                Arc::clone(&c.store),
                config.environment.clone(),
                subject_identity,
            ),
            validator: Arc::clone(&c.validator),
            plan_tool: Arc::clone(&c.plan_tool),
            config,
            collected: Mutex::new(Collected::default()),
        }
    }

    fn collected(&self) -> MutexGuard<'_, Collected> {
        // Poisoned only if a stage task panicked mid-write.
        self.collected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self) -> Collected {
        std::mem::take(&mut *self.collected())
    }

    async fn validate(&self) -> Outcome {
        let request = ValidateRequest {
            environment: self.config.environment.clone(),
            working_directory: self.config.working_directory.clone(),
        };
        let budget = Duration::from_secs(self.config.validate.timeout_secs);
        match tokio::time::timeout(budget, self.validator.validate(&request)).await {
            Ok(Ok(output)) => {
                if output.outcome.is_failure() {
                    warn!(diagnostics = %output.diagnostics.trim(), "validation failed");
                }
                output.outcome
            }
            Ok(Err(e)) => {
                warn!(error = %e, "validator could not run");
                Outcome::Failed
            }
            Err(_) => {
                warn!(budget_secs = budget.as_secs(), "validation timed out");
                Outcome::Failed
            }
        }
    }

    async fn scan(&self, scanner: &str) -> PipelineResult<Outcome> {
        let config = self
            .config
            .scanner(scanner)
            .ok_or_else(|| PipelineError::StageNotFound {
                stage: format!("scan:{scanner}"),
            })?;
        let result = self.runner.run(config).await;
        let outcome = result.outcome;
        self.collected()
            .task_results
            .insert(result.scanner_name.clone(), result);
        Ok(outcome)
    }

    fn aggregate(&self) -> Outcome {
        let mut collected = self.collected();
        let results: Vec<TaskResult> = collected.task_results.values().cloned().collect();
        let result = aggregate(&self.config.scanners, &results);
        obs::emit_gate_evaluated(
            self.config.enabled_scanners().count(),
            &result.failing(),
            result.all_passed,
        );
        let outcome = result.outcome();
        collected.aggregate = Some(result);
        outcome
    }

    async fn plan(&self) -> PipelineResult<Outcome> {
        let request = PlanRequest::for_run(&self.config);
        let budget = Duration::from_secs(self.config.plan.timeout_secs);
        let result = PlanStage::new(Arc::clone(&self.plan_tool))
            .execute(&request, budget)
            .await;
        let error = result.error.clone();
        self.collected().plan = Some(result);
        match error {
            Some(e) => Err(e),
            None => Ok(Outcome::Succeeded),
        }
    }

    async fn attest(&self) -> PipelineResult<Outcome> {
        let plan = self.collected().plan.clone().ok_or_else(|| {
            PipelineError::Attestation("no plan result to attest".to_string())
        })?;
        let outcome = self.gate.attest(&plan).await?;
        self.collected().attestation = Some(outcome);
        Ok(Outcome::Succeeded)
    }
}

#[async_trait]
impl StageHandler for PipelineHandler {
    fn precondition(&self, node: &StageNode) -> Option<SkipReason> {
        match &node.kind {
            StageKind::Scan(name) => {
                let config = self.config.scanner(name)?;
                if config.enabled {
                    return None;
                }
                let category = ReportCategory::new(&config.name, &self.config.environment);
                self.collected()
                    .task_results
                    .insert(config.name.clone(), TaskResult::skipped(config, category));
                Some(SkipReason::Disabled)
            }
            StageKind::Attest => {
                let mut collected = self.collected();
                let applies = collected
                    .plan
                    .as_ref()
                    .is_some_and(AttestationGate::applies_to);
                if applies {
                    None
                } else {
                    collected.attestation = Some(AttestOutcome::NotApplicable);
                    Some(SkipReason::NotApplicable)
                }
            }
            _ => None,
        }
    }

    async fn run_stage(&self, node: &StageNode) -> PipelineResult<Outcome> {
        match &node.kind {
            StageKind::Validate => Ok(self.validate().await),
            StageKind::Scan(name) => self.scan(name).await,
            StageKind::Aggregate => Ok(self.aggregate()),
            StageKind::Plan => self.plan().await,
            StageKind::Attest => self.attest().await,
        }
    }
}
