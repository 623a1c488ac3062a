//! Scan task execution.
//!
//! A [`TaskRunner`] executes exactly one scanner invocation, bounded by the
//! scanner's wall-clock budget, and converts whatever happened into a
//! [`TaskResult`]. It never returns an error: crashes, timeouts and policy
//! violations all become `Outcome::Failed` with a [`TaskFailure`] detail.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::error::{PipelineError, ToolError};
use crate::outcome::Outcome;
use crate::process::run_process;
use crate::report::{ReportCategory, ReportRef, ReportStore};
use crate::scanner::{render_command, SeverityThreshold};
use crate::snapshot::WorkspaceSnapshot;

/// Everything a scanner is given. Carries no backend or state configuration;
/// scanners never touch remote state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scanner: String,
    pub environment: String,
    pub working_directory: PathBuf,
    pub var_file: Option<PathBuf>,
    pub severity_threshold: SeverityThreshold,
    /// Command template override from configuration.
    pub command: Option<Vec<String>>,
}

/// Raw result of a scanner invocation that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutput {
    /// `None` when the tool was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Machine-readable report emitted by the tool.
    pub report: String,
    pub stderr: String,
}

/// A policy/security scanner.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Run one scan. `Err` means the tool could not be run at all.
    async fn scan(&self, request: &ScanRequest) -> Result<ScanOutput, ToolError>;
}

/// Scanner that shells out to the builtin or configured command line.
#[derive(Debug, Clone, Default)]
pub struct CommandScanner;

impl CommandScanner {
    pub fn new() -> Self {
        Self
    }

    /// The argv that will be executed for `request`.
    pub fn command_for(request: &ScanRequest) -> Result<Vec<String>, ToolError> {
        let working_directory = ".";
        let var_file = request
            .var_file
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());

        if let Some(template) = &request.command {
            return Ok(render_command(
                template,
                working_directory,
                var_file.as_deref(),
                request.severity_threshold,
            ));
        }

        let builtin = crate::scanner::BuiltinScanner::from_name(&request.scanner)
            .ok_or_else(|| ToolError::EmptyCommand(request.scanner.clone()))?;
        let mut argv = render_command(
            &builtin.command_template(),
            working_directory,
            None,
            request.severity_threshold,
        );
        if let (Some(flag), Some(file)) = (builtin.var_file_flag(), var_file) {
            argv.push(flag.to_string());
            argv.push(file);
        }
        Ok(argv)
    }
}

#[async_trait]
impl Scanner for CommandScanner {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanOutput, ToolError> {
        let argv = Self::command_for(request)?;
        let output = run_process(&argv, &request.working_directory).await?;
        Ok(ScanOutput {
            exit_code: output.exit_code,
            report: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Why a task failed. All variants map to `Outcome::Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskFailure {
    /// The tool could not be started, crashed, or was killed.
    Execution { message: String },
    /// The tool exceeded its wall-clock budget.
    Timeout { budget_secs: u64 },
    /// The tool completed and reported findings at or above the threshold.
    PolicyViolation { exit_code: i32 },
}

impl TaskFailure {
    pub fn to_error(&self, scanner: &str) -> PipelineError {
        match self {
            TaskFailure::Execution { message } => PipelineError::ScannerExecution {
                scanner: scanner.to_string(),
                reason: message.clone(),
            },
            TaskFailure::Timeout { budget_secs } => PipelineError::ScannerExecution {
                scanner: scanner.to_string(),
                reason: format!("timed out after {budget_secs}s"),
            },
            TaskFailure::PolicyViolation { exit_code } => PipelineError::PolicyViolation {
                scanner: scanner.to_string(),
                exit_code: *exit_code,
            },
        }
    }
}

/// Result of exactly one task runner invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub scanner_name: String,
    pub outcome: Outcome,
    pub report_ref: Option<ReportRef>,
    pub report_category: ReportCategory,
    pub duration_budget_exceeded: bool,
    pub failure: Option<TaskFailure>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Copied from the scanner config; read by the scan-group rollup.
    pub continue_on_error: bool,
}

impl TaskResult {
    /// Result for a scanner that was never invoked.
    pub fn skipped(config: &ScannerConfig, category: ReportCategory) -> Self {
        Self {
            scanner_name: config.name.clone(),
            outcome: Outcome::Skipped,
            report_ref: None,
            report_category: category,
            duration_budget_exceeded: false,
            failure: None,
            exit_code: None,
            duration_ms: 0,
            continue_on_error: config.continue_on_error,
        }
    }
}

/// Runs scan tasks for one pipeline run.
#[derive(Clone)]
pub struct TaskRunner {
    scanner: Arc<dyn Scanner>,
    store: Arc<dyn ReportStore>,
    environment: String,
    isolate: bool,
}

impl TaskRunner {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        store: Arc<dyn ReportStore>,
        environment: impl Into<String>,
        isolate: bool,
    ) -> Self {
        Self {
            scanner,
            store,
            environment: environment.into(),
            isolate,
        }
    }

    /// Execute a single scan task.
    ///
    /// Disabled scanners are skipped without invoking anything.
    pub async fn run(&self, config: &ScannerConfig) -> TaskResult {
        let category = ReportCategory::new(&config.name, &self.environment);

        if !config.enabled {
            debug!(scanner = %config.name, "scanner disabled, not invoked");
            return TaskResult::skipped(config, category);
        }

        let start = Instant::now();
        let budget = Duration::from_secs(config.timeout_secs);
        let attempt = tokio::time::timeout(budget, self.snapshot_and_scan(config)).await;

        let (exit_code, failure, report) = match attempt {
            Ok(Ok(output)) => match output.exit_code {
                Some(0) => (Some(0), None, output.report),
                Some(code) => (
                    Some(code),
                    Some(TaskFailure::PolicyViolation { exit_code: code }),
                    output.report,
                ),
                None => (
                    None,
                    Some(TaskFailure::Execution {
                        message: "terminated by signal".to_string(),
                    }),
                    output.report,
                ),
            },
            Ok(Err(message)) => (
                None,
                Some(TaskFailure::Execution { message }),
                String::new(),
            ),
            Err(_elapsed) => (
                None,
                Some(TaskFailure::Timeout {
                    budget_secs: config.timeout_secs,
                }),
                String::new(),
            ),
        };

        self.finish(config, category, start, exit_code, failure, report)
            .await
    }

    /// Copy the working directory when isolating, then scan the copy.
    ///
    /// Both steps run under the caller's budget. The copy runs on the
    /// blocking pool; if the budget expires first it is discarded once done.
    async fn snapshot_and_scan(&self, config: &ScannerConfig) -> Result<ScanOutput, String> {
        let snapshot = if self.isolate {
            let source = config.working_directory.clone();
            let created = tokio::task::spawn_blocking(move || WorkspaceSnapshot::create(&source))
                .await
                .map_err(|e| format!("snapshot task failed: {e}"))?
                .map_err(|e| {
                    format!("cannot snapshot {}: {e}", config.working_directory.display())
                })?;
            Some(created)
        } else {
            None
        };

        let request = ScanRequest {
            scanner: config.name.clone(),
            environment: self.environment.clone(),
            working_directory: snapshot
                .as_ref()
                .map(|s| s.path().to_path_buf())
                .unwrap_or_else(|| config.working_directory.clone()),
            var_file: config.var_file.clone(),
            severity_threshold: config.severity_threshold,
            command: config.command.clone(),
        };
        let scanned = self.scanner.scan(&request).await;

        if let Some(snapshot) = snapshot {
            // Removal walks the whole copy; keep it off the async workers.
            tokio::task::spawn_blocking(move || drop(snapshot));
        }
        scanned.map_err(|e| e.to_string())
    }

    async fn finish(
        &self,
        config: &ScannerConfig,
        category: ReportCategory,
        start: Instant,
        exit_code: Option<i32>,
        failure: Option<TaskFailure>,
        report: String,
    ) -> TaskResult {
        let outcome = if failure.is_some() {
            Outcome::Failed
        } else {
            Outcome::Succeeded
        };
        let duration_budget_exceeded = matches!(failure, Some(TaskFailure::Timeout { .. }));
        let duration_ms = start.elapsed().as_millis() as u64;

        if let Some(f) = &failure {
            warn!(scanner = %config.name, error = %f.to_error(&config.name), "scan task failed");
        } else {
            info!(scanner = %config.name, duration_ms, "scan task succeeded");
        }

        let payload = json!({
            "scanner": &config.name,
            "environment": &category.environment,
            "severity_threshold": config.severity_threshold,
            "outcome": outcome,
            "exit_code": exit_code,
            "failure": &failure,
            "duration_ms": duration_ms,
            "report": report,
        });

        let report_ref = match serde_json::to_vec_pretty(&payload) {
            Ok(bytes) => match self.store.put(&category, &bytes).await {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(scanner = %config.name, error = %e, "failed to store scan report");
                    None
                }
            },
            Err(e) => {
                warn!(scanner = %config.name, error = %e, "failed to encode scan report");
                None
            }
        };

        TaskResult {
            scanner_name: config.name.clone(),
            outcome,
            report_ref,
            report_category: category,
            duration_budget_exceeded,
            failure,
            exit_code,
            duration_ms,
            continue_on_error: config.continue_on_error,
        }
    }
}
