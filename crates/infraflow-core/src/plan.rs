//! Plan execution and change detection.
//!
//! The plan tool's own "changes present" exit code is not trusted on its own.
//! Instead the textual summary is parsed by [`parse_plan_summary`] and the
//! run's exit signal is derived from the resource counts:
//!
//! | summary                                   | state           | signal |
//! |-------------------------------------------|-----------------|--------|
//! | `Plan: 0 to add, 0 to change, 0 to destroy` | NoChanges       | 0      |
//! | `Plan: N to add, M to change, K to destroy` (N+M+K > 0) | ChangesDetected | 2 |
//! | `No changes.`                             | NoChanges       | 0      |
//! | anything else                             | Errored         | 1      |
//!
//! The stage moves `NotStarted → Initialized → Planned → {NoChanges,
//! ChangesDetected, Errored}`. Backend initialisation happens here and only
//! here.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::digest::sha256_hex;
use crate::error::{PipelineError, PlanParseError, ToolError};
use crate::process::run_process;

/// Exit signal for a plan with no resource changes.
pub const NO_CHANGES_EXIT_SIGNAL: i32 = 0;
/// Exit signal for an errored plan.
pub const ERRORED_EXIT_SIGNAL: i32 = 1;
/// Fixed exit signal for a plan with resource changes, regardless of the
/// tool's raw status.
pub const CHANGES_DETECTED_EXIT_SIGNAL: i32 = 2;

// ---------------------------------------------------------------------------
// Summary parsing
// ---------------------------------------------------------------------------

/// Resource counts extracted from a plan summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub import: u64,
    pub add: u64,
    pub change: u64,
    pub destroy: u64,
}

impl ChangeCounts {
    /// Resources that would be added, changed or destroyed, or `None` if
    /// the sum does not fit in a `u64`.
    pub fn total(&self) -> Option<u64> {
        self.add
            .checked_add(self.change)
            .and_then(|n| n.checked_add(self.destroy))
    }

    pub fn has_changes(&self) -> bool {
        self.add > 0 || self.change > 0 || self.destroy > 0
    }
}

fn plan_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Plan:\s*(?:(\d+)\s+to\s+import,\s*)?(\d+)\s+to\s+add,\s*(\d+)\s+to\s+change,\s*(\d+)\s+to\s+destroy",
        )
        .expect("plan summary regex is valid")
    })
}

fn no_changes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*No changes\.|Your infrastructure matches the configuration")
            .expect("no-changes regex is valid")
    })
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi regex is valid"))
}

/// Extract resource counts from a plan's textual summary.
///
/// Recognizes `Plan: [I to import, ]N to add, M to change, K to destroy`
/// (the last such line wins) and the no-diff sentences `No changes.` /
/// `Your infrastructure matches the configuration.`. ANSI colour codes are
/// ignored. Any other text is a [`PlanParseError`]; this function never
/// guesses "no changes".
///
/// Isolated here so the workaround for the tool's exit code can be replaced
/// in one place.
pub fn parse_plan_summary(text: &str) -> Result<ChangeCounts, PlanParseError> {
    let clean = ansi_re().replace_all(text, "");

    if let Some(caps) = plan_line_re().captures_iter(&clean).last() {
        let num = |i: usize| -> Result<u64, PlanParseError> {
            match caps.get(i) {
                None => Ok(0),
                Some(m) => m.as_str().parse::<u64>().map_err(|_| PlanParseError {
                    excerpt: m.as_str().to_string(),
                }),
            }
        };
        let counts = ChangeCounts {
            import: num(1)?,
            add: num(2)?,
            change: num(3)?,
            destroy: num(4)?,
        };
        if counts.total().is_none() {
            return Err(PlanParseError {
                excerpt: caps[0].to_string(),
            });
        }
        return Ok(counts);
    }

    if no_changes_re().is_match(&clean) {
        return Ok(ChangeCounts::default());
    }

    Err(PlanParseError {
        excerpt: excerpt(&clean),
    })
}

fn excerpt(text: &str) -> String {
    const MAX: usize = 200;
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(MAX - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

// ---------------------------------------------------------------------------
// Plan tool collaborator
// ---------------------------------------------------------------------------

/// Inputs to the plan stage. The only request type carrying backend config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub environment: String,
    pub working_directory: PathBuf,
    pub var_file: Option<PathBuf>,
    pub backend_config: BTreeMap<String, String>,
    /// Saved plan location, relative to `working_directory` unless absolute.
    pub artifact_path: PathBuf,
}

impl PlanRequest {
    pub fn for_run(config: &RunConfig) -> Self {
        Self {
            environment: config.environment.clone(),
            working_directory: config.working_directory.clone(),
            var_file: config.var_file.clone(),
            backend_config: config.plan.backend_config.clone(),
            artifact_path: config.plan_artifact_path(),
        }
    }

    /// The artifact path as seen from this process rather than from the
    /// tool's working directory.
    pub fn resolved_artifact_path(&self) -> PathBuf {
        self.working_directory.join(&self.artifact_path)
    }
}

/// Raw plan command result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub summary: String,
    /// Saved plan artifact bytes, if the tool produced one.
    pub artifact: Option<Vec<u8>>,
}

/// Infrastructure diff tool.
#[async_trait]
pub trait PlanTool: Send + Sync {
    /// Establish backend access and acquire what planning needs.
    async fn init(&self, request: &PlanRequest) -> Result<(), ToolError>;

    /// Compute the plan and capture its textual summary.
    async fn plan(&self, request: &PlanRequest) -> Result<PlanOutput, ToolError>;

    /// Whether a completed `plan` always yields artifact bytes. When it does
    /// not, the summary text is hashed in place of an artifact.
    fn saves_artifact(&self) -> bool {
        true
    }
}

/// `terraform` command-line plan tool.
#[derive(Debug, Clone)]
pub struct TerraformPlanTool {
    binary: String,
}

impl Default for TerraformPlanTool {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
        }
    }
}

impl TerraformPlanTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn init_command(&self, request: &PlanRequest) -> Vec<String> {
        let mut argv = vec![
            self.binary.clone(),
            "init".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
        ];
        for (k, v) in &request.backend_config {
            argv.push(format!("-backend-config={k}={v}"));
        }
        argv
    }

    pub fn plan_command(&self, request: &PlanRequest) -> Vec<String> {
        let mut argv = vec![
            self.binary.clone(),
            "plan".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            "-lock=true".to_string(),
            "-detailed-exitcode".to_string(),
            format!("-out={}", request.artifact_path.display()),
        ];
        if let Some(var_file) = &request.var_file {
            argv.push(format!("-var-file={}", var_file.display()));
        }
        argv
    }
}

#[async_trait]
impl PlanTool for TerraformPlanTool {
    async fn init(&self, request: &PlanRequest) -> Result<(), ToolError> {
        let output = run_process(&self.init_command(request), &request.working_directory).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ToolError::BackendInit(tail(&output.stderr, 20)))
        }
    }

    async fn plan(&self, request: &PlanRequest) -> Result<PlanOutput, ToolError> {
        let output = run_process(&self.plan_command(request), &request.working_directory).await?;
        let completed = matches!(output.exit_code, Some(0) | Some(2));
        let artifact = if completed {
            let path = request.resolved_artifact_path();
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                ToolError::Other(format!("plan artifact {}: {e}", path.display()))
            })?;
            Some(bytes)
        } else {
            None
        };
        let mut summary = output.stdout;
        if !output.stderr.is_empty() {
            summary.push('\n');
            summary.push_str(&output.stderr);
        }
        Ok(PlanOutput {
            exit_code: output.exit_code,
            summary,
            artifact,
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Terminal classification of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    NoChanges,
    ChangesDetected,
    Errored,
}

impl PlanState {
    /// Classification of a completed plan from its resource counts alone.
    pub fn from_counts(counts: &ChangeCounts) -> Self {
        if counts.has_changes() {
            PlanState::ChangesDetected
        } else {
            PlanState::NoChanges
        }
    }

    pub fn exit_signal(&self) -> i32 {
        match self {
            PlanState::NoChanges => NO_CHANGES_EXIT_SIGNAL,
            PlanState::ChangesDetected => CHANGES_DETECTED_EXIT_SIGNAL,
            PlanState::Errored => ERRORED_EXIT_SIGNAL,
        }
    }
}

/// Progress of the plan stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "state", rename_all = "snake_case")]
pub enum PlanPhase {
    NotStarted,
    Initialized,
    Planned,
    Classified(PlanState),
}

/// Produced exactly once per run by the plan stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub state: PlanState,
    pub summary_text: String,
    pub counts: Option<ChangeCounts>,
    pub artifact_ref: Option<String>,
    pub artifact_hash: Option<String>,
    /// Externally visible signal derived from `state`.
    pub exit_signal: i32,
    /// Status the tool actually returned, kept for diagnostics only.
    pub raw_exit_code: Option<i32>,
    /// Error that made the plan `Errored`.
    #[serde(skip)]
    pub error: Option<PipelineError>,
}

impl PlanResult {
    fn errored(summary_text: String, raw_exit_code: Option<i32>, error: PipelineError) -> Self {
        Self {
            state: PlanState::Errored,
            summary_text,
            counts: None,
            artifact_ref: None,
            artifact_hash: None,
            exit_signal: ERRORED_EXIT_SIGNAL,
            raw_exit_code,
            error: Some(error),
        }
    }
}

/// `sha256:<hex>` of `bytes`.
pub fn artifact_hash(bytes: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(bytes))
}

/// Classify a completed plan command.
///
/// A plan "completed" iff it exited 0 or 2 (`-detailed-exitcode`); anything
/// else is a [`PipelineError::PlanExecution`]. The state itself is decided
/// from the summary text alone.
pub fn classify(output: &PlanOutput) -> Result<(PlanState, ChangeCounts), PipelineError> {
    match output.exit_code {
        Some(0) | Some(2) => {}
        Some(code) => {
            return Err(PipelineError::PlanExecution(format!(
                "plan exited with status {code}"
            )))
        }
        None => {
            return Err(PipelineError::PlanExecution(
                "plan terminated by signal".to_string(),
            ))
        }
    }

    let counts = parse_plan_summary(&output.summary)?;
    Ok((PlanState::from_counts(&counts), counts))
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Drives one plan through its phases.
pub struct PlanStage {
    tool: Arc<dyn PlanTool>,
    phase: PlanPhase,
}

impl PlanStage {
    pub fn new(tool: Arc<dyn PlanTool>) -> Self {
        Self {
            tool,
            phase: PlanPhase::NotStarted,
        }
    }

    pub fn phase(&self) -> PlanPhase {
        self.phase
    }

    /// Run init + plan within `budget` and classify the result.
    ///
    /// Always returns a [`PlanResult`]; `Errored` results carry the error
    /// that must halt the run.
    pub async fn execute(&mut self, request: &PlanRequest, budget: Duration) -> PlanResult {
        let result = self.execute_inner(request, budget).await;
        self.phase = PlanPhase::Classified(result.state);
        match &result.error {
            Some(e) => warn!(event = "plan.classified", state = ?result.state, error = %e),
            None => info!(
                event = "plan.classified",
                state = ?result.state,
                exit_signal = result.exit_signal,
                raw_exit_code = ?result.raw_exit_code,
            ),
        }
        result
    }

    async fn execute_inner(&mut self, request: &PlanRequest, budget: Duration) -> PlanResult {
        let deadline = Instant::now() + budget;

        match tokio::time::timeout_at(deadline, self.tool.init(request)).await {
            Ok(Ok(())) => self.phase = PlanPhase::Initialized,
            Ok(Err(e)) => {
                return PlanResult::errored(
                    String::new(),
                    None,
                    PipelineError::BackendAuth(e.to_string()),
                )
            }
            Err(_) => {
                return PlanResult::errored(
                    String::new(),
                    None,
                    PipelineError::BackendAuth(format!(
                        "backend initialisation timed out after {}s",
                        budget.as_secs()
                    )),
                )
            }
        }
        debug!(environment = %request.environment, "backend initialised");

        let output = match tokio::time::timeout_at(deadline, self.tool.plan(request)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return PlanResult::errored(
                    String::new(),
                    None,
                    PipelineError::PlanExecution(e.to_string()),
                )
            }
            Err(_) => {
                return PlanResult::errored(
                    String::new(),
                    None,
                    PipelineError::PlanExecution(format!(
                        "plan timed out after {}s",
                        budget.as_secs()
                    )),
                )
            }
        };
        self.phase = PlanPhase::Planned;

        let (state, counts) = match classify(&output) {
            Ok(classified) => classified,
            Err(e) => return PlanResult::errored(output.summary, output.exit_code, e),
        };

        let (artifact_ref, hash) = match &output.artifact {
            Some(bytes) => (
                Some(request.resolved_artifact_path().display().to_string()),
                artifact_hash(bytes),
            ),
            None if !self.tool.saves_artifact() => (None, artifact_hash(output.summary.as_bytes())),
            None => {
                let error = PipelineError::PlanExecution(format!(
                    "plan completed without saving {}",
                    request.resolved_artifact_path().display()
                ));
                return PlanResult::errored(output.summary, output.exit_code, error);
            }
        };

        PlanResult {
            state,
            summary_text: output.summary,
            counts: Some(counts),
            artifact_ref,
            artifact_hash: Some(hash),
            exit_signal: state.exit_signal(),
            raw_exit_code: output.exit_code,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_counts_is_no_changes() {
        let counts = parse_plan_summary("Plan: 0 to add, 0 to change, 0 to destroy.").unwrap();
        assert_eq!(counts, ChangeCounts::default());
        assert!(!counts.has_changes());
    }

    #[test]
    fn test_counts_are_extracted() {
        let counts = parse_plan_summary("Plan: 3 to add, 1 to change, 0 to destroy.").unwrap();
        assert_eq!(counts.add, 3);
        assert_eq!(counts.change, 1);
        assert_eq!(counts.destroy, 0);
        assert_eq!(counts.total(), Some(4));
    }

    #[test]
    fn test_import_counts_are_tolerated() {
        let counts =
            parse_plan_summary("Plan: 2 to import, 0 to add, 0 to change, 0 to destroy.").unwrap();
        assert_eq!(counts.import, 2);
        assert!(!counts.has_changes());
    }

    #[test]
    fn test_no_changes_sentence() {
        let text = "\nNo changes. Your infrastructure matches the configuration.\n";
        assert_eq!(parse_plan_summary(text).unwrap(), ChangeCounts::default());
    }

    #[test]
    fn test_ansi_codes_are_ignored() {
        let text = "\x1b[1mPlan:\x1b[0m 1 to add, 0 to change, 2 to destroy.";
        let counts = parse_plan_summary(text).unwrap();
        assert_eq!(counts.add, 1);
        assert_eq!(counts.destroy, 2);
    }

    #[test]
    fn test_unrecognized_summary_is_an_error() {
        let err = parse_plan_summary("Error: Failed to load plugin schemas").unwrap_err();
        assert!(err.excerpt.contains("plugin schemas"));
        assert!(parse_plan_summary("").is_err());
    }

    #[test]
    fn test_last_plan_line_wins() {
        let text = "Plan: 9 to add, 0 to change, 0 to destroy.\n...\nPlan: 0 to add, 0 to change, 1 to destroy.";
        let counts = parse_plan_summary(text).unwrap();
        assert_eq!(counts.add, 0);
        assert_eq!(counts.destroy, 1);
    }

    #[test]
    fn test_excerpt_is_bounded_and_char_safe() {
        let long = "é".repeat(500);
        let e = excerpt(&long);
        assert_eq!(e.chars().count(), 200);
    }

    #[test]
    fn test_classify_overrides_raw_exit_code() {
        // Tool reports 0 but the summary shows changes.
        let output = PlanOutput {
            exit_code: Some(0),
            summary: "Plan: 3 to add, 1 to change, 0 to destroy.".into(),
            artifact: None,
        };
        let (state, _) = classify(&output).unwrap();
        assert_eq!(state, PlanState::ChangesDetected);
        assert_eq!(state.exit_signal(), CHANGES_DETECTED_EXIT_SIGNAL);

        // Tool reports 2 but nothing changes.
        let output = PlanOutput {
            exit_code: Some(2),
            summary: "Plan: 0 to add, 0 to change, 0 to destroy.".into(),
            artifact: None,
        };
        let (state, _) = classify(&output).unwrap();
        assert_eq!(state, PlanState::NoChanges);
        assert_eq!(state.exit_signal(), 0);
    }

    #[test]
    fn test_classify_rejects_crashed_plan() {
        let output = PlanOutput {
            exit_code: Some(1),
            summary: "Plan: 3 to add, 0 to change, 0 to destroy.".into(),
            artifact: None,
        };
        assert!(matches!(
            classify(&output),
            Err(PipelineError::PlanExecution(_))
        ));
    }

    #[test]
    fn test_artifact_hash_format() {
        let h = artifact_hash(b"plan");
        assert!(h.starts_with("sha256:"));
        assert_eq!(h.len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_terraform_commands() {
        let tool = TerraformPlanTool::default();
        let mut backend = BTreeMap::new();
        backend.insert("bucket".to_string(), "state".to_string());
        let request = PlanRequest {
            environment: "prod".into(),
            working_directory: PathBuf::from("."),
            var_file: Some(PathBuf::from("prod.tfvars")),
            backend_config: backend,
            artifact_path: PathBuf::from("out.tfplan"),
        };
        let init = tool.init_command(&request);
        assert!(init.contains(&"-backend-config=bucket=state".to_string()));
        let plan = tool.plan_command(&request);
        assert!(plan.contains(&"-lock=true".to_string()));
        assert!(plan.contains(&"-out=out.tfplan".to_string()));
        assert!(plan.contains(&"-var-file=prod.tfvars".to_string()));
    }

    #[test]
    fn test_count_overflow_is_a_parse_error() {
        let text = "Plan: 18446744073709551615 to add, 1 to change, 0 to destroy.";
        let err = parse_plan_summary(text).unwrap_err();
        assert!(err.excerpt.contains("18446744073709551615"));

        let counts = ChangeCounts {
            add: u64::MAX,
            change: 1,
            ..Default::default()
        };
        assert_eq!(counts.total(), None);
        assert!(counts.has_changes());
    }

    #[test]
    fn test_state_from_counts() {
        assert_eq!(PlanState::from_counts(&ChangeCounts::default()), PlanState::NoChanges);
        let counts = ChangeCounts {
            destroy: 1,
            ..Default::default()
        };
        assert_eq!(PlanState::from_counts(&counts), PlanState::ChangesDetected);
    }

    fn request(working_directory: &std::path::Path) -> PlanRequest {
        PlanRequest {
            environment: "dev".into(),
            working_directory: working_directory.to_path_buf(),
            var_file: None,
            backend_config: BTreeMap::new(),
            artifact_path: PathBuf::from(crate::config::DEFAULT_PLAN_ARTIFACT),
        }
    }

    #[tokio::test]
    async fn test_stage_hashes_artifact_bytes() {
        let tool = Arc::new(crate::fakes::FakePlanTool::changes());
        let mut stage = PlanStage::new(tool);
        let result = stage
            .execute(&request(std::path::Path::new("infra")), Duration::from_secs(5))
            .await;

        assert_eq!(result.state, PlanState::ChangesDetected);
        assert_eq!(result.artifact_ref.as_deref(), Some("infra/infraflow.tfplan"));
        let expected = artifact_hash(b"artifact:Plan: 3 to add, 1 to change, 0 to destroy.");
        assert_eq!(result.artifact_hash, Some(expected));
        assert_eq!(stage.phase(), PlanPhase::Classified(PlanState::ChangesDetected));
    }

    #[tokio::test]
    async fn test_stage_errors_when_expected_artifact_is_missing() {
        let tool = Arc::new(crate::fakes::FakePlanTool::losing_artifact(
            2,
            "Plan: 1 to add, 0 to change, 0 to destroy.",
        ));
        let result = PlanStage::new(tool)
            .execute(&request(std::path::Path::new(".")), Duration::from_secs(5))
            .await;

        assert_eq!(result.state, PlanState::Errored);
        assert_eq!(result.exit_signal, ERRORED_EXIT_SIGNAL);
        assert!(result.artifact_hash.is_none());
        assert!(matches!(result.error, Some(PipelineError::PlanExecution(_))));
    }

    #[tokio::test]
    async fn test_stage_hashes_summary_for_tools_without_artifacts() {
        let summary = "Plan: 1 to add, 0 to change, 0 to destroy.";
        let tool = Arc::new(crate::fakes::FakePlanTool::without_artifact(2, summary));
        let result = PlanStage::new(tool)
            .execute(&request(std::path::Path::new(".")), Duration::from_secs(5))
            .await;

        assert_eq!(result.state, PlanState::ChangesDetected);
        assert!(result.artifact_ref.is_none());
        assert_eq!(result.artifact_hash, Some(artifact_hash(summary.as_bytes())));
    }

    /// Stand-in `terraform`: run through `sh`, so `init` and `plan` resolve to
    /// scripts in the working directory. `plan` writes its `-out` file.
    #[cfg(unix)]
    fn write_fake_terraform(dir: &std::path::Path, write_artifact: bool) {
        std::fs::write(dir.join("init"), "exit 0\n").unwrap();
        let save = if write_artifact {
            "printf 'saved-plan' > \"$out\" || exit 1\n"
        } else {
            ""
        };
        let plan = format!(
            "for arg in \"$@\"; do case \"$arg\" in -out=*) out=\"${{arg#-out=}}\";; esac; done\n\
             {save}\
             echo 'Plan: 1 to add, 0 to change, 0 to destroy.'\n\
             exit 2\n"
        );
        std::fs::write(dir.join("plan"), plan).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terraform_tool_with_relative_working_directory() {
        let base = tempfile::Builder::new().tempdir_in(".").unwrap();
        let working_directory = base.path().join("env");
        assert!(working_directory.is_relative());
        std::fs::create_dir(&working_directory).unwrap();
        write_fake_terraform(&working_directory, true);

        let config = crate::config::RunConfig::builder()
            .environment("staging")
            .working_directory(&working_directory)
            .build()
            .unwrap();
        let request = PlanRequest::for_run(&config);
        let tool = Arc::new(TerraformPlanTool::new("sh"));
        let result = PlanStage::new(tool)
            .execute(&request, Duration::from_secs(30))
            .await;

        assert_eq!(result.state, PlanState::ChangesDetected, "{:?}", result.error);
        assert_eq!(result.raw_exit_code, Some(2));
        assert_eq!(result.artifact_hash, Some(artifact_hash(b"saved-plan")));
        assert!(working_directory.join("infraflow.tfplan").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terraform_tool_unreadable_artifact_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_fake_terraform(dir.path(), false);

        let tool = Arc::new(TerraformPlanTool::new("sh"));
        let result = PlanStage::new(tool)
            .execute(&request(dir.path()), Duration::from_secs(30))
            .await;

        assert_eq!(result.state, PlanState::Errored);
        assert!(matches!(result.error, Some(PipelineError::PlanExecution(_))));
    }
}
