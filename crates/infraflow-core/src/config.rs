//! Run configuration.
//!
//! A [`RunConfig`] is assembled once per run from defaults, an optional TOML
//! file and named `key=value` parameters, then shared read-only for the
//! lifetime of the run. Nothing downstream reads process environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::outcome::GatingPolicy;
use crate::scanner::{BuiltinScanner, SeverityThreshold};

pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_PLAN_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_VALIDATE_TIMEOUT_SECS: u64 = 300;
/// Plan artifact file name, inside the working directory.
pub const DEFAULT_PLAN_ARTIFACT: &str = "infraflow.tfplan";

/// Per-scanner configuration, immutable for the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScannerConfig {
    pub name: String,
    pub enabled: bool,
    pub severity_threshold: SeverityThreshold,
    pub continue_on_error: bool,
    pub working_directory: PathBuf,
    pub var_file: Option<PathBuf>,
    /// Wall-clock budget for one invocation.
    pub timeout_secs: u64,
    /// Command template overriding the builtin one.
    pub command: Option<Vec<String>>,
}

impl ScannerConfig {
    /// Builtin scanner with default settings.
    pub fn builtin(scanner: BuiltinScanner, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            name: scanner.name().to_string(),
            enabled: true,
            severity_threshold: SeverityThreshold::default(),
            continue_on_error: false,
            working_directory: working_directory.into(),
            var_file: None,
            timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            command: None,
        }
    }

    /// Custom scanner driven by an explicit command template.
    pub fn custom(
        name: impl Into<String>,
        command: Vec<String>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            severity_threshold: SeverityThreshold::default(),
            continue_on_error: false,
            working_directory: working_directory.into(),
            var_file: None,
            timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            command: Some(command),
        }
    }

    /// Disable this scanner.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_severity(mut self, severity: SeverityThreshold) -> Self {
        self.severity_threshold = severity;
        self
    }

    pub fn builtin_kind(&self) -> Option<BuiltinScanner> {
        BuiltinScanner::from_name(&self.name)
    }
}

/// Settings for the validate stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidateSettings {
    pub policy: GatingPolicy,
    pub timeout_secs: u64,
}

impl Default for ValidateSettings {
    fn default() -> Self {
        Self {
            policy: GatingPolicy::Strict,
            timeout_secs: DEFAULT_VALIDATE_TIMEOUT_SECS,
        }
    }
}

/// Settings for the plan stage, the only stage with backend access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSettings {
    pub timeout_secs: u64,
    /// `-backend-config` key/value pairs.
    pub backend_config: BTreeMap<String, String>,
    /// Where the saved plan artifact is written, relative to the working
    /// directory unless absolute. Defaults to `infraflow.tfplan`.
    pub artifact_path: Option<PathBuf>,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_PLAN_TIMEOUT_SECS,
            backend_config: BTreeMap::new(),
            artifact_path: None,
        }
    }
}

/// Immutable configuration for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub environment: String,
    pub working_directory: PathBuf,
    pub var_file: Option<PathBuf>,
    pub scanners: Vec<ScannerConfig>,
    pub validate: ValidateSettings,
    /// Whether a failed aggregate gate stops the plan stage.
    pub aggregate_policy: GatingPolicy,
    pub plan: PlanSettings,
    /// Give every scanner its own copy of the working directory.
    pub isolate_scans: bool,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    pub fn scanner(&self, name: &str) -> Option<&ScannerConfig> {
        self.scanners.iter().find(|s| s.name == name)
    }

    pub fn enabled_scanners(&self) -> impl Iterator<Item = &ScannerConfig> {
        self.scanners.iter().filter(|s| s.enabled)
    }

    pub fn plan_artifact_path(&self) -> PathBuf {
        self.plan
            .artifact_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PLAN_ARTIFACT))
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    environment: Option<String>,
    working_directory: Option<PathBuf>,
    var_file: Option<PathBuf>,
    isolate_scans: Option<bool>,
    #[serde(default)]
    validate: FileStage,
    #[serde(default)]
    aggregate: FileStage,
    #[serde(default)]
    plan: FilePlan,
    #[serde(default)]
    scanners: BTreeMap<String, FileScanner>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStage {
    continue_on_error: Option<bool>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePlan {
    timeout_secs: Option<u64>,
    #[serde(default)]
    backend_config: BTreeMap<String, String>,
    artifact_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileScanner {
    enabled: Option<bool>,
    severity_threshold: Option<SeverityThreshold>,
    continue_on_error: Option<bool>,
    working_directory: Option<PathBuf>,
    var_file: Option<PathBuf>,
    timeout_secs: Option<u64>,
    command: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct ScannerOverrides {
    enabled: Option<bool>,
    severity_threshold: Option<SeverityThreshold>,
    continue_on_error: Option<bool>,
    working_directory: Option<PathBuf>,
    var_file: Option<PathBuf>,
    timeout_secs: Option<u64>,
    command: Option<Vec<String>>,
}

/// Layered builder for [`RunConfig`]. Later layers override earlier ones.
#[derive(Debug, Clone, Default)]
pub struct RunConfigBuilder {
    environment: Option<String>,
    working_directory: Option<PathBuf>,
    var_file: Option<PathBuf>,
    isolate_scans: Option<bool>,
    validate_continue_on_error: Option<bool>,
    validate_timeout_secs: Option<u64>,
    aggregate_continue_on_error: Option<bool>,
    plan_timeout_secs: Option<u64>,
    backend_config: BTreeMap<String, String>,
    plan_artifact_path: Option<PathBuf>,
    scanners: BTreeMap<String, ScannerOverrides>,
}

impl RunConfigBuilder {
    /// Layer a TOML config file.
    pub fn file(self, path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        self.toml_str(&text)
    }

    /// Layer TOML text.
    pub fn toml_str(mut self, text: &str) -> PipelineResult<Self> {
        let file: FileConfig = toml::from_str(text)
            .map_err(|e| PipelineError::Configuration(format!("invalid config file: {e}")))?;

        if file.environment.is_some() {
            self.environment = file.environment;
        }
        if file.working_directory.is_some() {
            self.working_directory = file.working_directory;
        }
        if file.var_file.is_some() {
            self.var_file = file.var_file;
        }
        if file.isolate_scans.is_some() {
            self.isolate_scans = file.isolate_scans;
        }
        if file.validate.continue_on_error.is_some() {
            self.validate_continue_on_error = file.validate.continue_on_error;
        }
        if file.validate.timeout_secs.is_some() {
            self.validate_timeout_secs = file.validate.timeout_secs;
        }
        if file.aggregate.continue_on_error.is_some() {
            self.aggregate_continue_on_error = file.aggregate.continue_on_error;
        }
        if file.plan.timeout_secs.is_some() {
            self.plan_timeout_secs = file.plan.timeout_secs;
        }
        if file.plan.artifact_path.is_some() {
            self.plan_artifact_path = file.plan.artifact_path;
        }
        self.backend_config.extend(file.plan.backend_config);

        for (name, s) in file.scanners {
            let entry = self.scanners.entry(name).or_default();
            entry.enabled = s.enabled.or(entry.enabled);
            entry.severity_threshold = s.severity_threshold.or(entry.severity_threshold);
            entry.continue_on_error = s.continue_on_error.or(entry.continue_on_error);
            entry.working_directory = s.working_directory.or(entry.working_directory.take());
            entry.var_file = s.var_file.or(entry.var_file.take());
            entry.timeout_secs = s.timeout_secs.or(entry.timeout_secs);
            entry.command = s.command.or(entry.command.take());
        }
        Ok(self)
    }

    /// Layer named parameters (`environment`, `enable-tfsec`, ...).
    pub fn params<'a, I>(mut self, params: I) -> PipelineResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in params {
            self.apply_param(key.trim(), value.trim())?;
        }
        Ok(self)
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn var_file(mut self, var_file: impl Into<PathBuf>) -> Self {
        self.var_file = Some(var_file.into());
        self
    }

    pub fn isolate_scans(mut self, isolate: bool) -> Self {
        self.isolate_scans = Some(isolate);
        self
    }

    /// Register or override a scanner with an explicit config.
    pub fn scanner(mut self, config: ScannerConfig) -> Self {
        let entry = self.scanners.entry(config.name.clone()).or_default();
        entry.enabled = Some(config.enabled);
        entry.severity_threshold = Some(config.severity_threshold);
        entry.continue_on_error = Some(config.continue_on_error);
        entry.working_directory = Some(config.working_directory);
        entry.var_file = config.var_file;
        entry.timeout_secs = Some(config.timeout_secs);
        entry.command = config.command;
        self
    }

    fn apply_param(&mut self, key: &str, value: &str) -> PipelineResult<()> {
        match key {
            "environment" => self.environment = Some(value.to_string()),
            "workingDirectory" => self.working_directory = Some(PathBuf::from(value)),
            "varFile" => {
                self.var_file = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "isolateScans" => self.isolate_scans = Some(parse_bool(key, value)?),
            "validate-continueOnError" => {
                self.validate_continue_on_error = Some(parse_bool(key, value)?)
            }
            "validate-timeoutSecs" => self.validate_timeout_secs = Some(parse_u64(key, value)?),
            "aggregate-continueOnError" => {
                self.aggregate_continue_on_error = Some(parse_bool(key, value)?)
            }
            "plan-timeoutSecs" => self.plan_timeout_secs = Some(parse_u64(key, value)?),
            _ => {
                if let Some(name) = key.strip_prefix("enable-") {
                    self.scanner_entry(key, name)?.enabled = Some(parse_bool(key, value)?);
                } else if let Some(name) = key.strip_suffix("-severityThreshold") {
                    self.scanner_entry(key, name)?.severity_threshold = Some(value.parse()?);
                } else if let Some(name) = key.strip_suffix("-continueOnError") {
                    self.scanner_entry(key, name)?.continue_on_error =
                        Some(parse_bool(key, value)?);
                } else if let Some(name) = key.strip_suffix("-timeoutSecs") {
                    self.scanner_entry(key, name)?.timeout_secs = Some(parse_u64(key, value)?);
                } else if let Some(backend_key) = key.strip_prefix("backend-") {
                    self.backend_config
                        .insert(backend_key.to_string(), value.to_string());
                } else {
                    return Err(PipelineError::Configuration(format!(
                        "unknown parameter '{key}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parameters may only address builtin scanners or ones already
    /// declared in a config file.
    fn scanner_entry(&mut self, key: &str, name: &str) -> PipelineResult<&mut ScannerOverrides> {
        if BuiltinScanner::from_name(name).is_none() && !self.scanners.contains_key(name) {
            return Err(PipelineError::Configuration(format!(
                "parameter '{key}' refers to unknown scanner '{name}'"
            )));
        }
        Ok(self.scanners.entry(name.to_string()).or_default())
    }

    /// Validate and freeze the configuration.
    ///
    /// Fails with [`PipelineError::Configuration`] when `environment` is
    /// missing or blank, or when a non-builtin scanner has no command.
    pub fn build(self) -> PipelineResult<RunConfig> {
        let environment = match self.environment.as_deref().map(str::trim) {
            Some(env) if !env.is_empty() => env.to_string(),
            _ => {
                return Err(PipelineError::Configuration(
                    "required parameter 'environment' is missing".to_string(),
                ))
            }
        };
        let working_directory = self.working_directory.unwrap_or_else(|| PathBuf::from("."));

        let mut names: Vec<String> = BuiltinScanner::ALL
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        for name in self.scanners.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }

        let mut scanners = Vec::with_capacity(names.len());
        for name in names {
            let overrides = self.scanners.get(&name).cloned().unwrap_or_default();
            let builtin = BuiltinScanner::from_name(&name);
            if builtin.is_none() && overrides.command.is_none() {
                return Err(PipelineError::Configuration(format!(
                    "scanner '{name}' is not builtin and declares no command"
                )));
            }
            let timeout_secs = overrides.timeout_secs.unwrap_or(DEFAULT_SCAN_TIMEOUT_SECS);
            if timeout_secs == 0 {
                return Err(PipelineError::Configuration(format!(
                    "scanner '{name}' must have a non-zero timeout"
                )));
            }
            scanners.push(ScannerConfig {
                name,
                enabled: overrides.enabled.unwrap_or(true),
                severity_threshold: overrides.severity_threshold.unwrap_or_default(),
                continue_on_error: overrides.continue_on_error.unwrap_or(false),
                working_directory: overrides
                    .working_directory
                    .unwrap_or_else(|| working_directory.clone()),
                var_file: overrides.var_file.or_else(|| self.var_file.clone()),
                timeout_secs,
                command: overrides.command,
            });
        }

        Ok(RunConfig {
            environment,
            working_directory,
            var_file: self.var_file,
            scanners,
            validate: ValidateSettings {
                policy: GatingPolicy::from_continue_on_error(
                    self.validate_continue_on_error.unwrap_or(false),
                ),
                timeout_secs: self
                    .validate_timeout_secs
                    .unwrap_or(DEFAULT_VALIDATE_TIMEOUT_SECS),
            },
            aggregate_policy: GatingPolicy::from_continue_on_error(
                self.aggregate_continue_on_error.unwrap_or(false),
            ),
            plan: PlanSettings {
                timeout_secs: self.plan_timeout_secs.unwrap_or(DEFAULT_PLAN_TIMEOUT_SECS),
                backend_config: self.backend_config,
                artifact_path: self.plan_artifact_path,
            },
            isolate_scans: self.isolate_scans.unwrap_or(true),
        })
    }
}

fn parse_bool(key: &str, value: &str) -> PipelineResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(PipelineError::Configuration(format!(
            "parameter '{key}' expects a boolean, got '{value}'"
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> PipelineResult<u64> {
    value.parse::<u64>().map_err(|_| {
        PipelineError::Configuration(format!(
            "parameter '{key}' expects an unsigned integer, got '{value}'"
        ))
    })
}
