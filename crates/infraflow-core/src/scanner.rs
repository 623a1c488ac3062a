//! Built-in policy/security scanner definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Minimum finding severity that makes a scanner fail.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SeverityThreshold {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl SeverityThreshold {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityThreshold::Low => "low",
            SeverityThreshold::Medium => "medium",
            SeverityThreshold::High => "high",
            SeverityThreshold::Critical => "critical",
        }
    }

    /// Upper-case spelling used by most scanner CLIs.
    pub fn as_upper(&self) -> &'static str {
        match self {
            SeverityThreshold::Low => "LOW",
            SeverityThreshold::Medium => "MEDIUM",
            SeverityThreshold::High => "HIGH",
            SeverityThreshold::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for SeverityThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeverityThreshold {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(SeverityThreshold::Low),
            "medium" => Ok(SeverityThreshold::Medium),
            "high" => Ok(SeverityThreshold::High),
            "critical" => Ok(SeverityThreshold::Critical),
            other => Err(PipelineError::Configuration(format!(
                "unknown severity threshold '{other}' (expected low, medium, high or critical)"
            ))),
        }
    }
}

/// Scanners with a known default command line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinScanner {
    /// tflint --chdir <dir> --format json
    Tflint,

    /// tfsec <dir> --minimum-severity <SEV> --format json
    Tfsec,

    /// checkov -d <dir> --output json --hard-fail-on <SEV>
    Checkov,

    /// terrascan scan -d <dir> --severity <sev> -o json
    Terrascan,
}

impl BuiltinScanner {
    pub const ALL: [BuiltinScanner; 4] = [
        BuiltinScanner::Tflint,
        BuiltinScanner::Tfsec,
        BuiltinScanner::Checkov,
        BuiltinScanner::Terrascan,
    ];

    /// Get the scanner name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinScanner::Tflint => "tflint",
            BuiltinScanner::Tfsec => "tfsec",
            BuiltinScanner::Checkov => "checkov",
            BuiltinScanner::Terrascan => "terrascan",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Command template; placeholders are filled by [`render_command`].
    pub fn command_template(&self) -> Vec<String> {
        let parts: &[&str] = match self {
            BuiltinScanner::Tflint => &[
                "tflint",
                "--chdir",
                "{working_directory}",
                "--format",
                "json",
                "--minimum-failure-severity",
                "{tflint_severity}",
            ],
            BuiltinScanner::Tfsec => &[
                "tfsec",
                "{working_directory}",
                "--minimum-severity",
                "{SEVERITY}",
                "--format",
                "json",
                "--no-color",
            ],
            BuiltinScanner::Checkov => &[
                "checkov",
                "-d",
                "{working_directory}",
                "--output",
                "json",
                "--hard-fail-on",
                "{SEVERITY}",
            ],
            BuiltinScanner::Terrascan => &[
                "terrascan",
                "scan",
                "-d",
                "{working_directory}",
                "--severity",
                "{severity}",
                "-o",
                "json",
            ],
        };
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// Flag used to pass a variables file, if the tool accepts one.
    pub fn var_file_flag(&self) -> Option<&'static str> {
        match self {
            BuiltinScanner::Tflint => Some("--var-file"),
            BuiltinScanner::Tfsec => Some("--tfvars-file"),
            BuiltinScanner::Checkov => Some("--var-file"),
            BuiltinScanner::Terrascan => None,
        }
    }
}

/// Substitute `{working_directory}`, `{var_file}` and severity placeholders.
///
/// Arguments that reference `{var_file}` are dropped when no var file is set.
pub fn render_command(
    template: &[String],
    working_directory: &str,
    var_file: Option<&str>,
    severity: SeverityThreshold,
) -> Vec<String> {
    // tflint has no "critical"; error is its strictest level.
    let tflint_severity = match severity {
        SeverityThreshold::Low => "notice",
        SeverityThreshold::Medium => "warning",
        SeverityThreshold::High | SeverityThreshold::Critical => "error",
    };

    template
        .iter()
        .filter(|arg| var_file.is_some() || !arg.contains("{var_file}"))
        .map(|arg| {
            arg.replace("{working_directory}", working_directory)
                .replace("{var_file}", var_file.unwrap_or_default())
                .replace("{SEVERITY}", severity.as_upper())
                .replace("{severity}", severity.as_str())
                .replace("{tflint_severity}", tflint_severity)
        })
        .collect()
}
