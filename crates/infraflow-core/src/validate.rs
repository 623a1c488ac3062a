//! Static configuration validation, the first stage of every run.
//!
//! Validation never touches the remote backend: `terraform init` runs with
//! `-backend=false` so providers and modules resolve without state access.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::outcome::Outcome;
use crate::process::run_process;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub environment: String,
    pub working_directory: PathBuf,
}

/// Outcome of a completed validation run plus the tool's diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutput {
    pub outcome: Outcome,
    pub diagnostics: String,
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// `Err` means the validator could not run at all.
    async fn validate(&self, request: &ValidateRequest) -> Result<ValidateOutput, ToolError>;
}

/// `terraform init -backend=false` followed by `terraform validate`.
#[derive(Debug, Clone)]
pub struct TerraformValidator {
    binary: String,
}

impl Default for TerraformValidator {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
        }
    }
}

impl TerraformValidator {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn commands(&self) -> [Vec<String>; 2] {
        [
            vec![
                self.binary.clone(),
                "init".into(),
                "-backend=false".into(),
                "-input=false".into(),
                "-no-color".into(),
            ],
            vec![self.binary.clone(), "validate".into(), "-no-color".into()],
        ]
    }
}

#[async_trait]
impl Validator for TerraformValidator {
    async fn validate(&self, request: &ValidateRequest) -> Result<ValidateOutput, ToolError> {
        let mut diagnostics = String::new();
        for argv in self.commands() {
            let output = run_process(&argv, &request.working_directory).await?;
            diagnostics.push_str(&output.stdout);
            diagnostics.push_str(&output.stderr);
            if !output.success() {
                return Ok(ValidateOutput {
                    outcome: Outcome::Failed,
                    diagnostics,
                });
            }
        }
        Ok(ValidateOutput {
            outcome: Outcome::Succeeded,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_never_configures_backend() {
        let [init, validate] = TerraformValidator::default().commands();
        assert!(init.contains(&"-backend=false".to_string()));
        assert!(!init.iter().any(|a| a.starts_with("-backend-config")));
        assert_eq!(validate[1], "validate");
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_error() {
        let validator = TerraformValidator::new("/nonexistent-terraform-binary");
        let request = ValidateRequest {
            environment: "dev".into(),
            working_directory: PathBuf::from("."),
        };
        assert!(validator.validate(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_step_reports_failed() {
        // `false init ...` exits 1 regardless of arguments.
        let validator = TerraformValidator::new("false");
        let request = ValidateRequest {
            environment: "dev".into(),
            working_directory: PathBuf::from("."),
        };
        let out = validator.validate(&request).await.unwrap();
        assert_eq!(out.outcome, Outcome::Failed);
    }
}
