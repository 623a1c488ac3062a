//! Child-process execution shared by the command-backed collaborators.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;

/// Captured result of a finished child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `argv` in `cwd` and capture its output.
///
/// The child is killed if the returned future is dropped, so callers can
/// bound it with `tokio::time::timeout`.
pub async fn run_process(argv: &[String], cwd: &Path) -> Result<ProcessOutput, ToolError> {
    let (exe, args) = argv
        .split_first()
        .ok_or_else(|| ToolError::EmptyCommand(cwd.display().to_string()))?;

    debug!(program = %exe, cwd = %cwd.display(), "spawning process");
    let start = Instant::now();

    let child = Command::new(exe)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ToolError::Spawn {
            program: exe.clone(),
            source,
        })?;

    let output = child.wait_with_output().await?;

    Ok(ProcessOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}
