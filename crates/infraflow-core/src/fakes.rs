//! In-memory collaborators (testing only)
//!
//! Scripted stand-ins for the scanner, validator, plan tool and signer so a
//! full pipeline run can be driven without any external binaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::attest::{Ed25519Signer, Signer};
use crate::error::{PipelineError, PipelineResult, ToolError};
use crate::outcome::Outcome;
use crate::plan::{PlanOutput, PlanRequest, PlanTool};
use crate::runner::{ScanOutput, ScanRequest, Scanner};
use crate::validate::{ValidateOutput, ValidateRequest, Validator};

/// Fixed seed used by the fake signers.
pub const TEST_SEED: [u8; 32] = [7u8; 32];

// ---------------------------------------------------------------------------
// ScriptedScanner
// ---------------------------------------------------------------------------

/// What a scripted scanner does when invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScript {
    /// Exit 0.
    Pass,
    /// Complete with a nonzero exit (findings above threshold).
    Fail(i32),
    /// The tool could not be run.
    Crash(String),
    /// Never finishes; only a timeout ends it.
    Hang,
}

/// Scanner whose behaviour is scripted per scanner name. Unscripted scanners
/// pass.
#[derive(Debug, Default)]
pub struct ScriptedScanner {
    scripts: Mutex<HashMap<String, ScanScript>>,
    delay: Duration,
    calls: Mutex<Vec<ScanRequest>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, scanner: &str, script: ScanScript) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(scanner.to_string(), script);
        self
    }

    /// Sleep this long inside every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<ScanRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, scanner: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.scanner == scanner)
            .count()
    }

    /// Highest number of scans observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for ScriptedScanner {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanOutput, ToolError> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.scanner)
            .cloned()
            .unwrap_or(ScanScript::Pass);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match script {
            ScanScript::Pass => Ok(ScanOutput {
                exit_code: Some(0),
                report: format!("{{\"scanner\":\"{}\",\"findings\":[]}}", request.scanner),
                stderr: String::new(),
            }),
            ScanScript::Fail(code) => Ok(ScanOutput {
                exit_code: Some(code),
                report: format!("{{\"scanner\":\"{}\",\"findings\":[1]}}", request.scanner),
                stderr: String::new(),
            }),
            ScanScript::Crash(message) => Err(ToolError::Other(message)),
            ScanScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ToolError::Other("hang finished".to_string()))
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// FakeValidator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FakeValidator {
    outcome: Outcome,
    calls: AtomicUsize,
}

impl FakeValidator {
    pub fn passing() -> Self {
        Self {
            outcome: Outcome::Succeeded,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            outcome: Outcome::Failed,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for FakeValidator {
    async fn validate(&self, _request: &ValidateRequest) -> Result<ValidateOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ValidateOutput {
            outcome: self.outcome,
            diagnostics: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// FakePlanTool
// ---------------------------------------------------------------------------

/// Plan tool returning a canned summary.
#[derive(Debug)]
pub struct FakePlanTool {
    init_error: Option<String>,
    output: PlanOutput,
    saves_artifact: bool,
    init_calls: AtomicUsize,
    plan_calls: AtomicUsize,
    requests: Mutex<Vec<PlanRequest>>,
}

impl FakePlanTool {
    pub fn with_summary(exit_code: i32, summary: &str) -> Self {
        Self {
            init_error: None,
            output: PlanOutput {
                exit_code: Some(exit_code),
                summary: summary.to_string(),
                artifact: Some(format!("artifact:{summary}").into_bytes()),
            },
            saves_artifact: true,
            init_calls: AtomicUsize::new(0),
            plan_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn no_changes() -> Self {
        Self::with_summary(0, "Plan: 0 to add, 0 to change, 0 to destroy.")
    }

    pub fn changes() -> Self {
        Self::with_summary(2, "Plan: 3 to add, 1 to change, 0 to destroy.")
    }

    /// A tool that never saves an artifact; the summary is hashed instead.
    pub fn without_artifact(exit_code: i32, summary: &str) -> Self {
        let mut tool = Self::with_summary(exit_code, summary);
        tool.output.artifact = None;
        tool.saves_artifact = false;
        tool
    }

    /// A tool that should save an artifact but returns none.
    pub fn losing_artifact(exit_code: i32, summary: &str) -> Self {
        let mut tool = Self::with_summary(exit_code, summary);
        tool.output.artifact = None;
        tool
    }

    /// Backend initialisation fails with `message`.
    pub fn failing_init(message: &str) -> Self {
        let mut tool = Self::no_changes();
        tool.init_error = Some(message.to_string());
        tool
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlanTool for FakePlanTool {
    async fn init(&self, request: &PlanRequest) -> Result<(), ToolError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        match &self.init_error {
            Some(message) => Err(ToolError::BackendInit(message.clone())),
            None => Ok(()),
        }
    }

    async fn plan(&self, _request: &PlanRequest) -> Result<PlanOutput, ToolError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }

    fn saves_artifact(&self) -> bool {
        self.saves_artifact
    }
}

// ---------------------------------------------------------------------------
// Signers
// ---------------------------------------------------------------------------

/// Real Ed25519 signer that counts invocations.
#[derive(Debug)]
pub struct CountingSigner {
    inner: Ed25519Signer,
    calls: AtomicUsize,
}

impl Default for CountingSigner {
    fn default() -> Self {
        Self {
            inner: Ed25519Signer::from_seed(TEST_SEED),
            calls: AtomicUsize::new(0),
        }
    }
}

impl CountingSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Signer for CountingSigner {
    fn public_key_hex(&self) -> String {
        self.inner.public_key_hex()
    }

    async fn sign(&self, payload: &[u8]) -> PipelineResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.sign(payload).await
    }
}

/// Signer that always fails.
#[derive(Debug, Default)]
pub struct FailingSigner {
    calls: AtomicUsize,
}

impl FailingSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Signer for FailingSigner {
    fn public_key_hex(&self) -> String {
        String::new()
    }

    async fn sign(&self, _payload: &[u8]) -> PipelineResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Attestation("signing key unavailable".to_string()))
    }
}
