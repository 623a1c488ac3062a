//! Full pipeline runs driven through in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use infraflow_core::fakes::{
    CountingSigner, FailingSigner, FakePlanTool, FakeValidator, ScanScript, ScriptedScanner,
};
use infraflow_core::{
    verify_attestation, AttestOutcome, Collaborators, MemoryReportStore, Outcome, Pipeline,
    PipelineError, PipelineRun, PlanState, RunConfig, Signer, SkipReason, StageState, TaskFailure,
};

const SCANS: [&str; 4] = ["scan:checkov", "scan:terrascan", "scan:tflint", "scan:tfsec"];

struct Harness {
    validator: Arc<FakeValidator>,
    scanner: Arc<ScriptedScanner>,
    plan_tool: Arc<FakePlanTool>,
    signer: Arc<dyn Signer>,
    store: Arc<MemoryReportStore>,
    params: Vec<(String, String)>,
    environment: String,
}

impl Harness {
    fn new() -> Self {
        Self {
            validator: Arc::new(FakeValidator::passing()),
            scanner: Arc::new(ScriptedScanner::new()),
            plan_tool: Arc::new(FakePlanTool::no_changes()),
            signer: Arc::new(CountingSigner::new()),
            store: Arc::new(MemoryReportStore::new()),
            params: Vec::new(),
            environment: "dev".to_string(),
        }
    }

    fn param(mut self, key: &str, value: &str) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    fn config(&self) -> RunConfig {
        RunConfig::builder()
            .environment(&self.environment)
            .isolate_scans(false)
            .params(self.params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .unwrap()
            .build()
            .unwrap()
    }

    async fn run(&self) -> PipelineRun {
        let collaborators = Collaborators {
            validator: self.validator.clone(),
            scanner: self.scanner.clone(),
            plan_tool: self.plan_tool.clone(),
            signer: self.signer.clone(),
            store: self.store.clone(),
        };
        Pipeline::new(self.config(), collaborators, "ci@example.com")
            .run()
            .await
            .expect("pipeline graph is valid")
    }
}

fn terminal_position(run: &PipelineRun, stage: &str) -> usize {
    run.transitions
        .iter()
        .position(|t| t.stage == stage && t.to.is_terminal())
        .unwrap_or_else(|| panic!("{stage} never reached a terminal state"))
}

fn running_position(run: &PipelineRun, stage: &str) -> Option<usize> {
    run.transitions
        .iter()
        .position(|t| t.stage == stage && t.to == StageState::Running)
}

#[tokio::test]
async fn clean_run_without_changes_succeeds() {
    let h = Harness::new();
    let run = h.run().await;

    assert_eq!(run.exit_code(), 0);
    assert!(run.halted_by.is_none());
    assert_eq!(run.stage_outcome("validate"), Some(Outcome::Succeeded));
    for scan in SCANS {
        assert_eq!(run.stage_outcome(scan), Some(Outcome::Succeeded), "{scan}");
    }
    assert!(run.aggregate.as_ref().unwrap().all_passed);
    assert_eq!(run.plan.as_ref().unwrap().state, PlanState::NoChanges);
    assert_eq!(run.plan.as_ref().unwrap().exit_signal, 0);
    assert_eq!(h.plan_tool.init_calls(), 1);
    assert_eq!(h.validator.call_count(), 1);
}

#[tokio::test]
async fn aggregator_waits_for_every_scan() {
    let h = Harness {
        scanner: Arc::new(
            ScriptedScanner::new()
                .with("tfsec", ScanScript::Fail(1))
                .with_delay(Duration::from_millis(50)),
        ),
        ..Harness::new()
    };
    let run = h.run().await;

    let aggregate_start =
        running_position(&run, "aggregate").expect("aggregate ran after scan failure");
    for scan in SCANS {
        assert!(
            terminal_position(&run, scan) < aggregate_start,
            "{scan} was not terminal when aggregate started"
        );
    }
}

#[tokio::test]
async fn scans_run_concurrently() {
    let h = Harness {
        scanner: Arc::new(ScriptedScanner::new().with_delay(Duration::from_millis(100))),
        ..Harness::new()
    };
    let run = h.run().await;

    assert_eq!(run.exit_code(), 0);
    assert_eq!(h.scanner.peak_concurrency(), 4);
}

#[tokio::test]
async fn failed_validation_skips_every_scan_without_running_it() {
    let h = Harness {
        validator: Arc::new(FakeValidator::failing()),
        ..Harness::new()
    };
    let run = h.run().await;

    let blocked = SkipReason::UpstreamFailed {
        stage: "validate".to_string(),
    };
    for scan in SCANS {
        assert_eq!(run.skip_reason(scan), Some(&blocked), "{scan}");
        assert!(running_position(&run, scan).is_none(), "{scan} entered Running");
    }
    for stage in ["aggregate", "plan", "attest"] {
        assert_eq!(run.skip_reason(stage), Some(&blocked), "{stage}");
    }
    assert!(h.scanner.calls().is_empty());
    assert_eq!(h.plan_tool.init_calls(), 0);
    assert!(run.aggregate.is_none());
    assert_eq!(run.exit_code(), 1);
}

#[tokio::test]
async fn reporting_only_validation_lets_scans_run() {
    let h = Harness {
        validator: Arc::new(FakeValidator::failing()),
        ..Harness::new()
    }
    .param("validate-continueOnError", "true");
    let run = h.run().await;

    assert_eq!(run.stage_outcome("validate"), Some(Outcome::Failed));
    assert_eq!(h.scanner.calls().len(), 4);
    assert_eq!(run.stage_outcome("plan"), Some(Outcome::Succeeded));
    assert_eq!(run.exit_code(), 0);
}

#[tokio::test]
async fn disabled_scanner_is_distinct_from_blocked() {
    let h = Harness::new().param("enable-tfsec", "false");
    let run = h.run().await;

    assert_eq!(run.skip_reason("scan:tfsec"), Some(&SkipReason::Disabled));
    assert_eq!(h.scanner.call_count("tfsec"), 0);
    assert_eq!(
        run.task_result("tfsec").map(|r| r.outcome),
        Some(Outcome::Skipped)
    );

    let aggregate = run.aggregate.as_ref().unwrap();
    assert!(aggregate.all_passed);
    assert_eq!(aggregate.per_scanner["tfsec"], Outcome::Skipped);
    assert_eq!(aggregate.per_scanner.len(), 4);
    assert_eq!(run.exit_code(), 0);
}

#[tokio::test]
async fn every_scanner_disabled_still_reaches_plan() {
    let h = Harness::new()
        .param("enable-tflint", "false")
        .param("enable-tfsec", "false")
        .param("enable-checkov", "false")
        .param("enable-terrascan", "false");
    let run = h.run().await;

    assert!(h.scanner.calls().is_empty());
    let aggregate = run.aggregate.as_ref().unwrap();
    assert!(aggregate.all_passed);
    assert!(aggregate.per_scanner.values().all(|o| *o == Outcome::Skipped));
    assert_eq!(run.stage_outcome("plan"), Some(Outcome::Succeeded));
    assert_eq!(run.scan_group, Outcome::Skipped);
}

#[tokio::test]
async fn policy_violation_fails_gate_and_blocks_plan() {
    let h = Harness {
        scanner: Arc::new(ScriptedScanner::new().with("tfsec", ScanScript::Fail(3))),
        ..Harness::new()
    };
    let run = h.run().await;

    let tfsec = run.task_result("tfsec").unwrap();
    assert_eq!(tfsec.outcome, Outcome::Failed);
    assert_eq!(
        tfsec.failure,
        Some(TaskFailure::PolicyViolation { exit_code: 3 })
    );
    // Siblings are unaffected.
    assert_eq!(run.stage_outcome("scan:tflint"), Some(Outcome::Succeeded));

    assert_eq!(run.stage_outcome("aggregate"), Some(Outcome::Failed));
    let blocked = SkipReason::UpstreamFailed {
        stage: "aggregate".to_string(),
    };
    assert_eq!(run.skip_reason("plan"), Some(&blocked));
    assert_eq!(run.skip_reason("attest"), Some(&blocked));
    assert_eq!(h.plan_tool.init_calls(), 0);
    assert_eq!(run.exit_code(), 1);
}

#[tokio::test]
async fn crashed_scanner_is_execution_failure() {
    let h = Harness {
        scanner: Arc::new(
            ScriptedScanner::new().with("checkov", ScanScript::Crash("segfault".into())),
        ),
        ..Harness::new()
    };
    let run = h.run().await;

    let checkov = run.task_result("checkov").unwrap();
    assert_eq!(checkov.outcome, Outcome::Failed);
    assert!(matches!(
        checkov.failure,
        Some(TaskFailure::Execution { .. })
    ));
    assert!(!run.aggregate.as_ref().unwrap().all_passed);
}

#[tokio::test]
async fn reporting_only_gate_still_plans() {
    let h = Harness {
        scanner: Arc::new(ScriptedScanner::new().with("tfsec", ScanScript::Fail(1))),
        ..Harness::new()
    }
    .param("aggregate-continueOnError", "true");
    let run = h.run().await;

    assert_eq!(run.stage_outcome("aggregate"), Some(Outcome::Failed));
    assert_eq!(run.stage_outcome("plan"), Some(Outcome::Succeeded));
    // tfsec itself is not tolerated, so the scan group fails the run.
    assert_eq!(run.scan_group, Outcome::Failed);
    assert_eq!(run.exit_code(), 1);
}

#[tokio::test]
async fn tolerated_scanner_failure_with_reporting_gate_succeeds() {
    let h = Harness {
        scanner: Arc::new(ScriptedScanner::new().with("tfsec", ScanScript::Fail(1))),
        ..Harness::new()
    }
    .param("aggregate-continueOnError", "true")
    .param("tfsec-continueOnError", "true");
    let run = h.run().await;

    assert!(!run.aggregate.as_ref().unwrap().all_passed);
    assert_eq!(run.scan_group, Outcome::Succeeded);
    assert_eq!(run.exit_code(), 0);
}

#[tokio::test]
async fn scanner_timeout_is_failure() {
    let h = Harness {
        scanner: Arc::new(ScriptedScanner::new().with("terrascan", ScanScript::Hang)),
        ..Harness::new()
    }
    .param("terrascan-timeoutSecs", "1");
    let run = h.run().await;

    let terrascan = run.task_result("terrascan").unwrap();
    assert_eq!(terrascan.outcome, Outcome::Failed);
    assert!(terrascan.duration_budget_exceeded);
    assert_eq!(run.stage_outcome("scan:tflint"), Some(Outcome::Succeeded));
    assert_eq!(run.stage_outcome("aggregate"), Some(Outcome::Failed));
}

#[tokio::test]
async fn no_changes_never_invokes_signer() {
    let signer = Arc::new(CountingSigner::new());
    let h = Harness {
        signer: signer.clone(),
        ..Harness::new()
    };
    let run = h.run().await;

    assert_eq!(signer.call_count(), 0);
    assert_eq!(run.skip_reason("attest"), Some(&SkipReason::NotApplicable));
    assert_ne!(run.stage_outcome("attest"), Some(Outcome::Failed));
    assert_eq!(run.attestation, Some(AttestOutcome::NotApplicable));
    assert!(!h.store.keys().iter().any(|k| k.starts_with("attestation@")));
}

#[tokio::test]
async fn changes_are_attested_once() {
    let signer = Arc::new(CountingSigner::new());
    let h = Harness {
        signer: signer.clone(),
        plan_tool: Arc::new(FakePlanTool::changes()),
        ..Harness::new()
    };
    let run = h.run().await;

    let plan = run.plan.as_ref().unwrap();
    assert_eq!(plan.state, PlanState::ChangesDetected);
    assert_eq!(plan.exit_signal, 2);
    assert!(plan.artifact_hash.as_ref().unwrap().starts_with("sha256:"));

    assert_eq!(signer.call_count(), 1);
    let attestation = run
        .attestation
        .as_ref()
        .and_then(AttestOutcome::attestation)
        .expect("attestation recorded");
    assert_eq!(attestation.artifact_hash, *plan.artifact_hash.as_ref().unwrap());
    assert_eq!(attestation.subject_identity, "ci@example.com");
    verify_attestation(attestation, &signer.public_key_hex()).unwrap();
    assert!(h.store.keys().contains(&"attestation@dev".to_string()));
    assert_eq!(run.exit_code(), 0);
}

#[tokio::test]
async fn changes_override_raw_exit_code() {
    let h = Harness {
        plan_tool: Arc::new(FakePlanTool::with_summary(
            0,
            "Plan: 3 to add, 1 to change, 0 to destroy.",
        )),
        ..Harness::new()
    };
    let run = h.run().await;

    let plan = run.plan.as_ref().unwrap();
    assert_eq!(plan.state, PlanState::ChangesDetected);
    assert_eq!(plan.exit_signal, 2);
    assert_eq!(plan.raw_exit_code, Some(0));
}

#[tokio::test]
async fn lost_plan_artifact_halts_without_attestation() {
    let signer = Arc::new(CountingSigner::new());
    let h = Harness {
        signer: signer.clone(),
        plan_tool: Arc::new(FakePlanTool::losing_artifact(
            2,
            "Plan: 3 to add, 1 to change, 0 to destroy.",
        )),
        ..Harness::new()
    };
    let run = h.run().await;

    let plan = run.plan.as_ref().unwrap();
    assert_eq!(plan.state, PlanState::Errored);
    assert!(plan.artifact_hash.is_none());
    assert_eq!(run.halted_by.as_ref().unwrap().kind, "plan_execution_error");
    assert_eq!(signer.call_count(), 0);
    assert_eq!(run.exit_code(), 1);
}

#[tokio::test]
async fn unparseable_summary_halts_without_attestation() {
    let signer = Arc::new(CountingSigner::new());
    let h = Harness {
        signer: signer.clone(),
        plan_tool: Arc::new(FakePlanTool::with_summary(2, "Something unexpected happened")),
        ..Harness::new()
    };
    let run = h.run().await;

    let plan = run.plan.as_ref().unwrap();
    assert_eq!(plan.state, PlanState::Errored);
    assert!(matches!(plan.error, Some(PipelineError::PlanParse(_))));

    let halt = run.halted_by.as_ref().unwrap();
    assert_eq!(halt.stage, "plan");
    assert_eq!(halt.kind, "plan_parse_error");
    assert_eq!(
        run.skip_reason("attest"),
        Some(&SkipReason::RunHalted {
            stage: "plan".to_string()
        })
    );
    assert_eq!(signer.call_count(), 0);
    assert!(run.attestation.is_none());
    assert_eq!(run.exit_code(), 1);
}

#[tokio::test]
async fn backend_auth_failure_never_plans() {
    let h = Harness {
        plan_tool: Arc::new(FakePlanTool::failing_init("403 from state bucket")),
        ..Harness::new()
    };
    let run = h.run().await;

    assert_eq!(h.plan_tool.init_calls(), 1);
    assert_eq!(h.plan_tool.plan_calls(), 0);
    assert_eq!(run.halted_by.as_ref().unwrap().kind, "backend_auth_error");
    assert_eq!(run.plan.as_ref().unwrap().state, PlanState::Errored);
    assert_eq!(run.exit_code(), 1);
}

#[tokio::test]
async fn signing_failure_is_fatal_and_not_retried() {
    let signer = Arc::new(FailingSigner::new());
    let h = Harness {
        signer: signer.clone(),
        plan_tool: Arc::new(FakePlanTool::changes()),
        ..Harness::new()
    };
    let run = h.run().await;

    assert_eq!(signer.call_count(), 1);
    assert_eq!(run.stage_outcome("attest"), Some(Outcome::Failed));
    assert_eq!(run.halted_by.as_ref().unwrap().kind, "attestation_error");
    assert!(run.attestation.is_none());
    assert_eq!(run.exit_code(), 1);
}

#[tokio::test]
async fn backend_config_reaches_plan_only() {
    let h = Harness::new().param("backend-bucket", "tf-state-dev");
    h.run().await;

    let requests = h.plan_tool.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].backend_config["bucket"], "tf-state-dev");
    // Scan requests carry no backend settings at all; check what they do get.
    for request in h.scanner.calls() {
        assert_eq!(request.environment, "dev");
    }
}

#[tokio::test]
async fn reports_from_different_environments_do_not_collide() {
    let store = Arc::new(MemoryReportStore::new());
    for environment in ["staging", "prod"] {
        let h = Harness {
            store: store.clone(),
            environment: environment.to_string(),
            ..Harness::new()
        };
        h.run().await;
    }

    let keys = store.keys();
    assert!(keys.contains(&"tfsec@staging".to_string()));
    assert!(keys.contains(&"tfsec@prod".to_string()));
    assert_eq!(keys.len(), 8);
}

#[tokio::test]
async fn severity_threshold_is_passed_to_scanner() {
    let h = Harness::new().param("checkov-severityThreshold", "critical");
    h.run().await;

    let checkov = h
        .scanner
        .calls()
        .into_iter()
        .find(|r| r.scanner == "checkov")
        .unwrap();
    assert_eq!(checkov.severity_threshold.as_str(), "critical");
}

#[test]
fn missing_environment_is_configuration_error() {
    let err = RunConfig::builder().build().unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));

    let err = RunConfig::builder().environment("  ").build().unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
}

#[tokio::test]
async fn every_transition_is_legal() {
    let h = Harness {
        scanner: Arc::new(ScriptedScanner::new().with("tflint", ScanScript::Fail(2))),
        ..Harness::new()
    }
    .param("enable-checkov", "false");
    let run = h.run().await;

    for (i, t) in run.transitions.iter().enumerate() {
        assert_eq!(t.seq, i);
        assert!(
            t.from.can_transition_to(&t.to),
            "illegal transition {:?} -> {:?} for {}",
            t.from,
            t.to,
            t.stage
        );
    }
    for record in run.stages.values() {
        assert!(record.state.is_terminal(), "{} not terminal", record.id);
    }
}
