//! Aggregation gate over scan task results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ScannerConfig;
use crate::outcome::Outcome;
use crate::runner::TaskResult;

/// Gate decision plus the per-scanner outcome table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// True iff every enabled scanner succeeded.
    pub all_passed: bool,
    /// One entry per configured scanner, disabled ones included.
    pub per_scanner: BTreeMap<String, Outcome>,
}

impl AggregateResult {
    pub fn outcome(&self) -> Outcome {
        if self.all_passed {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        }
    }

    /// Names of scanners whose outcome is `Failed`.
    pub fn failing(&self) -> Vec<&str> {
        self.per_scanner
            .iter()
            .filter(|(_, o)| o.is_failure())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Collapse scan results into a gate decision.
///
/// For every configured scanner:
/// - disabled → `Skipped`, excluded from the conjunction
/// - enabled with a result → that result's outcome
/// - enabled without a result → `Skipped`, which still fails the conjunction
///
/// Results for scanners that are not configured are ignored. Pure and
/// deterministic; never fails.
pub fn aggregate(scanners: &[ScannerConfig], results: &[TaskResult]) -> AggregateResult {
    let by_name: BTreeMap<&str, &TaskResult> = results
        .iter()
        .map(|r| (r.scanner_name.as_str(), r))
        .collect();

    let mut per_scanner = BTreeMap::new();
    let mut all_passed = true;

    for scanner in scanners {
        let outcome = if !scanner.enabled {
            Outcome::Skipped
        } else {
            let outcome = match by_name.get(scanner.name.as_str()) {
                Some(result) => result.outcome,
                None => Outcome::Skipped,
            };
            all_passed &= outcome == Outcome::Succeeded;
            outcome
        };
        per_scanner.insert(scanner.name.clone(), outcome);
    }

    AggregateResult {
        all_passed,
        per_scanner,
    }
}

/// Outcome of the scan stage group.
///
/// Failed iff some enabled task failed without `continue_on_error`.
pub fn scan_group_outcome(results: &[TaskResult]) -> Outcome {
    let ran: Vec<&TaskResult> = results
        .iter()
        .filter(|r| r.outcome != Outcome::Skipped)
        .collect();
    if ran.is_empty() {
        return Outcome::Skipped;
    }
    if ran
        .iter()
        .any(|r| r.outcome == Outcome::Failed && !r.continue_on_error)
    {
        Outcome::Failed
    } else {
        Outcome::Succeeded
    }
}
