//! Dependency-driven stage scheduler.
//!
//! A stage becomes ready once every stage it depends on is terminal. Ready
//! stages are spawned immediately, so independent stages (the scan fan-out)
//! run concurrently and a dependent with several predecessors (the
//! aggregator) waits on all of them: a join barrier.
//!
//! Before a ready stage starts, the scheduler checks its dependencies:
//! - a `Strict` dependency that ended `Failed` skips it with
//!   [`SkipReason::UpstreamFailed`]
//! - a dependency skipped for a blocking reason passes that reason on
//! - otherwise [`StageHandler::precondition`] may skip it (disabled, nothing
//!   to do)
//!
//! A handler `Err` is fatal: the stage ends `Failed` and every stage still
//! `Pending` is skipped with [`SkipReason::RunHalted`]. Stages already running
//! are allowed to finish. Nothing is retried.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::graph::{StageGraph, StageKind, StageNode};
use crate::obs;
use crate::outcome::{GatingPolicy, Outcome, SkipReason, StageState};

/// Executes individual stages on behalf of the [`Scheduler`].
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Called when `node` becomes ready and no upstream failure blocks it.
    /// Returning a reason skips the stage without running it.
    fn precondition(&self, _node: &StageNode) -> Option<SkipReason> {
        None
    }

    /// Run the stage. `Ok` carries `Succeeded` or `Failed`; `Err` halts the run.
    async fn run_stage(&self, node: &StageNode) -> PipelineResult<Outcome>;
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: usize,
    pub stage: String,
    pub from: StageState,
    pub to: StageState,
    /// Milliseconds since the scheduler started.
    pub elapsed_ms: u64,
}

/// Final state of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: String,
    pub kind: StageKind,
    pub policy: GatingPolicy,
    pub state: StageState,
    /// Wall-clock time spent running; `None` if the stage never ran.
    pub duration_ms: Option<u64>,
}

/// The fatal error that halted a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHalt {
    pub stage: String,
    pub kind: String,
    pub message: String,
    #[serde(skip)]
    pub error: Option<PipelineError>,
}

impl StageHalt {
    pub fn new(stage: &str, error: PipelineError) -> Self {
        Self {
            stage: stage.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            error: Some(error),
        }
    }
}

/// Everything the scheduler observed during one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub stages: BTreeMap<String, StageRecord>,
    pub transitions: Vec<Transition>,
    pub halted: Option<StageHalt>,
}

impl ScheduleReport {
    pub fn state(&self, stage: &str) -> Option<&StageState> {
        self.stages.get(stage).map(|r| &r.state)
    }

    pub fn outcome(&self, stage: &str) -> Option<Outcome> {
        self.state(stage).and_then(StageState::outcome)
    }

    /// Whether `stage` ever entered `Running`.
    pub fn entered_running(&self, stage: &str) -> bool {
        self.transitions
            .iter()
            .any(|t| t.stage == stage && t.to == StageState::Running)
    }

    /// Position in the transition log of the first transition of `stage`
    /// into a state matching `pred`.
    pub fn position(&self, stage: &str, pred: impl Fn(&StageState) -> bool) -> Option<usize> {
        self.transitions
            .iter()
            .position(|t| t.stage == stage && pred(&t.to))
    }

    /// Stages that failed under a `Strict` policy.
    pub fn strict_failures(&self) -> Vec<&str> {
        self.stages
            .values()
            .filter(|r| {
                r.policy == GatingPolicy::Strict
                    && r.state
                        == StageState::Done {
                            outcome: Outcome::Failed,
                        }
            })
            .map(|r| r.id.as_str())
            .collect()
    }
}

/// Drives a [`StageGraph`] to completion.
#[derive(Debug, Clone)]
pub struct Scheduler {
    graph: StageGraph,
    max_concurrency: Option<usize>,
}

impl Scheduler {
    pub fn new(graph: StageGraph) -> Self {
        Self {
            graph,
            max_concurrency: None,
        }
    }

    /// Cap the number of stages executing at once.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Run every stage of the graph through `handler`.
    ///
    /// Only fails if the graph itself is invalid; stage failures are recorded
    /// in the returned report.
    #[instrument(skip_all, fields(stages = self.graph.len()))]
    pub async fn run<H>(&self, handler: Arc<H>) -> PipelineResult<ScheduleReport>
    where
        H: StageHandler + 'static,
    {
        self.graph.topological_order()?;

        let limit = self.max_concurrency.unwrap_or(self.graph.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut progress = Progress::new(&self.graph)?;
        let mut inflight = FuturesUnordered::new();
        let mut halted: Option<StageHalt> = None;

        loop {
            while let Some(id) = progress.ready.pop_front() {
                if progress.state(&id) != &StageState::Pending {
                    continue;
                }
                let Some(node) = self.graph.node(&id) else {
                    continue;
                };

                if let Some(skip) = progress
                    .blocking_reason(&id)
                    .or_else(|| handler.precondition(node))
                {
                    obs::emit_stage_skipped(&id, &skip);
                    progress.transition(&id, StageState::Skipped { skip });
                    progress.settle(&id);
                    continue;
                }

                obs::emit_stage_started(&id);
                progress.transition(&id, StageState::Running);

                let node = node.clone();
                let handler = Arc::clone(&handler);
                let semaphore = Arc::clone(&semaphore);
                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let start = Instant::now();
                    let result = handler.run_stage(&node).await;
                    (result, start.elapsed().as_millis() as u64)
                });
                inflight.push(async move { (id, handle.await) });
            }

            let Some((id, joined)) = inflight.next().await else {
                break;
            };

            let (result, duration_ms) = match joined {
                Ok(finished) => finished,
                Err(e) => (
                    Err(PipelineError::StageAborted {
                        stage: id.clone(),
                        reason: e.to_string(),
                    }),
                    0,
                ),
            };
            progress.durations.insert(id.clone(), duration_ms);

            match result {
                Ok(outcome) => {
                    let outcome = if outcome == Outcome::Skipped {
                        warn!(stage = %id, "stage reported Skipped after running; recording Failed");
                        Outcome::Failed
                    } else {
                        outcome
                    };
                    obs::emit_stage_finished(&id, outcome, duration_ms);
                    progress.transition(&id, StageState::Done { outcome });
                }
                Err(error) => {
                    obs::emit_stage_finished(&id, Outcome::Failed, duration_ms);
                    progress.transition(
                        &id,
                        StageState::Done {
                            outcome: Outcome::Failed,
                        },
                    );
                    if halted.is_none() {
                        obs::emit_run_halted(&id, &error);
                        progress.halt_pending(&id);
                        halted = Some(StageHalt::new(&id, error));
                    } else {
                        warn!(stage = %id, error = %error, "additional fatal error after halt");
                    }
                }
            }
            progress.settle(&id);
        }

        Ok(progress.into_report(halted))
    }
}

/// Mutable bookkeeping for one scheduler run.
struct Progress<'g> {
    graph: &'g StageGraph,
    states: BTreeMap<String, StageState>,
    durations: HashMap<String, u64>,
    transitions: Vec<Transition>,
    waiting_on: HashMap<String, usize>,
    ready: VecDeque<String>,
    started: Instant,
}

impl<'g> Progress<'g> {
    fn new(graph: &'g StageGraph) -> PipelineResult<Self> {
        let mut waiting_on = HashMap::new();
        let mut ready = VecDeque::new();
        let mut states = BTreeMap::new();
        for node in graph.nodes() {
            let deps = graph.dependencies_of(&node.id)?.len();
            if deps == 0 {
                ready.push_back(node.id.clone());
            }
            waiting_on.insert(node.id.clone(), deps);
            states.insert(node.id.clone(), StageState::Pending);
        }
        Ok(Self {
            graph,
            states,
            durations: HashMap::new(),
            transitions: Vec::new(),
            waiting_on,
            ready,
            started: Instant::now(),
        })
    }

    fn state(&self, id: &str) -> &StageState {
        self.states.get(id).unwrap_or(&StageState::Pending)
    }

    fn transition(&mut self, id: &str, next: StageState) {
        let current = self.state(id).clone();
        if !current.can_transition_to(&next) {
            warn!(stage = %id, from = current.label(), to = next.label(), "illegal stage transition ignored");
            return;
        }
        self.transitions.push(Transition {
            seq: self.transitions.len(),
            stage: id.to_string(),
            from: current,
            to: next.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        });
        self.states.insert(id.to_string(), next);
    }

    /// `id` is terminal: release dependents whose last dependency it was.
    fn settle(&mut self, id: &str) {
        let graph = self.graph;
        for dependent in graph.dependents_of(id).unwrap_or_default() {
            if let Some(remaining) = self.waiting_on.get_mut(dependent) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    self.ready.push_back(dependent.to_string());
                }
            }
        }
    }

    fn blocking_reason(&self, id: &str) -> Option<SkipReason> {
        let graph = self.graph;
        for dep in graph.dependencies_of(id).unwrap_or_default() {
            let policy = graph.node(dep).map(|n| n.policy).unwrap_or_default();
            match self.state(dep) {
                StageState::Done {
                    outcome: Outcome::Failed,
                } if policy == GatingPolicy::Strict => {
                    return Some(SkipReason::UpstreamFailed {
                        stage: dep.to_string(),
                    })
                }
                StageState::Skipped { skip } if skip.blocks_dependents() => {
                    return Some(skip.clone())
                }
                _ => {}
            }
        }
        None
    }

    fn halt_pending(&mut self, halted_by: &str) {
        let pending: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| **s == StageState::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        for id in pending {
            let skip = SkipReason::RunHalted {
                stage: halted_by.to_string(),
            };
            obs::emit_stage_skipped(&id, &skip);
            self.transition(&id, StageState::Skipped { skip });
        }
    }

    fn into_report(self, halted: Option<StageHalt>) -> ScheduleReport {
        let stages = self
            .graph
            .nodes()
            .map(|node| {
                let record = StageRecord {
                    id: node.id.clone(),
                    kind: node.kind.clone(),
                    policy: node.policy,
                    state: self.state(&node.id).clone(),
                    duration_ms: self.durations.get(&node.id).copied(),
                };
                (node.id.clone(), record)
            })
            .collect();
        ScheduleReport {
            stages,
            transitions: self.transitions,
            halted,
        }
    }
}
