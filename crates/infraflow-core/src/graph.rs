//! Stage dependency graph.
//!
//! Stages are typed nodes in a directed acyclic graph. An edge `A → B` means
//! "B depends on A": B may start only once A is terminal.
//!
//! Ordering is computed with Kahn's algorithm. [`StageGraph::levels`] groups
//! stages into waves whose members are mutually independent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::outcome::GatingPolicy;

/// What a stage does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "scanner", rename_all = "snake_case")]
pub enum StageKind {
    Validate,
    Scan(String),
    Aggregate,
    Plan,
    Attest,
}

impl StageKind {
    /// Stable stage id for this kind.
    pub fn stage_id(&self) -> String {
        match self {
            StageKind::Validate => "validate".to_string(),
            StageKind::Scan(name) => format!("scan:{name}"),
            StageKind::Aggregate => "aggregate".to_string(),
            StageKind::Plan => "plan".to_string(),
            StageKind::Attest => "attest".to_string(),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stage_id())
    }
}

/// A single stage in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageNode {
    pub id: String,
    pub kind: StageKind,
    /// Whether this stage's failure skips its dependents.
    pub policy: GatingPolicy,
}

impl StageNode {
    pub fn new(kind: StageKind, policy: GatingPolicy) -> Self {
        Self {
            id: kind.stage_id(),
            kind,
            policy,
        }
    }
}

/// Directed dependency graph over [`StageNode`]s.
///
/// Edges are kept as `dependency → dependents` and `dependent → dependencies`
/// adjacency sets. Cycles are rejected when an edge is inserted.
#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    nodes: BTreeMap<String, StageNode>,
    downstream: HashMap<String, BTreeSet<String>>,
    upstream: HashMap<String, BTreeSet<String>>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the fixed pipeline graph for a run:
    /// `validate → scan:<name>* → aggregate → plan → attest`.
    ///
    /// Every configured scanner gets a stage, disabled ones included, so the
    /// run record always lists them. Scan stages never gate the aggregator.
    pub fn standard(config: &RunConfig) -> PipelineResult<Self> {
        let mut g = StageGraph::new();
        let validate = g.add_node(StageNode::new(StageKind::Validate, config.validate.policy));
        let aggregate = g.add_node(StageNode::new(
            StageKind::Aggregate,
            config.aggregate_policy,
        ));
        // Errored plans and attestation failures halt the run regardless.
        let plan = g.add_node(StageNode::new(StageKind::Plan, GatingPolicy::Strict));
        let attest = g.add_node(StageNode::new(StageKind::Attest, GatingPolicy::Strict));

        for scanner in &config.scanners {
            let scan = g.add_node(StageNode::new(
                StageKind::Scan(scanner.name.clone()),
                GatingPolicy::ReportingOnly,
            ));
            g.add_dependency(&validate, &scan)?;
            g.add_dependency(&scan, &aggregate)?;
        }
        if config.scanners.is_empty() {
            g.add_dependency(&validate, &aggregate)?;
        }
        g.add_dependency(&aggregate, &plan)?;
        g.add_dependency(&plan, &attest)?;
        Ok(g)
    }

    /// Register a node and return its id. Re-registering replaces the node.
    pub fn add_node(&mut self, node: StageNode) -> String {
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        self.downstream.entry(id.clone()).or_default();
        self.upstream.entry(id.clone()).or_default();
        id
    }

    /// Add an edge: `dependent` depends on `dependency`.
    ///
    /// Both stages must already be registered. Returns
    /// [`PipelineError::GraphCycle`] and leaves the graph untouched if the
    /// edge would close a cycle.
    pub fn add_dependency(&mut self, dependency: &str, dependent: &str) -> PipelineResult<()> {
        for id in [dependency, dependent] {
            if !self.nodes.contains_key(id) {
                return Err(PipelineError::StageNotFound {
                    stage: id.to_string(),
                });
            }
        }

        self.downstream
            .entry(dependency.to_string())
            .or_default()
            .insert(dependent.to_string());
        self.upstream
            .entry(dependent.to_string())
            .or_default()
            .insert(dependency.to_string());

        if let Some(cycle) = self.find_cycle_through(dependent) {
            if let Some(set) = self.downstream.get_mut(dependency) {
                set.remove(dependent);
            }
            if let Some(set) = self.upstream.get_mut(dependent) {
                set.remove(dependency);
            }
            return Err(PipelineError::GraphCycle { stages: cycle });
        }

        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&StageNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of the stages `id` depends on.
    pub fn dependencies_of(&self, id: &str) -> PipelineResult<Vec<&str>> {
        self.require(id)?;
        Ok(self
            .upstream
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect())
    }

    /// Ids of the stages that depend on `id`.
    pub fn dependents_of(&self, id: &str) -> PipelineResult<Vec<&str>> {
        self.require(id)?;
        Ok(self
            .downstream
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect())
    }

    /// All stages reachable downstream from `id` (BFS).
    pub fn transitive_dependents_of(&self, id: &str) -> PipelineResult<BTreeSet<String>> {
        self.require(id)?;

        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(id.to_string());

        while let Some(current) = queue.pop_front() {
            if let Some(deps) = self.downstream.get(&current) {
                for dep in deps {
                    if visited.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }

        Ok(visited)
    }

    /// Stages in dependency order (Kahn's algorithm, ties broken by id).
    pub fn topological_order(&self) -> PipelineResult<Vec<&StageNode>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Stages grouped into waves; every stage in wave `n` depends only on
    /// stages in waves `< n`.
    pub fn levels(&self) -> PipelineResult<Vec<Vec<&StageNode>>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|id| {
                let deg = self.upstream.get(id).map_or(0, BTreeSet::len);
                (id.as_str(), deg)
            })
            .collect();

        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        current.sort_unstable();

        let mut levels = Vec::new();
        let mut seen = 0usize;

        while !current.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            for id in &current {
                if let Some(dependents) = self.downstream.get(*id) {
                    for dep in dependents {
                        if let Some(deg) = in_degree.get_mut(dep.as_str()) {
                            *deg -= 1;
                            if *deg == 0 {
                                next.push(dep.as_str());
                            }
                        }
                    }
                }
            }
            seen += current.len();
            levels.push(
                current
                    .iter()
                    .filter_map(|id| self.nodes.get(*id))
                    .collect(),
            );
            next.sort_unstable();
            current = next;
        }

        if seen != self.nodes.len() {
            return Err(PipelineError::GraphCycle {
                stages: self.nodes.keys().cloned().collect(),
            });
        }

        Ok(levels)
    }

    fn require(&self, id: &str) -> PipelineResult<&StageNode> {
        self.nodes.get(id).ok_or_else(|| PipelineError::StageNotFound {
            stage: id.to_string(),
        })
    }

    /// DFS from `start`; returns the cycle path if one is found.
    fn find_cycle_through(&self, start: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.dfs_cycle(start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_cycle(&self, node: &str, visited: &mut HashSet<String>, path: &mut Vec<String>) -> bool {
        if path.iter().any(|p| p == node) {
            path.push(node.to_string());
            return true;
        }
        if !visited.insert(node.to_string()) {
            return false;
        }
        path.push(node.to_string());

        if let Some(dependents) = self.downstream.get(node) {
            for dep in dependents {
                if self.dfs_cycle(dep, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }
}
