//! Dependency graph analysis and the runtime dependency resolver.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Topological
//! sort detects cycles, and depth-based grouping produces parallel waves. The
//! resolver half of the module is pure: given the top-level steps and the
//! current step results it reports which steps may run next.

use std::collections::{BTreeMap, HashMap, HashSet};

use marketflow_types::execution::{StepResult, StepStatus};
use marketflow_types::workflow::{DependencyType, StepDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build the dependency graph (edge from dependency to dependent) and return
/// it topologically sorted.
fn sorted_graph<'a>(
    steps: &'a [StepDefinition],
) -> Result<(DiGraph<&'a str, ()>, Vec<NodeIndex>), WorkflowError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for (to_idx, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{}'", node_id))
    })?;

    Ok((graph, sorted))
}

/// Validate that top-level steps form a DAG (no cycles, all references exist).
pub fn validate_dag(steps: &[StepDefinition]) -> Result<(), WorkflowError> {
    sorted_graph(steps).map(|_| ())
}

// ---------------------------------------------------------------------------
// Execution plan (wave computation)
// ---------------------------------------------------------------------------

/// Group top-level steps into parallel waves.
///
/// Every step in a wave depends only on steps in earlier waves. Within a wave
/// steps keep declaration order.
pub fn build_execution_plan<'a>(
    steps: &'a [StepDefinition],
) -> Result<Vec<Vec<&'a StepDefinition>>, WorkflowError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let id_to_step: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let (graph, sorted) = sorted_graph(steps)?;

    // Root nodes have depth 0
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for node_idx in sorted {
        let step_id = graph[node_idx];
        let depth = id_to_step[step_id]
            .depends_on
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(step_id, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&StepDefinition>> = vec![vec![]; max_depth + 1];
    for step in steps {
        waves[depths[step.id.as_str()]].push(step);
    }

    Ok(waves)
}

// ---------------------------------------------------------------------------
// Transitive dependency analysis
// ---------------------------------------------------------------------------

/// Returns the transitive closure of all dependencies for a given step.
///
/// If `step_id` is not found, returns an empty vec.
pub fn get_step_dependencies<'a>(step_id: &str, steps: &'a [StepDefinition]) -> Vec<&'a str> {
    let step_map: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visited = HashSet::new();
    let mut stack = vec![step_id];

    while let Some(current) = stack.pop() {
        if let Some(step) = step_map.get(current) {
            for dep in &step.depends_on {
                if visited.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }

    visited.into_iter().collect()
}

/// Declared dependencies already implied through another dependency.
///
/// Returns `(step_id, dependency)` pairs in declaration order.
pub fn redundant_dependencies(steps: &[StepDefinition]) -> Vec<(String, String)> {
    let mut redundant = Vec::new();
    for step in steps {
        for dep in &step.depends_on {
            let implied = step
                .depends_on
                .iter()
                .filter(|other| *other != dep)
                .any(|other| get_step_dependencies(other, steps).contains(&dep.as_str()));
            if implied {
                redundant.push((step.id.clone(), dep.clone()));
            }
        }
    }
    redundant
}

/// Longest chain of dependent steps, weighted by `cost`.
///
/// Returns the step ids on the path (first to last) and the summed cost.
pub fn critical_path(
    steps: &[StepDefinition],
    cost: impl Fn(&StepDefinition) -> u64,
) -> Result<(Vec<String>, u64), WorkflowError> {
    if steps.is_empty() {
        return Ok((vec![], 0));
    }

    let id_to_step: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let (graph, sorted) = sorted_graph(steps)?;

    // (total cost ending at this step, predecessor on the best path)
    let mut best: HashMap<&str, (u64, Option<&str>)> = HashMap::new();
    for node_idx in sorted {
        let step_id = graph[node_idx];
        let step = id_to_step[step_id];
        let (prior, prev) = step
            .depends_on
            .iter()
            .filter_map(|dep| best.get(dep.as_str()).map(|(c, _)| (*c, Some(dep.as_str()))))
            .max_by_key(|(c, _)| *c)
            .unwrap_or((0, None));
        best.insert(step_id, (prior + cost(step), prev));
    }

    let Some((&end, &(total, _))) = best.iter().max_by_key(|(_, (c, _))| *c) else {
        return Ok((vec![], 0));
    };

    let mut path = vec![end.to_string()];
    let mut cursor = best[end].1;
    while let Some(id) = cursor {
        path.push(id.to_string());
        cursor = best[id].1;
    }
    path.reverse();

    Ok((path, total))
}

// ---------------------------------------------------------------------------
// Dependency resolver
// ---------------------------------------------------------------------------

/// Scheduling state of a pending step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency is satisfied.
    Ready,
    /// Some dependency has not terminated yet.
    Waiting,
    /// A dependency terminated in a state that can never satisfy the step.
    Blocked { dependency: String },
}

/// Whether a dependency in `status` satisfies a step of `dependency_type`.
fn satisfies(status: StepStatus, dependency_type: DependencyType) -> bool {
    match dependency_type {
        DependencyType::SuccessOnly => status == StepStatus::Completed,
        DependencyType::AnyTerminal => status.is_terminal(),
    }
}

/// Readiness of one step against the current results.
pub fn readiness(step: &StepDefinition, results: &BTreeMap<String, StepResult>) -> Readiness {
    let mut waiting = false;
    for dep in &step.depends_on {
        let Some(result) = results.get(dep) else {
            return Readiness::Blocked {
                dependency: dep.clone(),
            };
        };
        if satisfies(result.status, step.dependency_type) {
            continue;
        }
        if result.status.is_terminal() {
            return Readiness::Blocked {
                dependency: dep.clone(),
            };
        }
        waiting = true;
    }

    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Pending top-level steps whose dependencies are all satisfied, in
/// declaration order.
pub fn ready_steps<'a>(
    steps: &'a [StepDefinition],
    results: &BTreeMap<String, StepResult>,
) -> Vec<&'a StepDefinition> {
    steps
        .iter()
        .filter(|s| results.get(&s.id).is_some_and(|r| r.status == StepStatus::Pending))
        .filter(|s| readiness(s, results) == Readiness::Ready)
        .collect()
}

/// Pending top-level steps that can never run, with the blocking dependency.
pub fn blocked_steps<'a>(
    steps: &'a [StepDefinition],
    results: &BTreeMap<String, StepResult>,
) -> Vec<(&'a StepDefinition, String)> {
    steps
        .iter()
        .filter(|s| results.get(&s.id).is_some_and(|r| r.status == StepStatus::Pending))
        .filter_map(|s| match readiness(s, results) {
            Readiness::Blocked { dependency } => Some((s, dependency)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
