//! Dependency-ordered entity loading.
//!
//! A general-purpose topological executor: callers declare a DAG of load
//! nodes with `depends_on` edges, and the loader executes nodes whose
//! dependencies have all completed, in priority order, with bounded
//! parallelism per readiness wave. A node whose ancestor failed is skipped
//! and reported as blocked, never executed. Partial success is a normal
//! outcome, not an error.

use crate::errors::PipelineError;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Lifecycle status of a load node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting on dependencies.
    Pending,
    /// Currently executing.
    Loading,
    /// Executed successfully.
    Completed,
    /// Executor returned an error.
    Error,
    /// Skipped because an ancestor failed.
    Blocked,
}

/// Declaration of one node in a load graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node id within the graph.
    pub id: String,
    /// Executor type handling this node (e.g. "images", "analyses").
    pub node_type: String,
    /// Ids of nodes that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Higher priority runs earlier within a readiness wave.
    #[serde(default)]
    pub priority: i32,
}

impl NodeSpec {
    /// Creates a node with no dependencies and default priority.
    #[must_use]
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            depends_on: Vec::new(),
            priority: 0,
        }
    }

    /// Adds a dependency edge.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Executes the load for nodes of one type.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Loads the data for a node.
    async fn load(&self, node: &NodeSpec) -> Result<serde_json::Value, PipelineError>;
}

/// The outcome of a graph load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Loaded data per completed node id.
    pub results: HashMap<String, serde_json::Value>,
    /// True if any node failed or was blocked.
    pub partial: bool,
    /// Failure reason per failed node id.
    pub errors: HashMap<String, String>,
    /// Blocking ancestor per skipped node id.
    pub blocked: HashMap<String, String>,
}

impl LoadReport {
    /// Final status of a node in this report.
    #[must_use]
    pub fn status_of(&self, id: &str) -> NodeStatus {
        if self.results.contains_key(id) {
            NodeStatus::Completed
        } else if self.errors.contains_key(id) {
            NodeStatus::Error
        } else if self.blocked.contains_key(id) {
            NodeStatus::Blocked
        } else {
            NodeStatus::Pending
        }
    }
}

/// Topological executor for dependency load graphs.
#[derive(Debug, Clone)]
pub struct DependencyLoader {
    max_parallelism: usize,
}

impl Default for DependencyLoader {
    fn default() -> Self {
        Self::new(4)
    }
}

impl DependencyLoader {
    /// Creates a loader with a parallelism fan-out limit.
    #[must_use]
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            max_parallelism: max_parallelism.max(1),
        }
    }

    /// Loads a graph of nodes using the provided per-type executors.
    ///
    /// Graph validation errors (unknown dependency, missing executor,
    /// dependency cycle) fail the whole call; execution failures of
    /// individual nodes yield a partial [`LoadReport`] instead.
    pub async fn load(
        &self,
        nodes: &[NodeSpec],
        executors: &HashMap<String, Arc<dyn NodeExecutor>>,
    ) -> Result<LoadReport, PipelineError> {
        validate_graph(nodes, executors)?;

        let by_id: HashMap<String, NodeSpec> = nodes
            .iter()
            .map(|node| (node.id.clone(), node.clone()))
            .collect();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<String, usize> = HashMap::new();
        for node in nodes {
            in_degree.insert(node.id.clone(), node.depends_on.len());
            for dep in &node.depends_on {
                children
                    .entry(dep.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }

        let mut report = LoadReport::default();
        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let mut ready: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut active: FuturesUnordered<
            tokio::task::JoinHandle<(String, Result<serde_json::Value, PipelineError>)>,
        > = FuturesUnordered::new();
        let mut remaining = nodes.len();

        while remaining > 0 {
            // Higher priority first within the wave.
            ready.sort_by_key(|id| std::cmp::Reverse(by_id[id].priority));
            for id in ready.drain(..) {
                let node = by_id[&id].clone();
                let executor = executors[&node.node_type].clone();
                let semaphore = semaphore.clone();
                debug!(node = %id, node_type = %node.node_type, "Scheduling load node");
                active.push(tokio::spawn(async move {
                    // Holds a permit for the duration of the load.
                    let _permit = semaphore.acquire_owned().await;
                    let result = executor.load(&node).await;
                    (node.id, result)
                }));
            }

            let Some(joined) = active.next().await else {
                return Err(PipelineError::Internal(
                    "dependency graph stalled with pending nodes".to_string(),
                ));
            };
            let (id, result) = joined
                .map_err(|e| PipelineError::Internal(format!("load task panicked: {e}")))?;
            remaining -= 1;

            match result {
                Ok(value) => {
                    report.results.insert(id.clone(), value);
                    for child in children.get(&id).cloned().unwrap_or_default() {
                        if let Some(degree) = in_degree.get_mut(&child) {
                            *degree = degree.saturating_sub(1);
                            if *degree == 0 && !report.blocked.contains_key(&child) {
                                ready.push(child);
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(node = %id, error = %err, "Load node failed");
                    report.errors.insert(id.clone(), err.to_string());
                    remaining -= block_descendants(&id, &children, &mut report);
                }
            }
        }

        report.partial = !report.errors.is_empty() || !report.blocked.is_empty();
        Ok(report)
    }
}

/// Marks all transitive descendants of a failed node as blocked.
///
/// Returns the number of nodes newly blocked.
fn block_descendants(
    failed: &str,
    children: &HashMap<String, Vec<String>>,
    report: &mut LoadReport,
) -> usize {
    let mut blocked = 0;
    let mut queue: VecDeque<String> = children.get(failed).cloned().unwrap_or_default().into();
    while let Some(id) = queue.pop_front() {
        if report.blocked.contains_key(&id) || report.errors.contains_key(&id) {
            continue;
        }
        report.blocked.insert(id.clone(), failed.to_string());
        blocked += 1;
        if let Some(next) = children.get(&id) {
            queue.extend(next.iter().cloned());
        }
    }
    blocked
}

fn validate_graph(
    nodes: &[NodeSpec],
    executors: &HashMap<String, Arc<dyn NodeExecutor>>,
) -> Result<(), PipelineError> {
    let ids: HashSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
    if ids.len() != nodes.len() {
        return Err(PipelineError::validation("duplicate node id in load graph"));
    }

    for node in nodes {
        if !executors.contains_key(&node.node_type) {
            return Err(PipelineError::validation(format!(
                "no executor registered for node type '{}'",
                node.node_type
            )));
        }
        for dep in &node.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(PipelineError::validation(format!(
                    "node '{}' depends on unknown node '{dep}'",
                    node.id
                )));
            }
        }
    }

    if let Some(cycle) = find_cycle(nodes) {
        return Err(PipelineError::validation(format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        )));
    }
    Ok(())
}

/// Returns a cycle path if the graph contains one.
fn find_cycle(nodes: &[NodeSpec]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &Vec<String>> = nodes
        .iter()
        .map(|node| (node.id.as_str(), &node.depends_on))
        .collect();

    fn visit<'a>(
        id: &'a str,
        deps: &HashMap<&'a str, &'a Vec<String>>,
        done: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        on_path: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if done.contains(id) {
            return None;
        }
        if on_path.contains(id) {
            let start = path.iter().position(|p| *p == id).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }

        path.push(id);
        on_path.insert(id);
        if let Some(node_deps) = deps.get(id) {
            for dep in node_deps.iter() {
                if let Some(cycle) = visit(dep, deps, done, path, on_path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        on_path.remove(id);
        done.insert(id);
        None
    }

    let mut done = HashSet::new();
    for node in nodes {
        let mut path = Vec::new();
        let mut on_path = HashSet::new();
        if let Some(cycle) = visit(&node.id, &deps, &mut done, &mut path, &mut on_path) {
            return Some(cycle);
        }
    }
    None
}
