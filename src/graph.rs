//! In-memory representation of a parsed DAG.
//!
//! The parser produces one [`PartyView`] per declared `(role, party_id)`
//! plus a merged global graph. Dependency edges come exclusively from
//! intra-job task-output channels; warehouse channels resolve to external
//! references and never constrain scheduling order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dag::{OutputSpec, PartyAddr};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("task {0:?} is not part of the graph")]
    UnknownTask(String),
    #[error("dependency cycle involving tasks {0:?}")]
    Cycle(Vec<String>),
}

/// A fully resolved input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedChannel {
    /// Output of another task in the same job; the producer is a scheduling
    /// dependency.
    TaskOutput {
        producer_task: String,
        output_key: String,
    },
    /// Pre-existing external dataset.
    Data {
        namespace: Option<String>,
        name: Option<String>,
        dataset_id: Option<String>,
    },
    /// Model produced by a prior job, with job-level defaults filled in.
    Model {
        model_id: String,
        model_version: i64,
    },
}

impl ResolvedChannel {
    /// The producer task name, when the channel carries a dependency.
    pub fn producer(&self) -> Option<&str> {
        match self {
            ResolvedChannel::TaskOutput { producer_task, .. } => Some(producer_task),
            _ => None,
        }
    }
}

/// Per-(role,party) view of one task: merged runtime parameters, resolved
/// channels, and the runtime party set permitted to execute it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub name: String,
    pub component_ref: String,
    pub stage: String,
    pub parameters: Map<String, Value>,
    pub conf: Map<String, Value>,
    pub inputs: BTreeMap<String, ResolvedChannel>,
    pub outputs: BTreeMap<String, OutputSpec>,
    /// Declared parties intersected with the component's supported roles.
    pub runtime_parties: Vec<PartyAddr>,
}

impl TaskNode {
    /// Producer tasks of this node's intra-job input channels.
    pub fn upstream(&self) -> BTreeSet<String> {
        self.inputs
            .values()
            .filter_map(|channel| channel.producer().map(str::to_string))
            .collect()
    }
}

/// Dependency graph induced on one `(role, party_id)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartyView {
    pub nodes: BTreeMap<String, TaskNode>,
    /// Directed edges `producer -> consumer`.
    pub edges: BTreeSet<(String, String)>,
}

impl PartyView {
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        topological_order(self.nodes.keys().cloned().collect(), &self.edges)
    }

    pub fn node(&self, name: &str) -> Option<&TaskNode> {
        self.nodes.get(name)
    }
}

/// The parsed task graph: per-party views plus the merged global graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    views: BTreeMap<PartyAddr, PartyView>,
    /// All task names, including those applicable to no local party.
    tasks: BTreeSet<String>,
    /// Union of dependency edges across every party view.
    global_edges: BTreeSet<(String, String)>,
    /// Runtime party set per task, for federated fan-out.
    task_parties: BTreeMap<String, Vec<PartyAddr>>,
}

impl TaskGraph {
    pub(crate) fn new(
        views: BTreeMap<PartyAddr, PartyView>,
        tasks: BTreeSet<String>,
        global_edges: BTreeSet<(String, String)>,
        task_parties: BTreeMap<String, Vec<PartyAddr>>,
    ) -> Self {
        Self {
            views,
            tasks,
            global_edges,
            task_parties,
        }
    }

    pub fn view(&self, addr: &PartyAddr) -> Option<&PartyView> {
        self.views.get(addr)
    }

    pub fn views(&self) -> impl Iterator<Item = (&PartyAddr, &PartyView)> {
        self.views.iter()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(String::as_str)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Runtime parties of one task, for command fan-out.
    pub fn parties_of(&self, task: &str) -> Result<&[PartyAddr], GraphError> {
        self.task_parties
            .get(task)
            .map(Vec::as_slice)
            .ok_or_else(|| GraphError::UnknownTask(task.to_string()))
    }

    /// Topological order of one party's induced subgraph.
    pub fn topological_order(&self, addr: &PartyAddr) -> Result<Vec<String>, GraphError> {
        match self.views.get(addr) {
            Some(view) => view.topological_order(),
            None => Ok(Vec::new()),
        }
    }

    /// Topological order over the merged global graph.
    pub fn global_topological_order(&self) -> Result<Vec<String>, GraphError> {
        topological_order(self.tasks.clone(), &self.global_edges)
    }

    /// The producer tasks a task waits on, merged across every party view.
    ///
    /// Warehouse channels are excluded: they reference external artifacts
    /// and carry no scheduling dependency.
    pub fn dependent_tasks(&self, task: &str) -> Result<BTreeSet<String>, GraphError> {
        if !self.tasks.contains(task) {
            return Err(GraphError::UnknownTask(task.to_string()));
        }
        Ok(self
            .global_edges
            .iter()
            .filter(|(_, consumer)| consumer == task)
            .map(|(producer, _)| producer.clone())
            .collect())
    }
}

/// Kahn's algorithm over an edge set; deterministic (name order) among
/// ready nodes.
fn topological_order(
    nodes: BTreeSet<String>,
    edges: &BTreeSet<(String, String)>,
) -> Result<Vec<String>, GraphError> {
    let mut in_degree: BTreeMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();
    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
    for (producer, consumer) in edges {
        if !nodes.contains(producer) || !nodes.contains(consumer) {
            continue;
        }
        *in_degree.get_mut(consumer.as_str()).expect("node present") += 1;
        downstream
            .entry(producer.as_str())
            .or_default()
            .push(consumer.as_str());
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(name) = ready.iter().next().copied() {
        ready.remove(name);
        order.push(name.to_string());
        if let Some(consumers) = downstream.get(name) {
            for consumer in consumers {
                let deg = in_degree.get_mut(consumer).expect("node present");
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(consumer);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let mut remaining: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        remaining.sort();
        return Err(GraphError::Cycle(remaining));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn topological_order_linearizes_chain() {
        let nodes: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let edges: BTreeSet<_> = [edge("a", "b"), edge("b", "c")].into_iter().collect();
        let order = topological_order(nodes, &edges).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn topological_order_detects_cycle() {
        let nodes: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let edges: BTreeSet<_> = [edge("a", "b"), edge("b", "a")].into_iter().collect();
        match topological_order(nodes, &edges) {
            Err(GraphError::Cycle(remaining)) => {
                assert_eq!(remaining, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn topological_order_is_deterministic_among_ready_nodes() {
        let nodes: BTreeSet<String> = ["z", "a", "m"].iter().map(|s| s.to_string()).collect();
        let order = topological_order(nodes, &BTreeSet::new()).unwrap();
        assert_eq!(order, vec!["a", "m", "z"]);
    }
}
