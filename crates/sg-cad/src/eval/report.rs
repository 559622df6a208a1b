//! Results of an evaluation pass

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::graph::{BuildState, Graph, NodeId, NodeKind};
use crate::hash::ContentHash;

/// Per-node outcome, for the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: NodeId,
    pub name: String,
    pub kind: NodeKind,
    /// `built`, `failed`, `pending` or `unbuilt`
    pub status: String,
    /// Value summary when built, cause when failed
    pub message: String,
    pub hash: Option<ContentHash>,
}

impl NodeStatus {
    /// Status of the committed state of `node`
    pub(crate) fn of(graph: &Graph, node: NodeId) -> Self {
        let state = graph.state(node);
        let message = match state {
            BuildState::Built { output, .. } => output.describe(),
            BuildState::Failed { failure, .. } => failure.message(),
            BuildState::Unbuilt | BuildState::HashKnown(_) => String::new(),
        };
        NodeStatus {
            node,
            name: graph.name(node).to_string(),
            kind: graph.kind(node),
            status: state.label().to_string(),
            message,
            hash: state.hash(),
        }
    }

    pub fn is_built(&self) -> bool {
        self.status == "built"
    }

    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }
}

/// One failed node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub node: NodeId,
    pub name: String,
    /// Node where the error originated (equal to `name` for root causes)
    pub origin: String,
    /// `construction`, `selection` or `expression`
    pub category: String,
    pub message: String,
    /// Failed only because an input failed
    pub derivative: bool,
}

/// Counters of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PassStats {
    /// Nodes reached from the roots
    pub visited: usize,
    /// Nodes already settled for their hash
    pub reused: usize,
    /// Features served by the build cache
    pub cache_hits: usize,
    /// Features this pass actually built
    pub builds: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl PassStats {
    pub(crate) fn merge(&mut self, other: &PassStats) {
        self.visited += other.visited;
        self.reused += other.reused;
        self.cache_hits += other.cache_hits;
        self.builds += other.builds;
        self.failed += other.failed;
    }
}

/// Everything a pass found, in dependency order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub statuses: Vec<NodeStatus>,
    pub failures: Vec<FailureReport>,
    pub stats: PassStats,
}

impl BuildReport {
    /// Collect the committed states of `order`
    pub(crate) fn collect(graph: &Graph, order: &[NodeId], stats: PassStats) -> Self {
        let mut report = BuildReport {
            stats,
            ..Default::default()
        };

        for &node in order {
            if let Some(failure) = graph.state(node).failure() {
                report.failures.push(FailureReport {
                    node,
                    name: graph.name(node).to_string(),
                    origin: failure.origin.clone(),
                    category: failure.error.category().to_string(),
                    message: failure.error.to_string(),
                    derivative: failure.derivative,
                });
            }
            report.statuses.push(NodeStatus::of(graph, node));
        }

        report
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn status(&self, name: &str) -> Option<&NodeStatus> {
        self.statuses.iter().find(|s| s.name == name)
    }

    /// Failures that originated at their own node
    pub fn root_causes(&self) -> impl Iterator<Item = &FailureReport> {
        self.failures.iter().filter(|f| !f.derivative)
    }

    /// Failures inherited from a failed input
    pub fn derivative_failures(&self) -> impl Iterator<Item = &FailureReport> {
        self.failures.iter().filter(|f| f.derivative)
    }
}
