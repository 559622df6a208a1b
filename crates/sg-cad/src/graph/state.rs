//! Per-node build state

use std::sync::Arc;

use glam::DVec3;

use crate::cache::CacheEntry;
use crate::error::NodeError;
use crate::hash::ContentHash;
use crate::selection::FeatureSet;

/// Value produced by a node
#[derive(Debug, Clone)]
pub enum NodeOutput {
    Scalar(f64),
    Vector(DVec3),
    /// Built shape with its named references, shared with the cache
    Shape(Arc<CacheEntry>),
    Set(FeatureSet),
}

impl NodeOutput {
    /// One-line rendering for status messages
    pub fn describe(&self) -> String {
        match self {
            NodeOutput::Scalar(v) => format!("{}", v),
            NodeOutput::Vector(v) => format!("({}, {}, {})", v.x, v.y, v.z),
            NodeOutput::Shape(entry) => {
                let s = &entry.summary;
                format!(
                    "{} solids, {} faces, {} edges",
                    s.solids, s.faces, s.edges
                )
            }
            NodeOutput::Set(set) => format!("{} {}s", set.indices.len(), set.kind),
        }
    }
}

/// Why a node failed
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFailure {
    /// Name of the node where the error originated
    pub origin: String,
    pub error: NodeError,
    /// True if this node failed only because an input failed
    pub derivative: bool,
}

impl NodeFailure {
    pub fn new(origin: impl Into<String>, error: NodeError) -> Self {
        Self {
            origin: origin.into(),
            error,
            derivative: false,
        }
    }

    /// Failure inherited by a dependent
    pub fn propagated(&self) -> Self {
        Self {
            origin: self.origin.clone(),
            error: self.error.clone(),
            derivative: true,
        }
    }

    pub fn message(&self) -> String {
        if self.derivative {
            format!("upstream failure in '{}': {}", self.origin, self.error)
        } else {
            self.error.to_string()
        }
    }
}

/// Lifecycle of one node
///
/// `Unbuilt -> HashKnown -> Built | Failed`. `Built` and `Failed` are terminal
/// for their hash; any edit upstream sends the node back to `Unbuilt`.
#[derive(Debug, Clone, Default)]
pub enum BuildState {
    #[default]
    Unbuilt,
    HashKnown(ContentHash),
    Built {
        hash: ContentHash,
        output: NodeOutput,
    },
    Failed {
        hash: ContentHash,
        failure: NodeFailure,
    },
}

impl BuildState {
    pub fn hash(&self) -> Option<ContentHash> {
        match self {
            BuildState::Unbuilt => None,
            BuildState::HashKnown(hash)
            | BuildState::Built { hash, .. }
            | BuildState::Failed { hash, .. } => Some(*hash),
        }
    }

    pub fn output(&self) -> Option<&NodeOutput> {
        match self {
            BuildState::Built { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&NodeFailure> {
        match self {
            BuildState::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self, BuildState::Built { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BuildState::Failed { .. })
    }

    /// Built or failed for the given hash
    pub fn is_settled_for(&self, hash: &ContentHash) -> bool {
        match self {
            BuildState::Built { hash: h, .. } | BuildState::Failed { hash: h, .. } => h == hash,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BuildState::Unbuilt => "unbuilt",
            BuildState::HashKnown(_) => "pending",
            BuildState::Built { .. } => "built",
            BuildState::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExpressionError;
    use crate::hash::scalar_value_hash;

    #[test]
    fn test_state_transitions_keep_hash() {
        let hash = scalar_value_hash(1.0);
        assert_eq!(BuildState::Unbuilt.hash(), None);
        assert_eq!(BuildState::HashKnown(hash).hash(), Some(hash));

        let built = BuildState::Built {
            hash,
            output: NodeOutput::Scalar(1.0),
        };
        assert!(built.is_settled_for(&hash));
        assert!(!built.is_settled_for(&scalar_value_hash(2.0)));
        assert_eq!(built.label(), "built");
    }

    #[test]
    fn test_propagated_failure_is_derivative() {
        let root = NodeFailure::new("ratio", ExpressionError::DivisionByZero.into());
        let inherited = root.propagated();
        assert!(inherited.derivative);
        assert_eq!(inherited.origin, "ratio");
        assert!(inherited.message().contains("upstream failure in 'ratio'"));
        assert_eq!(root.message(), "Division by zero");
    }
}
