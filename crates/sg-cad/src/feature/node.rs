//! Read-only view of a feature node

use std::collections::BTreeMap;
use std::sync::Arc;

use glam::DVec3;

use super::Recipe;
use crate::cache::CacheEntry;
use crate::graph::{BuildState, FeatureId, Graph, NodeBody, NodeOutput};
use crate::hash::ContentHash;
use crate::kernel::ShapeSummary;
use crate::selection::FeatureSet;

/// A feature node together with its graph
///
/// Named references and capability queries describe what the last build
/// actually produced, so they are empty (or false) until the node is built.
#[derive(Debug, Clone, Copy)]
pub struct FeatureNode<'g> {
    graph: &'g Graph,
    id: FeatureId,
}

impl<'g> FeatureNode<'g> {
    pub fn new(graph: &'g Graph, id: FeatureId) -> Self {
        Self { graph, id }
    }

    pub fn id(&self) -> FeatureId {
        self.id
    }

    pub fn name(&self) -> &'g str {
        self.graph.name(self.id.node())
    }

    /// `None` for a declared but undefined node
    pub fn recipe(&self) -> Option<&'g Recipe> {
        match self.graph.body(self.id.node()) {
            Some(NodeBody::Feature(recipe)) => Some(recipe),
            _ => None,
        }
    }

    /// Content hash from the last evaluation pass
    pub fn hash(&self) -> Option<ContentHash> {
        self.graph.hash(self.id.node())
    }

    pub fn state(&self) -> &'g BuildState {
        self.graph.state(self.id.node())
    }

    /// Built result, if the last pass built it
    pub fn entry(&self) -> Option<&'g Arc<CacheEntry>> {
        match self.state().output() {
            Some(NodeOutput::Shape(entry)) => Some(entry),
            _ => None,
        }
    }

    pub fn summary(&self) -> Option<ShapeSummary> {
        self.entry().map(|e| e.summary)
    }

    pub fn named_reference_points(&self) -> Option<&'g BTreeMap<String, DVec3>> {
        self.entry().map(|e| &e.references.points)
    }

    pub fn named_reference_vectors(&self) -> Option<&'g BTreeMap<String, DVec3>> {
        self.entry().map(|e| &e.references.vectors)
    }

    pub fn named_values(&self) -> Option<&'g BTreeMap<String, f64>> {
        self.entry().map(|e| &e.references.values)
    }

    pub fn named_subshapes(&self) -> Option<&'g BTreeMap<String, FeatureSet>> {
        self.entry().map(|e| &e.references.subshapes)
    }

    fn check(&self, predicate: impl Fn(&ShapeSummary) -> bool) -> bool {
        self.summary().is_some_and(|s| predicate(&s))
    }

    pub fn is_single_edge(&self) -> bool {
        self.check(ShapeSummary::is_single_edge)
    }

    pub fn is_single_wire(&self) -> bool {
        self.check(ShapeSummary::is_single_wire)
    }

    pub fn is_single_open_wire(&self) -> bool {
        self.check(ShapeSummary::is_single_open_wire)
    }

    pub fn is_single_closed_wire(&self) -> bool {
        self.check(ShapeSummary::is_single_closed_wire)
    }

    pub fn is_single_face(&self) -> bool {
        self.check(ShapeSummary::is_single_face)
    }

    pub fn is_single_volume(&self) -> bool {
        self.check(ShapeSummary::is_single_volume)
    }

    pub fn has_volume(&self) -> bool {
        self.check(ShapeSummary::has_volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::scalar_value_hash;
    use crate::kernel::{CadKernel, KernelOp, StubKernel};
    use crate::param::VectorExpr;

    #[test]
    fn test_capabilities_follow_the_build() {
        let mut graph = Graph::new();
        let a = graph.vector("a", VectorExpr::literal(0.0, 0.0, 0.0));
        let b = graph.vector("b", VectorExpr::literal(1.0, 0.0, 0.0));
        let c = graph.vector("c", VectorExpr::literal(1.0, 1.0, 0.0));
        let wire = graph.feature(
            "wire",
            Recipe::Polyline {
                points: vec![a, b, c],
                closed: false,
            },
        );

        let node = graph.feature_node(wire);
        assert_eq!(node.name(), "wire");
        assert!(node.recipe().is_some());
        assert!(!node.is_single_open_wire());
        assert!(node.named_reference_points().is_none());

        let kernel = StubKernel::new();
        let shape = kernel
            .build(&KernelOp::Polyline {
                points: vec![DVec3::ZERO, DVec3::X, DVec3::new(1.0, 1.0, 0.0)],
                closed: false,
            })
            .unwrap();
        let entry = CacheEntry {
            summary: kernel.summarize(&shape).unwrap(),
            shape,
            references: Default::default(),
        };
        graph.set_state(
            wire.node(),
            BuildState::Built {
                hash: scalar_value_hash(0.0),
                output: NodeOutput::Shape(Arc::new(entry)),
            },
        );

        let node = graph.feature_node(wire);
        assert!(node.is_single_open_wire());
        assert!(!node.is_single_closed_wire());
        assert!(!node.is_single_volume());
        assert!(node.named_reference_points().is_some());
    }
}
