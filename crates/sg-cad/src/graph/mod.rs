//! Construction graph
//!
//! An arena of typed nodes (scalar and vector parameters, features,
//! selections) addressed by [`NodeId`]. Shared sub-expressions are simply
//! referenced by several consumers. Nodes can be declared before they are
//! defined, which is how a name-resolving front end wires forward references;
//! as a consequence a graph *can* contain a cycle, and the evaluator rejects
//! it before doing any work.

mod state;

pub use state::{BuildState, NodeFailure, NodeOutput};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::error::{CycleError, EvalError, EvalResult, ExprResult, ExpressionError};
use crate::feature::{FeatureNode, Recipe};
use crate::hash::{ContentHash, HashBuilder, scalar_value_hash, vector_value_hash};
use crate::param::{ScalarExpr, VectorExpr};
use crate::selection::{FeatureSet, SelectionNode};

/// Index of a node in its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub(crate) NodeId);

        impl $name {
            pub fn node(self) -> NodeId {
                self.0
            }
        }

        impl From<$name> for NodeId {
            fn from(id: $name) -> NodeId {
                id.0
            }
        }
    };
}

typed_id!(
    /// Handle of a scalar parameter node
    ScalarId
);
typed_id!(
    /// Handle of a vector parameter node
    VectorId
);
typed_id!(
    /// Handle of a feature (construction) node
    FeatureId
);
typed_id!(
    /// Handle of a sub-entity selection node
    SelectionId
);

/// Category of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Scalar,
    Vector,
    Feature,
    Selection,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeKind::Scalar => "scalar",
            NodeKind::Vector => "vector",
            NodeKind::Feature => "feature",
            NodeKind::Selection => "selection",
        })
    }
}

/// Hashing contract shared by every node body
///
/// A node's content hash is its tag, its literals and the keys of its inputs,
/// in the order returned by [`NodeContent::inputs`].
pub trait NodeContent {
    /// Stable operation identifier
    fn tag(&self) -> &'static str;

    /// Inputs in a fixed order
    fn inputs(&self) -> Vec<NodeId>;

    /// Mix in the literal constants of this node (not its inputs)
    fn hash_literals(&self, h: &mut HashBuilder);
}

/// Definition of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeBody {
    Scalar(ScalarExpr),
    Vector(VectorExpr),
    Feature(Recipe),
    Selection(SelectionNode),
}

impl NodeBody {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeBody::Scalar(_) => NodeKind::Scalar,
            NodeBody::Vector(_) => NodeKind::Vector,
            NodeBody::Feature(_) => NodeKind::Feature,
            NodeBody::Selection(_) => NodeKind::Selection,
        }
    }

    fn content(&self) -> &dyn NodeContent {
        match self {
            NodeBody::Scalar(e) => e,
            NodeBody::Vector(e) => e,
            NodeBody::Feature(r) => r,
            NodeBody::Selection(s) => s,
        }
    }
}

impl NodeContent for NodeBody {
    fn tag(&self) -> &'static str {
        self.content().tag()
    }

    fn inputs(&self) -> Vec<NodeId> {
        self.content().inputs()
    }

    fn hash_literals(&self, h: &mut HashBuilder) {
        self.content().hash_literals(h)
    }
}

/// Storage slot of one node
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) body: Option<NodeBody>,
    pub(crate) state: BuildState,
}

/// Read access to node outputs during a pass
///
/// Implemented by the graph itself (committed results) and by the pass
/// runner (results of the pass in progress layered over the graph).
pub trait Resolver {
    fn output(&self, node: NodeId) -> Option<&NodeOutput>;

    fn name_of(&self, node: NodeId) -> &str;

    fn scalar_value(&self, id: ScalarId) -> ExprResult<f64> {
        match self.output(id.0) {
            Some(NodeOutput::Scalar(v)) => Ok(*v),
            _ => Err(ExpressionError::Unresolved(self.name_of(id.0).to_string())),
        }
    }

    fn vector_value(&self, id: VectorId) -> ExprResult<DVec3> {
        match self.output(id.0) {
            Some(NodeOutput::Vector(v)) => Ok(*v),
            _ => Err(ExpressionError::Unresolved(self.name_of(id.0).to_string())),
        }
    }

    fn entry(&self, id: FeatureId) -> ExprResult<&Arc<CacheEntry>> {
        match self.output(id.0) {
            Some(NodeOutput::Shape(entry)) => Ok(entry),
            _ => Err(ExpressionError::Unresolved(self.name_of(id.0).to_string())),
        }
    }

    fn set(&self, id: SelectionId) -> ExprResult<&FeatureSet> {
        match self.output(id.0) {
            Some(NodeOutput::Set(set)) => Ok(set),
            _ => Err(ExpressionError::Unresolved(self.name_of(id.0).to_string())),
        }
    }
}

/// Arena of construction nodes
#[derive(Debug, Clone, Default)]
pub struct Graph {
    records: Vec<NodeRecord>,
    names: HashMap<String, NodeId>,
    roots: Vec<NodeId>,
    /// Names declared more than once; the index keeps the first declaration
    duplicates: Vec<String>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn declare(&mut self, name: impl Into<String>, kind: NodeKind) -> NodeId {
        let name = name.into();
        let id = NodeId(self.records.len() as u32);
        if self.names.contains_key(&name) {
            tracing::warn!("Node name '{}' declared twice", name);
            if !self.duplicates.contains(&name) {
                self.duplicates.push(name.clone());
            }
        } else {
            self.names.insert(name.clone(), id);
        }
        self.records.push(NodeRecord {
            name,
            kind,
            body: None,
            state: BuildState::Unbuilt,
        });
        id
    }

    fn define(&mut self, id: NodeId, body: NodeBody) -> usize {
        debug_assert_eq!(self.records[id.index()].kind, body.kind());
        self.records[id.index()].body = Some(body);
        self.invalidate(id)
    }

    /// Declare a scalar to be defined later
    pub fn declare_scalar(&mut self, name: impl Into<String>) -> ScalarId {
        ScalarId(self.declare(name, NodeKind::Scalar))
    }

    /// Define or redefine a scalar, returning how many nodes were invalidated
    pub fn define_scalar(&mut self, id: ScalarId, expr: ScalarExpr) -> usize {
        self.define(id.0, NodeBody::Scalar(expr))
    }

    /// Add a scalar parameter
    pub fn scalar(&mut self, name: impl Into<String>, expr: ScalarExpr) -> ScalarId {
        let id = self.declare_scalar(name);
        self.define_scalar(id, expr);
        id
    }

    /// Replace a scalar with a literal value
    pub fn set_literal(&mut self, id: ScalarId, value: f64) -> usize {
        self.define_scalar(id, ScalarExpr::Literal(value))
    }

    pub fn declare_vector(&mut self, name: impl Into<String>) -> VectorId {
        VectorId(self.declare(name, NodeKind::Vector))
    }

    pub fn define_vector(&mut self, id: VectorId, expr: VectorExpr) -> usize {
        self.define(id.0, NodeBody::Vector(expr))
    }

    /// Add a vector parameter
    pub fn vector(&mut self, name: impl Into<String>, expr: VectorExpr) -> VectorId {
        let id = self.declare_vector(name);
        self.define_vector(id, expr);
        id
    }

    pub fn declare_feature(&mut self, name: impl Into<String>) -> FeatureId {
        FeatureId(self.declare(name, NodeKind::Feature))
    }

    pub fn define_feature(&mut self, id: FeatureId, recipe: Recipe) -> usize {
        self.define(id.0, NodeBody::Feature(recipe))
    }

    /// Add a construction step
    pub fn feature(&mut self, name: impl Into<String>, recipe: Recipe) -> FeatureId {
        let id = self.declare_feature(name);
        self.define_feature(id, recipe);
        id
    }

    pub fn declare_selection(&mut self, name: impl Into<String>) -> SelectionId {
        SelectionId(self.declare(name, NodeKind::Selection))
    }

    pub fn define_selection(&mut self, id: SelectionId, selection: SelectionNode) -> usize {
        self.define(id.0, NodeBody::Selection(selection))
    }

    /// Add a sub-entity selection
    pub fn selection(&mut self, name: impl Into<String>, selection: SelectionNode) -> SelectionId {
        let id = self.declare_selection(name);
        self.define_selection(id, selection);
        id
    }

    /// Mark a node as a root of evaluation
    pub fn add_root(&mut self, id: impl Into<NodeId>) {
        let id = id.into();
        if !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Names declared more than once (any pass over this graph is rejected)
    pub fn duplicate_names(&self) -> &[String] {
        &self.duplicates
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    fn typed(&self, name: &str, expected: NodeKind) -> EvalResult<NodeId> {
        let id = self
            .lookup(name)
            .ok_or_else(|| EvalError::UnknownName(name.to_string()))?;
        let found = self.kind(id);
        if found != expected {
            return Err(EvalError::KindMismatch {
                name: name.to_string(),
                expected,
                found,
            });
        }
        Ok(id)
    }

    pub fn scalar_named(&self, name: &str) -> EvalResult<ScalarId> {
        self.typed(name, NodeKind::Scalar).map(ScalarId)
    }

    pub fn vector_named(&self, name: &str) -> EvalResult<VectorId> {
        self.typed(name, NodeKind::Vector).map(VectorId)
    }

    pub fn feature_named(&self, name: &str) -> EvalResult<FeatureId> {
        self.typed(name, NodeKind::Feature).map(FeatureId)
    }

    pub fn selection_named(&self, name: &str) -> EvalResult<SelectionId> {
        self.typed(name, NodeKind::Selection).map(SelectionId)
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.records[id.index()].name
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.records[id.index()].kind
    }

    pub fn body(&self, id: NodeId) -> Option<&NodeBody> {
        self.records[id.index()].body.as_ref()
    }

    pub fn state(&self, id: NodeId) -> &BuildState {
        &self.records[id.index()].state
    }

    pub fn hash(&self, id: NodeId) -> Option<ContentHash> {
        self.state(id).hash()
    }

    pub(crate) fn set_state(&mut self, id: NodeId, state: BuildState) {
        self.records[id.index()].state = state;
    }

    /// View of a feature node
    pub fn feature_node(&self, id: FeatureId) -> FeatureNode<'_> {
        FeatureNode::new(self, id)
    }

    /// All node ids, in creation order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.records.len() as u32).map(NodeId)
    }

    pub fn inputs(&self, id: NodeId) -> Vec<NodeId> {
        self.body(id).map(|b| b.inputs()).unwrap_or_default()
    }

    fn dependents_table(&self) -> Vec<Vec<NodeId>> {
        let mut table = vec![Vec::new(); self.records.len()];
        for id in self.node_ids() {
            for input in self.inputs(id) {
                table[input.index()].push(id);
            }
        }
        table
    }

    /// Direct consumers of a node
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.node_ids()
            .filter(|n| self.inputs(*n).contains(&id))
            .collect()
    }

    /// Reset a node and everything downstream of it to `Unbuilt`
    pub fn invalidate(&mut self, id: NodeId) -> usize {
        let table = self.dependents_table();
        let mut seen = vec![false; self.records.len()];
        let mut queue = VecDeque::from([id]);
        let mut count = 0;
        while let Some(node) = queue.pop_front() {
            if std::mem::replace(&mut seen[node.index()], true) {
                continue;
            }
            self.records[node.index()].state = BuildState::Unbuilt;
            count += 1;
            queue.extend(table[node.index()].iter().copied());
        }
        count
    }

    /// Every node reachable from `roots`, inputs before consumers
    ///
    /// Fails with a cycle error naming the loop, with an undefined-node error
    /// for a forward declaration that was never defined, or if any node name
    /// is declared twice.
    pub fn dependency_order(&self, roots: &[NodeId]) -> EvalResult<Vec<NodeId>> {
        if let Some(name) = self.duplicates.first() {
            return Err(EvalError::DuplicateName(name.clone()));
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Open,
            Done,
        }

        let mut marks = vec![Mark::New; self.records.len()];
        let mut order = Vec::new();
        let mut stack: Vec<(NodeId, Vec<NodeId>, usize)> = Vec::new();

        // Ids from another graph are as undefined as never-defined declarations
        let mark = |id: NodeId, marks: &Vec<Mark>| -> EvalResult<Mark> {
            marks
                .get(id.index())
                .copied()
                .ok_or_else(|| EvalError::UndefinedNode(format!("#{}", id.index())))
        };
        let open = |id: NodeId, marks: &mut Vec<Mark>| -> EvalResult<(NodeId, Vec<NodeId>, usize)> {
            let body = self
                .body(id)
                .ok_or_else(|| EvalError::UndefinedNode(self.name(id).to_string()))?;
            marks[id.index()] = Mark::Open;
            Ok((id, body.inputs(), 0))
        };

        for &root in roots {
            if mark(root, &marks)? != Mark::New {
                continue;
            }
            stack.push(open(root, &mut marks)?);

            loop {
                let Some(top) = stack.last_mut() else {
                    break;
                };
                let next = top.1.get(top.2).copied();
                top.2 += 1;

                match next {
                    None => {
                        if let Some((node, _, _)) = stack.pop() {
                            marks[node.index()] = Mark::Done;
                            order.push(node);
                        }
                    }
                    Some(input) => match mark(input, &marks)? {
                        Mark::Done => {}
                        Mark::New => stack.push(open(input, &mut marks)?),
                        Mark::Open => {
                            let start = stack
                                .iter()
                                .position(|(n, _, _)| *n == input)
                                .unwrap_or(0);
                            let mut path: Vec<String> = stack[start..]
                                .iter()
                                .map(|(n, _, _)| self.name(*n).to_string())
                                .collect();
                            path.push(self.name(input).to_string());
                            return Err(CycleError { path }.into());
                        }
                    },
                }
            }
        }

        Ok(order)
    }

    /// Content hashes of every node in `order` (inputs first)
    ///
    /// Parameters hash structurally. Features and selections consume pure
    /// parameters (those not depending on any feature) by value, so two
    /// different expressions of the same number give the same feature hash.
    pub fn content_hashes(
        &self,
        order: &[NodeId],
        acos_tolerance: f64,
    ) -> HashMap<NodeId, ContentHash> {
        let mut hashes: HashMap<NodeId, ContentHash> = HashMap::with_capacity(order.len());
        let mut pure = PureValues {
            graph: self,
            values: HashMap::new(),
        };

        for &id in order {
            let Some(body) = self.body(id) else {
                continue;
            };
            let inputs = body.inputs();
            let by_value = matches!(body, NodeBody::Feature(_) | NodeBody::Selection(_));

            let mut h = HashBuilder::new(body.tag());
            body.hash_literals(&mut h);
            h.write_u64(inputs.len() as u64);
            for input in &inputs {
                let value_key = if by_value {
                    pure.values.get(input).and_then(|v| match v {
                        NodeOutput::Scalar(s) => Some(scalar_value_hash(*s)),
                        NodeOutput::Vector(v) => Some(vector_value_hash(*v)),
                        _ => None,
                    })
                } else {
                    None
                };
                match value_key.or_else(|| hashes.get(input).copied()) {
                    Some(key) => h.write_hash(&key),
                    // Not part of the closure; order came from elsewhere
                    None => h.write_str(self.name(*input)),
                };
            }
            hashes.insert(id, h.finish());

            let evaluable = inputs.iter().all(|i| pure.values.contains_key(i));
            if evaluable {
                let value = match body {
                    NodeBody::Scalar(e) => e.evaluate(&pure, acos_tolerance).ok().map(NodeOutput::Scalar),
                    NodeBody::Vector(e) => e.evaluate(&pure, acos_tolerance).ok().map(NodeOutput::Vector),
                    _ => None,
                };
                if let Some(value) = value {
                    pure.values.insert(id, value);
                }
            }
        }

        hashes
    }

    /// Record freshly computed hashes, keeping settled states whose hash matches
    pub(crate) fn apply_hashes(&mut self, hashes: &HashMap<NodeId, ContentHash>) {
        for (id, hash) in hashes {
            let record = &mut self.records[id.index()];
            if !record.state.is_settled_for(hash) {
                record.state = BuildState::HashKnown(*hash);
            }
        }
    }
}

impl Resolver for Graph {
    fn output(&self, node: NodeId) -> Option<&NodeOutput> {
        self.state(node).output()
    }

    fn name_of(&self, node: NodeId) -> &str {
        self.name(node)
    }
}

/// Values of pure parameters, computed while hashing
struct PureValues<'g> {
    graph: &'g Graph,
    values: HashMap<NodeId, NodeOutput>,
}

impl Resolver for PureValues<'_> {
    fn output(&self, node: NodeId) -> Option<&NodeOutput> {
        self.values.get(&node)
    }

    fn name_of(&self, node: NodeId) -> &str {
        self.graph.name(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::BoxOptions;
    use crate::param::BinaryOp;

    fn lit(graph: &mut Graph, name: &str, v: f64) -> ScalarId {
        graph.scalar(name, ScalarExpr::Literal(v))
    }

    #[test]
    fn test_dependency_order_inputs_first() {
        let mut graph = Graph::new();
        let a = lit(&mut graph, "a", 2.0);
        let b = lit(&mut graph, "b", 3.0);
        let c = graph.scalar("c", ScalarExpr::binary(BinaryOp::Add, a, b));

        let order = graph.dependency_order(&[c.node()]).unwrap();
        assert_eq!(order, vec![a.node(), b.node(), c.node()]);
    }

    #[test]
    fn test_shared_input_visited_once() {
        let mut graph = Graph::new();
        let a = lit(&mut graph, "a", 1.0);
        let x = graph.scalar("x", ScalarExpr::binary(BinaryOp::Add, a, a));
        let y = graph.scalar("y", ScalarExpr::binary(BinaryOp::Mul, a, x));

        let order = graph.dependency_order(&[y.node(), x.node()]).unwrap();
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_forward_declared_cycle_rejected() {
        let mut graph = Graph::new();
        let p = graph.declare_scalar("p");
        let q = graph.scalar("q", ScalarExpr::binary(BinaryOp::Add, p, p));
        graph.define_scalar(p, ScalarExpr::binary(BinaryOp::Mul, q, q));

        match graph.dependency_order(&[q.node()]) {
            Err(EvalError::Cycle(cycle)) => {
                assert_eq!(cycle.path, vec!["q", "p", "q"]);
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_undefined_declaration_rejected() {
        let mut graph = Graph::new();
        let p = graph.declare_scalar("later");
        let q = graph.scalar("q", ScalarExpr::Unary {
            function: crate::param::UnaryFn::Neg,
            arg: p,
        });
        assert!(matches!(
            graph.dependency_order(&[q.node()]),
            Err(EvalError::UndefinedNode(name)) if name == "later"
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut graph = Graph::new();
        let first = lit(&mut graph, "width", 1.0);
        let second = lit(&mut graph, "width", 2.0);
        assert_ne!(first, second);

        assert_eq!(graph.lookup("width"), Some(first.node()));
        assert_eq!(graph.duplicate_names(), ["width".to_string()]);
        assert!(matches!(
            graph.dependency_order(&[first.node()]),
            Err(EvalError::DuplicateName(name)) if name == "width"
        ));
    }

    #[test]
    fn test_foreign_id_rejected() {
        let mut big = Graph::new();
        lit(&mut big, "a", 1.0);
        let b = lit(&mut big, "b", 2.0);
        let small = Graph::new();
        assert!(matches!(
            small.dependency_order(&[b.node()]),
            Err(EvalError::UndefinedNode(name)) if name == "#1"
        ));
    }

    #[test]
    fn test_scenario_hashes() {
        let mut graph = Graph::new();
        let a = lit(&mut graph, "a", 2.0);
        let b = lit(&mut graph, "b", 3.0);
        let c = graph.scalar("c", ScalarExpr::binary(BinaryOp::Add, a, b));
        let d = lit(&mut graph, "d", 10.0);
        let roots = [c.node(), d.node()];

        let order = graph.dependency_order(&roots).unwrap();
        let before = graph.content_hashes(&order, 0.0);

        let invalidated = graph.set_literal(a, 4.0);
        assert_eq!(invalidated, 2);

        let order = graph.dependency_order(&roots).unwrap();
        let after = graph.content_hashes(&order, 0.0);
        assert_ne!(before[&a.node()], after[&a.node()]);
        assert_ne!(before[&c.node()], after[&c.node()]);
        assert_eq!(before[&b.node()], after[&b.node()]);
        assert_eq!(before[&d.node()], after[&d.node()]);
    }

    #[test]
    fn test_features_consume_parameters_by_value() {
        let build = |sum: bool| {
            let mut graph = Graph::new();
            let size = if sum {
                let two = lit(&mut graph, "two", 2.0);
                let three = lit(&mut graph, "three", 3.0);
                graph.scalar("size", ScalarExpr::binary(BinaryOp::Add, two, three))
            } else {
                lit(&mut graph, "size", 5.0)
            };
            let origin = graph.vector("origin", VectorExpr::Literal(DVec3::ZERO));
            let extent = graph.vector(
                "extent",
                VectorExpr::FromScalars {
                    x: size,
                    y: size,
                    z: size,
                },
            );
            let cube = graph.feature(
                "cube",
                Recipe::Box {
                    origin,
                    extent,
                    options: BoxOptions::default(),
                },
            );
            let order = graph.dependency_order(&[cube.node()]).unwrap();
            graph.content_hashes(&order, 0.0)[&cube.node()]
        };
        assert_eq!(build(true), build(false));
    }

    #[test]
    fn test_kind_checked_lookup() {
        let mut graph = Graph::new();
        lit(&mut graph, "a", 1.0);
        assert!(graph.scalar_named("a").is_ok());
        assert!(matches!(
            graph.feature_named("a"),
            Err(EvalError::KindMismatch {
                expected: NodeKind::Feature,
                found: NodeKind::Scalar,
                ..
            })
        ));
        assert!(matches!(
            graph.scalar_named("missing"),
            Err(EvalError::UnknownName(_))
        ));
    }
}
