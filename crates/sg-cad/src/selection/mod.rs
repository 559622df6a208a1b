//! Sub-entity selection
//!
//! A [`FeatureSet`] is an ordered set of vertex/edge/face/solid indices of one
//! built shape. Indices are only meaningful for the exact build they were
//! taken from, so a set is tied to its shape handle and checked against it
//! wherever it is consumed.
//!
//! Filters are evaluated over the whole candidate list at once: each filter
//! yields a keep/drop mask, and rank windows rank against every candidate,
//! not only the ones a sibling filter kept.

mod quantity;

pub use quantity::{Quantity, QuantityComputer, QueryContext, VectorQuantity};

use serde::{Deserialize, Serialize};

use crate::error::{SelectionError, SelectionResult};
use crate::graph::{FeatureId, NodeContent, NodeId, Resolver, SelectionId};
use crate::hash::HashBuilder;
use crate::kernel::{CadKernel, EntityKind, Shape};

/// Indices of sub-entities of one build of a shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub shape: Shape,
    pub kind: EntityKind,
    pub indices: Vec<u32>,
}

impl FeatureSet {
    pub fn new(shape: Shape, kind: EntityKind, indices: Vec<u32>) -> Self {
        Self {
            shape,
            kind,
            indices,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Fails unless the set was taken from `shape` and holds `kind` entities
    pub fn check_against(&self, shape: &Shape, kind: EntityKind) -> SelectionResult<()> {
        if self.kind != kind {
            return Err(SelectionError::KindMismatch {
                expected: kind,
                found: self.kind,
            });
        }
        if &self.shape != shape {
            return Err(SelectionError::StaleSet);
        }
        Ok(())
    }
}

/// Sort direction of a rank window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RankOrder {
    /// Rank 0 is the largest quantity
    Descending,
    /// Rank 0 is the smallest quantity
    Ascending,
}

/// Relation between two quantities
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Comparison {
    Equal,
    Approx { tolerance: f64 },
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Comparison {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Equal => lhs == rhs,
            Comparison::Approx { tolerance } => (lhs - rhs).abs() <= tolerance,
            Comparison::Less => lhs < rhs,
            Comparison::LessEqual => lhs <= rhs,
            Comparison::Greater => lhs > rhs,
            Comparison::GreaterEqual => lhs >= rhs,
        }
    }

    fn hash_into(self, h: &mut HashBuilder) {
        match self {
            Comparison::Equal => h.write_str("=="),
            Comparison::Approx { tolerance } => h.write_str("~").write_f64(tolerance),
            Comparison::Less => h.write_str("<"),
            Comparison::LessEqual => h.write_str("<="),
            Comparison::Greater => h.write_str(">"),
            Comparison::GreaterEqual => h.write_str(">="),
        };
    }
}

/// Keep the entities whose rank falls in the inclusive window `[lo, hi]`
///
/// Ranks come from a stable sort, so equal quantities keep their enumeration
/// order and receive distinct consecutive ranks. NaN ranks last.
pub fn rank_window(quantities: &[f64], order: RankOrder, lo: usize, hi: usize) -> Vec<bool> {
    let key = |q: f64| {
        if q.is_nan() {
            match order {
                RankOrder::Descending => f64::NEG_INFINITY,
                RankOrder::Ascending => f64::INFINITY,
            }
        } else {
            // folds -0.0 into 0.0
            q + 0.0
        }
    };

    let mut ranked: Vec<usize> = (0..quantities.len()).collect();
    ranked.sort_by(|&a, &b| {
        let (ka, kb) = (key(quantities[a]), key(quantities[b]));
        match order {
            RankOrder::Descending => kb.total_cmp(&ka),
            RankOrder::Ascending => ka.total_cmp(&kb),
        }
    });

    let mut keep = vec![false; quantities.len()];
    for (rank, &i) in ranked.iter().enumerate() {
        if (lo..=hi).contains(&rank) {
            keep[i] = true;
        }
    }
    keep
}

/// Composable predicate over candidate sub-entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Filter {
    Everything,
    /// Index membership
    In(Vec<u32>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Compare {
        lhs: Quantity,
        op: Comparison,
        rhs: Quantity,
    },
    Rank {
        quantity: Quantity,
        order: RankOrder,
        lo: usize,
        hi: usize,
    },
}

impl Filter {
    /// Entity with the given rank by descending quantity
    pub fn maximal(quantity: Quantity, rank: usize) -> Self {
        Filter::Rank {
            quantity,
            order: RankOrder::Descending,
            lo: rank,
            hi: rank,
        }
    }

    /// Entity with the given rank by ascending quantity
    pub fn minimal(quantity: Quantity, rank: usize) -> Self {
        Filter::Rank {
            quantity,
            order: RankOrder::Ascending,
            lo: rank,
            hi: rank,
        }
    }

    /// Entities ranked `lo..=hi` by descending quantity
    pub fn rank_window(quantity: Quantity, lo: usize, hi: usize) -> Self {
        Filter::Rank {
            quantity,
            order: RankOrder::Descending,
            lo,
            hi,
        }
    }

    pub fn compare(lhs: Quantity, op: Comparison, rhs: Quantity) -> Self {
        Filter::Compare { lhs, op, rhs }
    }

    /// Keep/drop decision for each candidate
    pub fn mask(&self, ctx: &QueryContext<'_>, candidates: &[u32]) -> SelectionResult<Vec<bool>> {
        match self {
            Filter::Everything => Ok(vec![true; candidates.len()]),
            Filter::In(indices) => Ok(candidates.iter().map(|c| indices.contains(c)).collect()),
            Filter::And(filters) => {
                let mut keep = vec![true; candidates.len()];
                for filter in filters {
                    for (k, m) in keep.iter_mut().zip(filter.mask(ctx, candidates)?) {
                        *k &= m;
                    }
                }
                Ok(keep)
            }
            Filter::Or(filters) => {
                let mut keep = vec![false; candidates.len()];
                for filter in filters {
                    for (k, m) in keep.iter_mut().zip(filter.mask(ctx, candidates)?) {
                        *k |= m;
                    }
                }
                Ok(keep)
            }
            Filter::Not(inner) => Ok(inner.mask(ctx, candidates)?.into_iter().map(|m| !m).collect()),
            Filter::Compare { lhs, op, rhs } => candidates
                .iter()
                .map(|&c| -> SelectionResult<bool> {
                    Ok(op.holds(lhs.evaluate(ctx, c)?, rhs.evaluate(ctx, c)?))
                })
                .collect(),
            Filter::Rank {
                quantity,
                order,
                lo,
                hi,
            } => {
                let quantities = candidates
                    .iter()
                    .map(|&c| quantity.evaluate(ctx, c))
                    .collect::<SelectionResult<Vec<_>>>()?;
                Ok(rank_window(&quantities, *order, *lo, *hi))
            }
        }
    }

    /// Candidates that pass, in candidate order
    pub fn apply(&self, ctx: &QueryContext<'_>, candidates: &[u32]) -> SelectionResult<Vec<u32>> {
        let mask = self.mask(ctx, candidates)?;
        Ok(candidates
            .iter()
            .zip(mask)
            .filter_map(|(c, keep)| keep.then_some(*c))
            .collect())
    }

    pub fn collect_inputs(&self, out: &mut Vec<NodeId>) {
        match self {
            Filter::Everything | Filter::In(_) => {}
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().for_each(|f| f.collect_inputs(out));
            }
            Filter::Not(inner) => inner.collect_inputs(out),
            Filter::Compare { lhs, rhs, .. } => {
                lhs.collect_inputs(out);
                rhs.collect_inputs(out);
            }
            Filter::Rank { quantity, .. } => quantity.collect_inputs(out),
        }
    }

    pub fn hash_into(&self, h: &mut HashBuilder) {
        match self {
            Filter::Everything => {
                h.write_str("everything");
            }
            Filter::In(indices) => {
                h.write_str("in").write_u64(indices.len() as u64);
                for i in indices {
                    h.write_u32(*i);
                }
            }
            Filter::And(filters) | Filter::Or(filters) => {
                h.write_str(if matches!(self, Filter::And(_)) { "and" } else { "or" });
                h.write_u64(filters.len() as u64);
                filters.iter().for_each(|f| f.hash_into(h));
            }
            Filter::Not(inner) => {
                h.write_str("not");
                inner.hash_into(h);
            }
            Filter::Compare { lhs, op, rhs } => {
                h.write_str("compare");
                op.hash_into(h);
                lhs.hash_into(h);
                rhs.hash_into(h);
            }
            Filter::Rank {
                quantity,
                order,
                lo,
                hi,
            } => {
                h.write_str("rank")
                    .write_bool(*order == RankOrder::Descending)
                    .write_u64(*lo as u64)
                    .write_u64(*hi as u64);
                quantity.hash_into(h);
            }
        }
    }
}

/// Run a filter over every sub-entity of one kind
pub fn query(
    kernel: &dyn CadKernel,
    shape: &Shape,
    kind: EntityKind,
    filter: &Filter,
    inputs: &dyn Resolver,
) -> SelectionResult<Vec<u32>> {
    let candidates = kernel.sub_entities(shape, kind)?;
    let ctx = QueryContext {
        kernel,
        shape,
        kind,
        inputs,
    };
    filter.apply(&ctx, &candidates)
}

/// Selection node of the construction graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SelectionNode {
    /// Sub-entities of a feature passing a filter
    Query {
        feature: FeatureId,
        kind: EntityKind,
        filter: Filter,
        allow_empty: bool,
    },
    /// Explicit indices, all of which must exist in the current build
    Indices {
        feature: FeatureId,
        kind: EntityKind,
        indices: Vec<u32>,
    },
    /// Sub-shape the feature published under a name
    Named { feature: FeatureId, name: String },
    /// Further filtering of another selection
    Subset {
        base: SelectionId,
        filter: Filter,
        allow_empty: bool,
    },
}

impl SelectionNode {
    pub fn query(feature: FeatureId, kind: EntityKind, filter: Filter) -> Self {
        SelectionNode::Query {
            feature,
            kind,
            filter,
            allow_empty: false,
        }
    }

    pub fn named(feature: FeatureId, name: impl Into<String>) -> Self {
        SelectionNode::Named {
            feature,
            name: name.into(),
        }
    }

    /// Evaluate against the current build of the input feature
    pub fn resolve(
        &self,
        inputs: &dyn Resolver,
        kernel: &dyn CadKernel,
    ) -> SelectionResult<FeatureSet> {
        match self {
            SelectionNode::Query {
                feature,
                kind,
                filter,
                allow_empty,
            } => {
                let entry = inputs.entry(*feature)?;
                let indices = query(kernel, &entry.shape, *kind, filter, inputs)?;
                non_empty(FeatureSet::new(entry.shape.clone(), *kind, indices), *allow_empty)
            }
            SelectionNode::Indices {
                feature,
                kind,
                indices,
            } => {
                let entry = inputs.entry(*feature)?;
                let available = kernel.sub_entities(&entry.shape, *kind)?;
                let mut selected = Vec::with_capacity(indices.len());
                for &index in indices {
                    if !available.contains(&index) {
                        return Err(SelectionError::MissingIndex {
                            kind: *kind,
                            index,
                            available: available.len(),
                        });
                    }
                    if !selected.contains(&index) {
                        selected.push(index);
                    }
                }
                non_empty(FeatureSet::new(entry.shape.clone(), *kind, selected), false)
            }
            SelectionNode::Named { feature, name } => {
                let entry = inputs.entry(*feature)?;
                entry.references.subshapes.get(name).cloned().ok_or_else(|| {
                    SelectionError::UnknownSubshape {
                        feature: inputs.name_of(feature.node()).to_string(),
                        name: name.clone(),
                    }
                })
            }
            SelectionNode::Subset {
                base,
                filter,
                allow_empty,
            } => {
                let base = inputs.set(*base)?;
                let ctx = QueryContext {
                    kernel,
                    shape: &base.shape,
                    kind: base.kind,
                    inputs,
                };
                let indices = filter.apply(&ctx, &base.indices)?;
                non_empty(
                    FeatureSet::new(base.shape.clone(), base.kind, indices),
                    *allow_empty,
                )
            }
        }
    }
}

fn non_empty(set: FeatureSet, allow_empty: bool) -> SelectionResult<FeatureSet> {
    if set.is_empty() && !allow_empty {
        return Err(SelectionError::Empty { kind: set.kind });
    }
    Ok(set)
}

impl NodeContent for SelectionNode {
    fn tag(&self) -> &'static str {
        match self {
            SelectionNode::Query { .. } => "selection/query",
            SelectionNode::Indices { .. } => "selection/indices",
            SelectionNode::Named { .. } => "selection/named",
            SelectionNode::Subset { .. } => "selection/subset",
        }
    }

    fn inputs(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        match self {
            SelectionNode::Query {
                feature, filter, ..
            } => {
                out.push(feature.node());
                filter.collect_inputs(&mut out);
            }
            SelectionNode::Indices { feature, .. } | SelectionNode::Named { feature, .. } => {
                out.push(feature.node());
            }
            SelectionNode::Subset { base, filter, .. } => {
                out.push(base.node());
                filter.collect_inputs(&mut out);
            }
        }
        out
    }

    fn hash_literals(&self, h: &mut HashBuilder) {
        match self {
            SelectionNode::Query {
                kind,
                filter,
                allow_empty,
                ..
            } => {
                h.write_str(kind.tag()).write_bool(*allow_empty);
                filter.hash_into(h);
            }
            SelectionNode::Indices { kind, indices, .. } => {
                h.write_str(kind.tag()).write_u64(indices.len() as u64);
                for i in indices {
                    h.write_u32(*i);
                }
            }
            SelectionNode::Named { name, .. } => {
                h.write_str(name);
            }
            SelectionNode::Subset {
                filter,
                allow_empty,
                ..
            } => {
                h.write_bool(*allow_empty);
                filter.hash_into(h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::kernel::{KernelOp, StubKernel};
    use glam::DVec3;

    fn block(kernel: &StubKernel) -> Shape {
        kernel
            .build(&KernelOp::Box {
                origin: DVec3::ZERO,
                extent: DVec3::new(1.0, 2.0, 3.0),
                centered: false,
            })
            .unwrap()
    }

    #[test]
    fn test_rank_window_ties_keep_enumeration_order() {
        let keep = rank_window(&[5.0, 3.0, 3.0, 1.0, 0.0], RankOrder::Descending, 0, 1);
        assert_eq!(keep, vec![true, true, false, false, false]);

        let keep = rank_window(&[5.0, 3.0, 3.0, 1.0, 0.0], RankOrder::Descending, 2, 2);
        assert_eq!(keep, vec![false, false, true, false, false]);

        let keep = rank_window(&[1.0, f64::NAN, 0.0], RankOrder::Ascending, 0, 1);
        assert_eq!(keep, vec![true, false, true]);
    }

    #[test]
    fn test_rank_window_out_of_range_is_empty() {
        let keep = rank_window(&[1.0, 2.0], RankOrder::Descending, 5, 9);
        assert!(keep.iter().all(|k| !k));
    }

    #[test]
    fn test_query_largest_faces() {
        let kernel = StubKernel::new();
        let shape = block(&kernel);
        let graph = Graph::new();

        // 1 x 2 x 3 block: the two 2 x 3 faces (normal X) are largest
        let faces = query(
            &kernel,
            &shape,
            EntityKind::Face,
            &Filter::rank_window(Quantity::area(), 0, 1),
            &graph,
        )
        .unwrap();
        assert_eq!(faces, vec![0, 1]);

        let top = query(
            &kernel,
            &shape,
            EntityKind::Face,
            &Filter::maximal(Quantity::along(DVec3::Z), 0),
            &graph,
        )
        .unwrap();
        assert_eq!(top, vec![5]);
    }

    #[test]
    fn test_boolean_filters() {
        let kernel = StubKernel::new();
        let shape = block(&kernel);
        let graph = Graph::new();

        // Edges parallel to Z are the ones of length 3
        let long = Filter::compare(
            Quantity::length(),
            Comparison::Approx { tolerance: 1e-9 },
            Quantity::Constant(3.0),
        );
        let edges = query(&kernel, &shape, EntityKind::Edge, &long, &graph).unwrap();
        assert_eq!(edges, vec![8, 9, 10, 11]);

        let short = Filter::Not(Box::new(long.clone()));
        let edges = query(&kernel, &shape, EntityKind::Edge, &short, &graph).unwrap();
        assert_eq!(edges.len(), 8);

        let both = Filter::And(vec![long, Filter::In(vec![0, 9, 11])]);
        let edges = query(&kernel, &shape, EntityKind::Edge, &both, &graph).unwrap();
        assert_eq!(edges, vec![9, 11]);
    }

    #[test]
    fn test_set_checks() {
        let kernel = StubKernel::new();
        let shape = block(&kernel);
        let set = FeatureSet::new(shape.clone(), EntityKind::Edge, vec![0, 1]);
        assert!(set.check_against(&shape, EntityKind::Edge).is_ok());
        assert_eq!(
            set.check_against(&shape, EntityKind::Face),
            Err(SelectionError::KindMismatch {
                expected: EntityKind::Face,
                found: EntityKind::Edge
            })
        );
        let other = Shape::new(uuid::Uuid::new_v4());
        assert_eq!(
            set.check_against(&other, EntityKind::Edge),
            Err(SelectionError::StaleSet)
        );
    }

    /// A 1 x 2 x 3 block built through the evaluator
    fn built_block(kernel: &StubKernel) -> (Graph, FeatureId) {
        use crate::eval::Evaluator;
        use crate::feature::Recipe;
        use crate::param::VectorExpr;

        let mut graph = Graph::new();
        let origin = graph.vector("origin", VectorExpr::literal(0.0, 0.0, 0.0));
        let extent = graph.vector("extent", VectorExpr::literal(1.0, 2.0, 3.0));
        let block = graph.feature("block", Recipe::cube(origin, extent));
        Evaluator::default()
            .evaluate(&mut graph, &[block.node()], kernel)
            .unwrap();
        (graph, block)
    }

    #[test]
    fn test_absent_index_is_an_error() {
        let kernel = StubKernel::new();
        let (graph, block) = built_block(&kernel);
        let node = SelectionNode::Indices {
            feature: block,
            kind: EntityKind::Edge,
            indices: vec![0, 99],
        };
        assert_eq!(
            node.resolve(&graph, &kernel),
            Err(SelectionError::MissingIndex {
                kind: EntityKind::Edge,
                index: 99,
                available: 12,
            })
        );
    }

    #[test]
    fn test_unknown_named_subshape() {
        let kernel = StubKernel::new();
        let (graph, block) = built_block(&kernel);
        assert_eq!(
            SelectionNode::named(block, "rim").resolve(&graph, &kernel),
            Err(SelectionError::UnknownSubshape {
                feature: "block".into(),
                name: "rim".into(),
            })
        );
        let top = SelectionNode::named(block, "top").resolve(&graph, &kernel).unwrap();
        assert_eq!(top.indices, vec![5]);
    }

    #[test]
    fn test_empty_query_needs_allow_empty() {
        let kernel = StubKernel::new();
        let (graph, block) = built_block(&kernel);
        let strict = SelectionNode::query(block, EntityKind::Face, Filter::In(vec![]));
        assert_eq!(
            strict.resolve(&graph, &kernel),
            Err(SelectionError::Empty {
                kind: EntityKind::Face
            })
        );

        let lenient = SelectionNode::Query {
            feature: block,
            kind: EntityKind::Face,
            filter: Filter::In(vec![]),
            allow_empty: true,
        };
        let set = lenient.resolve(&graph, &kernel).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.kind, EntityKind::Face);
    }
}
