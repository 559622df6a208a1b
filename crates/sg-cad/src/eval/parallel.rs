//! Parallel evaluation of independent sub-graphs

use std::collections::HashMap;
use std::time::Instant;

use rayon::prelude::*;

use super::{CancellationToken, Evaluator, PassRunner, PassStats, commit, log_pass};
use crate::error::{EvalError, EvalResult};
use crate::eval::BuildReport;
use crate::graph::{Graph, NodeId};
use crate::kernel::CadKernel;

impl Evaluator {
    /// Evaluate independent groups of roots on worker threads
    ///
    /// Roots whose dependency closures share no node form separate components.
    /// Each component runs on a worker holding its own kernel handle from
    /// `kernel_factory`. The build cache is shared, so a hash requested by two
    /// components is still built once. If the token is cancelled, workers stop
    /// at the next node boundary and nothing of the pass is committed.
    pub fn evaluate_parallel<F, K>(
        &self,
        graph: &mut Graph,
        roots: &[NodeId],
        kernel_factory: F,
        cancel: &CancellationToken,
    ) -> EvalResult<BuildReport>
    where
        F: Fn() -> K + Send + Sync,
        K: CadKernel,
    {
        let started = Instant::now();
        let order = graph.dependency_order(roots)?;
        let hashes = graph.content_hashes(&order, self.config.acos_tolerance);
        let components = independent_components(graph, roots)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| EvalError::Workers(e.to_string()))?;
        tracing::debug!(
            components = components.len(),
            workers = pool.current_num_threads(),
            "Parallel evaluation"
        );

        let shared: &Graph = graph;
        let outcomes: Vec<EvalResult<_>> = pool.install(|| {
            components
                .par_iter()
                .map_init(&kernel_factory, |kernel, component| {
                    let mut runner = PassRunner::new(
                        shared,
                        &hashes,
                        &self.cache,
                        &*kernel,
                        &self.config,
                        cancel,
                    );
                    runner.run(component)?;
                    Ok(runner.finish())
                })
                .collect()
        });

        let mut states = HashMap::new();
        let mut stats = PassStats::default();
        for outcome in outcomes {
            let (component_states, component_stats) = outcome?;
            states.extend(component_states);
            stats.merge(&component_stats);
        }

        commit(graph, &hashes, states);
        stats.duration = started.elapsed();
        log_pass(&stats);
        Ok(BuildReport::collect(graph, &order, stats))
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Group roots with overlapping closures; each group in dependency order
pub(crate) fn independent_components(
    graph: &Graph,
    roots: &[NodeId],
) -> EvalResult<Vec<Vec<NodeId>>> {
    let mut parent: Vec<usize> = (0..roots.len()).collect();
    let mut owner: HashMap<NodeId, usize> = HashMap::new();

    for (i, &root) in roots.iter().enumerate() {
        for node in graph.dependency_order(&[root])? {
            match owner.get(&node) {
                Some(&j) => {
                    let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                    if a != b {
                        parent[a] = b;
                    }
                }
                None => {
                    owner.insert(node, i);
                }
            }
        }
    }

    let mut groups: Vec<Vec<NodeId>> = Vec::new();
    let mut slot: HashMap<usize, usize> = HashMap::new();
    for (i, &root) in roots.iter().enumerate() {
        let leader = find(&mut parent, i);
        let index = *slot.entry(leader).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[index].push(root);
    }

    groups
        .iter()
        .map(|group| graph.dependency_order(group))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Recipe;
    use crate::kernel::StubKernel;
    use crate::param::{ScalarExpr, VectorExpr};
    use std::sync::Arc;

    /// Two towers sharing a base, one unrelated ball, one duplicate ball
    fn scene() -> (Graph, Vec<NodeId>) {
        let mut graph = Graph::new();
        let origin = graph.vector("origin", VectorExpr::literal(0.0, 0.0, 0.0));
        let base_extent = graph.vector("base_extent", VectorExpr::literal(4.0, 4.0, 1.0));
        let base = graph.feature("base", Recipe::cube(origin, base_extent));

        let up = graph.vector("up", VectorExpr::literal(0.0, 0.0, 1.0));
        let left = graph.feature("left", Recipe::translate(base, up));
        let right_shift = graph.vector("right_shift", VectorExpr::literal(5.0, 0.0, 0.0));
        let right = graph.feature("right", Recipe::translate(base, right_shift));

        let far = graph.vector("far", VectorExpr::literal(20.0, 0.0, 0.0));
        let radius = graph.scalar("radius", ScalarExpr::Literal(1.0));
        let ball = graph.feature("ball", Recipe::Sphere { center: far, radius });
        let far_again = graph.vector("far_again", VectorExpr::literal(20.0, 0.0, 0.0));
        let radius_again = graph.scalar("radius_again", ScalarExpr::Literal(1.0));
        let twin = graph.feature(
            "twin",
            Recipe::Sphere {
                center: far_again,
                radius: radius_again,
            },
        );

        let roots = vec![left.node(), right.node(), ball.node(), twin.node()];
        (graph, roots)
    }

    #[test]
    fn test_components_split_on_shared_nodes() {
        let (graph, roots) = scene();
        let components = independent_components(&graph, &roots).unwrap();
        assert_eq!(components.len(), 3);
        // left and right share the base
        assert!(components[0].contains(&roots[0]) && components[0].contains(&roots[1]));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (mut sequential, roots) = scene();
        Evaluator::default()
            .evaluate(&mut sequential, &roots, &StubKernel::new())
            .unwrap();

        let (mut parallel, _) = scene();
        let kernel = Arc::new(StubKernel::new());
        let evaluator = Evaluator::new(crate::config::EvaluatorConfig::new().with_workers(3));
        let report = evaluator
            .evaluate_parallel(&mut parallel, &roots, || kernel.clone(), &CancellationToken::new())
            .unwrap();

        assert!(report.is_success());
        for id in sequential.node_ids() {
            assert_eq!(sequential.hash(id), parallel.hash(id));
            assert_eq!(
                sequential.state(id).is_built(),
                parallel.state(id).is_built()
            );
        }
        // The twin spheres share one hash across components
        assert_eq!(kernel.build_calls_for("Sphere"), 1);
        assert_eq!(kernel.build_calls_for("Box"), 1);
    }

    #[test]
    fn test_cancelled_parallel_pass_is_discarded() {
        let (mut graph, roots) = scene();
        let token = CancellationToken::new();
        token.cancel();

        let result = Evaluator::default().evaluate_parallel(
            &mut graph,
            &roots,
            StubKernel::new,
            &token,
        );
        assert!(matches!(result, Err(EvalError::Cancelled)));
        assert!(graph.node_ids().all(|n| !graph.state(n).is_built()));
    }
}
