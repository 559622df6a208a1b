//! Incremental evaluation
//!
//! A pass walks the dependency closure of the requested roots, inputs first:
//!
//! 1. order the closure, rejecting cycles and undefined nodes before any work;
//! 2. compute every content hash;
//! 3. reuse nodes already settled for their hash, fail dependents of failed
//!    inputs without touching the kernel, and evaluate or build the rest
//!    (features through the shared [`BuildCache`]);
//! 4. commit the new states to the graph.
//!
//! Results live in a pass-local overlay until step 4, so a cancelled pass
//! leaves the graph as it was.

#[cfg(feature = "parallel")]
mod parallel;
mod report;

pub use report::{BuildReport, FailureReport, NodeStatus, PassStats};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::cache::{BuildCache, CacheEntry};
use crate::config::EvaluatorConfig;
use crate::error::{EvalError, EvalResult, NodeError};
use crate::feature::{BuildContext, Recipe};
use crate::graph::{
    BuildState, Graph, NodeBody, NodeContent, NodeFailure, NodeId, NodeOutput, Resolver,
};
use crate::hash::ContentHash;
use crate::kernel::CadKernel;

/// Token for cancelling a pending pass
///
/// Checked between nodes. A kernel call already running is never interrupted;
/// its result is simply thrown away with the rest of the pass.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Make the token reusable for the next pass
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Evaluates graphs against a shared build cache
#[derive(Debug, Clone)]
pub struct Evaluator {
    cache: Arc<BuildCache>,
    config: EvaluatorConfig,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(EvaluatorConfig::default())
    }
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        let cache = BuildCache::new(config.cache_capacity, config.remember_failures);
        Self {
            cache: Arc::new(cache),
            config,
        }
    }

    /// Evaluator sharing an existing cache
    pub fn with_cache(config: EvaluatorConfig, cache: Arc<BuildCache>) -> Self {
        Self { cache, config }
    }

    pub fn cache(&self) -> &Arc<BuildCache> {
        &self.cache
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Evaluate everything reachable from `roots`
    pub fn evaluate(
        &self,
        graph: &mut Graph,
        roots: &[NodeId],
        kernel: &dyn CadKernel,
    ) -> EvalResult<BuildReport> {
        self.evaluate_with(graph, roots, kernel, &CancellationToken::new())
    }

    /// Evaluate with a cancellation token
    pub fn evaluate_with(
        &self,
        graph: &mut Graph,
        roots: &[NodeId],
        kernel: &dyn CadKernel,
        cancel: &CancellationToken,
    ) -> EvalResult<BuildReport> {
        let started = Instant::now();
        let order = graph.dependency_order(roots)?;
        let hashes = graph.content_hashes(&order, self.config.acos_tolerance);

        let mut runner = PassRunner::new(graph, &hashes, &self.cache, kernel, &self.config, cancel);
        runner.run(&order)?;
        let (states, mut stats) = runner.finish();

        commit(graph, &hashes, states);
        stats.duration = started.elapsed();
        log_pass(&stats);
        Ok(BuildReport::collect(graph, &order, stats))
    }
}

fn commit(graph: &mut Graph, hashes: &HashMap<NodeId, ContentHash>, states: HashMap<NodeId, BuildState>) {
    graph.apply_hashes(hashes);
    for (id, state) in states {
        graph.set_state(id, state);
    }
}

fn log_pass(stats: &PassStats) {
    tracing::info!(
        visited = stats.visited,
        reused = stats.reused,
        cache_hits = stats.cache_hits,
        builds = stats.builds,
        failed = stats.failed,
        "Evaluation pass finished in {:?}",
        stats.duration
    );
}

/// Put the failing node's name on construction errors served from elsewhere
fn relabel(error: NodeError, node: &str) -> NodeError {
    match error {
        NodeError::Construction(e) if e.node != node => NodeError::Construction(e.with_node(node)),
        other => other,
    }
}

/// Pass-local state layered over the graph
struct PassRunner<'a> {
    graph: &'a Graph,
    hashes: &'a HashMap<NodeId, ContentHash>,
    cache: &'a BuildCache,
    kernel: &'a dyn CadKernel,
    acos_tolerance: f64,
    cancel: &'a CancellationToken,
    states: HashMap<NodeId, BuildState>,
    /// Feature results of this pass by hash, failures included
    attempts: HashMap<ContentHash, Result<Arc<CacheEntry>, NodeError>>,
    stats: PassStats,
}

impl Resolver for PassRunner<'_> {
    fn output(&self, node: NodeId) -> Option<&NodeOutput> {
        self.states.get(&node).and_then(BuildState::output)
    }

    fn name_of(&self, node: NodeId) -> &str {
        self.graph.name(node)
    }
}

impl<'a> PassRunner<'a> {
    fn new(
        graph: &'a Graph,
        hashes: &'a HashMap<NodeId, ContentHash>,
        cache: &'a BuildCache,
        kernel: &'a dyn CadKernel,
        config: &EvaluatorConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            graph,
            hashes,
            cache,
            kernel,
            acos_tolerance: config.acos_tolerance,
            cancel,
            states: HashMap::new(),
            attempts: HashMap::new(),
            stats: PassStats::default(),
        }
    }

    /// Settle every node of `order` (inputs first)
    fn run(&mut self, order: &[NodeId]) -> EvalResult<()> {
        for &id in order {
            if self.cancel.is_cancelled() {
                tracing::info!("Evaluation pass cancelled");
                return Err(EvalError::Cancelled);
            }
            if let Some(state) = self.step(id) {
                self.states.insert(id, state);
            }
        }
        Ok(())
    }

    fn finish(self) -> (HashMap<NodeId, BuildState>, PassStats) {
        (self.states, self.stats)
    }

    fn step(&mut self, id: NodeId) -> Option<BuildState> {
        let graph = self.graph;
        let hash = *self.hashes.get(&id)?;
        let body = graph.body(id)?;
        let name = graph.name(id);
        self.stats.visited += 1;

        let current = graph.state(id);
        if current.is_settled_for(&hash) {
            self.stats.reused += 1;
            return Some(current.clone());
        }

        let upstream = body
            .inputs()
            .iter()
            .find_map(|input| self.states.get(input).and_then(BuildState::failure))
            .map(NodeFailure::propagated);
        if let Some(failure) = upstream {
            tracing::debug!(node = name, origin = %failure.origin, "Skipped after upstream failure");
            self.stats.failed += 1;
            return Some(BuildState::Failed { hash, failure });
        }

        let result = match body {
            NodeBody::Scalar(expr) => expr
                .evaluate(&*self, self.acos_tolerance)
                .map(NodeOutput::Scalar)
                .map_err(NodeError::from),
            NodeBody::Vector(expr) => expr
                .evaluate(&*self, self.acos_tolerance)
                .map(NodeOutput::Vector)
                .map_err(NodeError::from),
            NodeBody::Selection(selection) => selection
                .resolve(&*self, self.kernel)
                .map(NodeOutput::Set)
                .map_err(NodeError::from),
            NodeBody::Feature(recipe) => self
                .build_feature(name, hash, recipe)
                .map(NodeOutput::Shape),
        };

        Some(match result {
            Ok(output) => BuildState::Built { hash, output },
            Err(error) => {
                let error = relabel(error, name);
                tracing::warn!("Node {} failed: {}", name, error);
                self.stats.failed += 1;
                BuildState::Failed {
                    hash,
                    failure: NodeFailure::new(name, error),
                }
            }
        })
    }

    fn build_feature(
        &mut self,
        name: &str,
        hash: ContentHash,
        recipe: &Recipe,
    ) -> Result<Arc<CacheEntry>, NodeError> {
        if let Some(previous) = self.attempts.get(&hash) {
            self.stats.cache_hits += 1;
            return previous.clone();
        }

        let mut ran = false;
        let result = {
            let ctx = BuildContext {
                kernel: self.kernel,
                inputs: &*self,
                node: name,
            };
            self.cache.get_or_build(hash, || {
                ran = true;
                recipe.build(&ctx)
            })
        };

        let result = result.map(|(entry, _)| entry);
        if ran {
            self.stats.builds += 1;
        } else if result.is_ok() {
            self.stats.cache_hits += 1;
        }
        self.attempts.insert(hash, result.clone());
        result
    }
}
