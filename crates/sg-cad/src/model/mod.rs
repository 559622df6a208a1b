//! Script Model
//!
//! Holds the graph produced by the latest parse of a script, the nodes it
//! exports to the meshing stage and the evaluator whose cache outlives
//! re-parses. This is the entry point the UI drives.

use std::collections::{BTreeMap, HashMap, HashSet};

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::cache::CacheDirectory;
use crate::config::EvaluatorConfig;
use crate::error::EvalResult;
use crate::eval::{BuildReport, CancellationToken, Evaluator, NodeStatus};
use crate::graph::{FeatureId, Graph, NodeId, NodeOutput, SelectionId};
use crate::hash::ContentHash;
use crate::kernel::{CadKernel, Shape, ShapeSummary};
use crate::selection::FeatureSet;

/// A feature handed to the meshing stage, with its boundary regions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub name: String,
    pub feature: FeatureId,
    /// Region name to selection node
    pub regions: BTreeMap<String, SelectionId>,
}

impl ExportSpec {
    pub fn new(name: impl Into<String>, feature: FeatureId) -> Self {
        Self {
            name: name.into(),
            feature,
            regions: BTreeMap::new(),
        }
    }

    pub fn with_region(mut self, name: impl Into<String>, selection: SelectionId) -> Self {
        self.regions.insert(name.into(), selection);
        self
    }
}

/// Built result of an export
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedShape {
    pub name: String,
    pub shape: Shape,
    pub summary: ShapeSummary,
    /// Only regions whose selection resolved
    pub regions: BTreeMap<String, FeatureSet>,
}

struct RebuildPlan {
    roots: Vec<NodeId>,
    root_hashes: HashMap<String, ContentHash>,
    live: HashSet<ContentHash>,
}

/// The current model of a script
pub struct CadModel {
    graph: Graph,
    exports: Vec<ExportSpec>,
    evaluator: Evaluator,
    cancel: CancellationToken,
    /// Root hashes of the last rebuild, by node name so they survive re-parses
    last_root_hashes: HashMap<String, ContentHash>,
    last_report: Option<BuildReport>,
}

impl Default for CadModel {
    fn default() -> Self {
        Self::new(EvaluatorConfig::default())
    }
}

impl CadModel {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self::with_evaluator(Evaluator::new(config))
    }

    pub fn with_evaluator(evaluator: Evaluator) -> Self {
        Self {
            graph: Graph::new(),
            exports: Vec::new(),
            evaluator,
            cancel: CancellationToken::new(),
            last_root_hashes: HashMap::new(),
            last_report: None,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// In-place edits, picked up by the next rebuild
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Swap in the graph of a fresh parse
    ///
    /// Nothing is rebuilt here. The build cache is kept, so the next rebuild
    /// only runs the kernel for content that actually changed.
    pub fn replace_graph(&mut self, graph: Graph, exports: Vec<ExportSpec>) {
        tracing::debug!(nodes = graph.len(), exports = exports.len(), "Graph replaced");
        self.graph = graph;
        self.exports = exports;
    }

    /// Add an export, replacing one of the same name
    pub fn export(&mut self, spec: ExportSpec) {
        match self.exports.iter_mut().find(|e| e.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.exports.push(spec),
        }
    }

    pub fn exports(&self) -> &[ExportSpec] {
        &self.exports
    }

    /// Token the UI can use to cancel a running rebuild
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Graph roots followed by exported features and their regions
    pub fn roots(&self) -> Vec<NodeId> {
        let mut roots = self.graph.roots().to_vec();
        for spec in &self.exports {
            roots.push(spec.feature.node());
            roots.extend(spec.regions.values().map(|s| s.node()));
        }
        let mut seen = HashSet::new();
        roots.retain(|id| seen.insert(*id));
        roots
    }

    fn plan(&self, changed_roots_only: bool) -> EvalResult<RebuildPlan> {
        let all = self.roots();
        let order = self.graph.dependency_order(&all)?;
        let hashes = self
            .graph
            .content_hashes(&order, self.evaluator.config().acos_tolerance);

        let mut roots = Vec::new();
        let mut root_hashes = HashMap::new();
        for &root in &all {
            let Some(&hash) = hashes.get(&root) else {
                continue;
            };
            let name = self.graph.name(root).to_string();
            let state = self.graph.state(root);
            // Failed roots stay in the pass so the report keeps listing them
            let unchanged = self.last_root_hashes.get(&name) == Some(&hash)
                && state.is_built()
                && state.is_settled_for(&hash);
            if !(changed_roots_only && unchanged) {
                roots.push(root);
            }
            root_hashes.insert(name, hash);
        }

        tracing::info!(
            roots = roots.len(),
            skipped = all.len() - roots.len(),
            "Rebuilding model"
        );
        Ok(RebuildPlan {
            roots,
            root_hashes,
            live: hashes.into_values().collect(),
        })
    }

    fn settle(&mut self, plan: RebuildPlan, result: EvalResult<BuildReport>) -> EvalResult<&BuildReport> {
        self.cancel.reset();
        let report = result?;

        let dropped = self.evaluator.cache().retain_live(&plan.live);
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped cache entries no longer in the model");
        }
        self.last_root_hashes = plan.root_hashes;
        Ok(self.last_report.insert(report))
    }

    /// Rebuild the model
    ///
    /// With `changed_roots_only`, roots whose hash matches the last rebuild and
    /// that are still built are left out of the pass. Failed roots are always
    /// revisited (without kernel calls) so their failures stay in the report.
    pub fn rebuild(
        &mut self,
        kernel: &dyn CadKernel,
        changed_roots_only: bool,
    ) -> EvalResult<&BuildReport> {
        let plan = self.plan(changed_roots_only)?;
        let result = self
            .evaluator
            .evaluate_with(&mut self.graph, &plan.roots, kernel, &self.cancel);
        self.settle(plan, result)
    }

    /// Rebuild with independent parts of the model on worker threads
    #[cfg(feature = "parallel")]
    pub fn rebuild_parallel<F, K>(
        &mut self,
        kernel_factory: F,
        changed_roots_only: bool,
    ) -> EvalResult<&BuildReport>
    where
        F: Fn() -> K + Send + Sync,
        K: CadKernel,
    {
        let plan = self.plan(changed_roots_only)?;
        let result = self.evaluator.evaluate_parallel(
            &mut self.graph,
            &plan.roots,
            kernel_factory,
            &self.cancel,
        );
        self.settle(plan, result)
    }

    pub fn last_report(&self) -> Option<&BuildReport> {
        self.last_report.as_ref()
    }

    /// Current status of a node, whether or not the last pass visited it
    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        self.graph
            .lookup(name)
            .map(|id| NodeStatus::of(&self.graph, id))
    }

    pub fn reference_points(&self, feature: &str) -> Option<&BTreeMap<String, DVec3>> {
        let id = self.graph.feature_named(feature).ok()?;
        self.graph.feature_node(id).named_reference_points()
    }

    pub fn reference_vectors(&self, feature: &str) -> Option<&BTreeMap<String, DVec3>> {
        let id = self.graph.feature_named(feature).ok()?;
        self.graph.feature_node(id).named_reference_vectors()
    }

    /// Built exports, in declaration order
    pub fn exported_shapes(&self) -> Vec<ExportedShape> {
        self.exports
            .iter()
            .filter_map(|spec| {
                let entry = self.graph.feature_node(spec.feature).entry()?;
                let regions = spec
                    .regions
                    .iter()
                    .filter_map(|(name, selection)| {
                        match self.graph.state(selection.node()).output() {
                            Some(NodeOutput::Set(set)) => Some((name.clone(), set.clone())),
                            _ => None,
                        }
                    })
                    .collect();
                Some(ExportedShape {
                    name: spec.name.clone(),
                    shape: entry.shape.clone(),
                    summary: entry.summary,
                    regions,
                })
            })
            .collect()
    }

    fn cache_directory(&self) -> Option<CacheDirectory> {
        self.evaluator
            .config()
            .persist_dir
            .clone()
            .map(CacheDirectory::new)
    }

    /// Write the cache to the configured directory
    ///
    /// Returns the number of entries written, 0 without a persistence directory.
    pub fn persist(&self, kernel: &dyn CadKernel) -> EvalResult<usize> {
        let Some(store) = self.cache_directory() else {
            return Ok(0);
        };
        Ok(store.save(self.evaluator.cache(), kernel)?)
    }

    /// Fill the cache from the configured directory
    pub fn load_persisted(&self, kernel: &dyn CadKernel) -> EvalResult<usize> {
        let Some(store) = self.cache_directory() else {
            return Ok(0);
        };
        Ok(store.load(self.evaluator.cache(), kernel)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalError;
    use crate::feature::Recipe;
    use crate::kernel::{EntityKind, StubKernel};
    use crate::param::{ScalarExpr, VectorExpr};
    use crate::selection::SelectionNode;

    /// What a parser would hand over for a block with an outlet and a ball
    fn parse(width: f64, with_ball: bool) -> (Graph, Vec<ExportSpec>) {
        let mut graph = Graph::new();
        let origin = graph.vector("origin", VectorExpr::literal(0.0, 0.0, 0.0));
        let w = graph.scalar("width", ScalarExpr::Literal(width));
        let one = graph.scalar("one", ScalarExpr::Literal(1.0));
        let extent = graph.vector("extent", VectorExpr::FromScalars { x: w, y: one, z: one });
        let block = graph.feature("block", Recipe::cube(origin, extent));
        let outlet = graph.selection("block_top", SelectionNode::named(block, "top"));
        let mut exports = vec![ExportSpec::new("block", block).with_region("outlet", outlet)];

        if with_ball {
            let center = graph.vector("center", VectorExpr::literal(10.0, 0.0, 0.0));
            let radius = graph.scalar("radius", ScalarExpr::Literal(1.0));
            let ball = graph.feature("ball", Recipe::Sphere { center, radius });
            exports.push(ExportSpec::new("ball", ball));
        }
        (graph, exports)
    }

    fn model(width: f64, with_ball: bool) -> CadModel {
        let mut model = CadModel::default();
        let (graph, exports) = parse(width, with_ball);
        model.replace_graph(graph, exports);
        model
    }

    #[test]
    fn test_rebuild_exports_regions() {
        let mut model = model(2.0, true);
        let kernel = StubKernel::new();
        assert!(model.rebuild(&kernel, false).unwrap().is_success());

        let shapes = model.exported_shapes();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].name, "block");
        assert_eq!(shapes[0].summary.solids, 1);
        let outlet = &shapes[0].regions["outlet"];
        assert_eq!(outlet.kind, EntityKind::Face);
        assert_eq!(outlet.indices, vec![5]);
        assert!(shapes[1].regions.is_empty());

        let status = model.status("block").unwrap();
        assert!(status.is_built());
        assert!(status.message.contains("1 solids"));
        assert_eq!(model.reference_points("block").unwrap()["origin"], DVec3::ZERO);
        assert_eq!(
            model.reference_vectors("block").unwrap()["extent"],
            DVec3::new(2.0, 1.0, 1.0)
        );
        assert!(model.status("missing").is_none());
    }

    #[test]
    fn test_reparse_is_served_from_cache() {
        let mut model = model(2.0, true);
        let kernel = StubKernel::new();
        model.rebuild(&kernel, false).unwrap();
        kernel.reset_calls();

        let (graph, exports) = parse(2.0, true);
        model.replace_graph(graph, exports);
        assert!(!model.status("block").unwrap().is_built());

        let report = model.rebuild(&kernel, true).unwrap();
        assert!(report.is_success());
        assert_eq!(kernel.build_calls(), 0);
        assert_eq!(model.exported_shapes().len(), 2);
    }

    #[test]
    fn test_changed_roots_only_skips_unchanged() {
        let mut model = model(2.0, true);
        let kernel = StubKernel::new();
        model.rebuild(&kernel, true).unwrap();
        kernel.reset_calls();

        let width = model.graph().scalar_named("width").unwrap();
        model.graph_mut().set_literal(width, 3.0);
        let report = model.rebuild(&kernel, true).unwrap();

        assert_eq!(kernel.call_log(), vec!["Box"]);
        assert!(report.status("block").is_some());
        assert!(report.status("ball").is_none());
        assert!(model.status("ball").unwrap().is_built());
        assert_eq!(
            model.reference_vectors("block").unwrap()["extent"],
            DVec3::new(3.0, 1.0, 1.0)
        );
    }

    #[test]
    fn test_changed_roots_only_keeps_standing_failures() {
        let mut model = model(2.0, true);
        let kernel = StubKernel::new().with_failure("Sphere");
        assert!(!model.rebuild(&kernel, true).unwrap().is_success());
        kernel.reset_calls();

        let width = model.graph().scalar_named("width").unwrap();
        model.graph_mut().set_literal(width, 3.0);
        let report = model.rebuild(&kernel, true).unwrap();

        assert!(!report.is_success());
        assert_eq!(
            report.root_causes().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["ball"]
        );
        assert!(report.status("ball").unwrap().is_failed());
        assert_eq!(kernel.call_log(), vec!["Box"]);
    }

    #[test]
    fn test_dropped_features_leave_the_cache() {
        let mut model = model(2.0, true);
        let kernel = StubKernel::new();
        model.rebuild(&kernel, false).unwrap();
        assert_eq!(model.evaluator().cache().len(), 2);

        let (graph, exports) = parse(2.0, false);
        model.replace_graph(graph, exports);
        model.rebuild(&kernel, false).unwrap();
        assert_eq!(model.evaluator().cache().len(), 1);
    }

    #[test]
    fn test_cancelled_rebuild_keeps_previous_report() {
        let mut model = model(2.0, false);
        let kernel = StubKernel::new();
        model.rebuild(&kernel, false).unwrap();

        let width = model.graph().scalar_named("width").unwrap();
        model.graph_mut().set_literal(width, 4.0);
        model.cancellation_token().cancel();
        assert!(matches!(
            model.rebuild(&kernel, false),
            Err(EvalError::Cancelled)
        ));
        assert!(model.last_report().unwrap().is_success());
        assert!(!model.status("block").unwrap().is_built());

        // The token is ready for the next pass
        assert!(model.rebuild(&kernel, false).is_ok());
        assert!(model.status("block").unwrap().is_built());
    }

    #[test]
    fn test_persisted_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = EvaluatorConfig::new().with_persist_dir(dir.path());

        let kernel = StubKernel::new();
        let mut first = CadModel::new(config.clone());
        let (graph, exports) = parse(2.0, true);
        first.replace_graph(graph, exports);
        first.rebuild(&kernel, false).unwrap();
        assert_eq!(first.persist(&kernel).unwrap(), 2);

        let fresh_kernel = StubKernel::new();
        let mut second = CadModel::new(config);
        assert_eq!(second.load_persisted(&fresh_kernel).unwrap(), 2);
        let (graph, exports) = parse(2.0, true);
        second.replace_graph(graph, exports);
        assert!(second.rebuild(&fresh_kernel, false).unwrap().is_success());
        assert_eq!(fresh_kernel.build_calls(), 0);
        assert_eq!(second.exported_shapes()[0].regions["outlet"].indices, vec![5]);
    }

    #[test]
    fn test_no_persist_dir_is_a_no_op() {
        let model = model(2.0, false);
        assert_eq!(model.persist(&StubKernel::new()).unwrap(), 0);
        assert_eq!(model.load_persisted(&StubKernel::new()).unwrap(), 0);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_rebuild() {
        let mut model = model(2.0, true);
        let kernel = std::sync::Arc::new(StubKernel::new());
        let report = model.rebuild_parallel(|| kernel.clone(), false).unwrap();
        assert!(report.is_success());
        assert_eq!(kernel.build_calls(), 2);
        assert_eq!(model.exported_shapes().len(), 2);
    }
}
