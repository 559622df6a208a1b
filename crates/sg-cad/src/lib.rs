//! Parametric Feature Graph Evaluation
//!
//! This crate provides:
//! - An arena graph of parameter, feature and selection nodes
//! - Content hashing of node recipes, independent of node identity
//! - Scalar/vector parameter expressions and mechanism solvers
//! - Feature recipes built through an abstract geometry kernel
//! - Sub-entity selection with filters, quantities and rank windows
//! - A shared build cache with optional eviction and persistence
//! - Incremental evaluation with failure propagation and cancellation
//! - A script-level model driving rebuilds and exports

pub mod cache;
pub mod config;
pub mod error;
pub mod eval;
pub mod feature;
pub mod graph;
pub mod hash;
pub mod kernel;
pub mod model;
pub mod param;
pub mod selection;

// Re-exports for convenience
pub use cache::{BuildCache, CacheDirectory, CacheEntry, CacheStats, Lookup, NamedReferences};
pub use config::{ConfigError, EvaluatorConfig};
pub use error::{
    ConstructionError, CycleError, EvalError, EvalResult, ExprResult, ExpressionError, NodeError,
    SelectionError, SelectionResult,
};
pub use eval::{BuildReport, CancellationToken, Evaluator, FailureReport, NodeStatus, PassStats};
pub use feature::{
    BoxOptions, CylinderOptions, ExtrudeOptions, FeatureNode, LoftOptions, Recipe,
    TransformOptions,
};
pub use graph::{
    BuildState, FeatureId, Graph, NodeFailure, NodeId, NodeKind, NodeOutput, ScalarId,
    SelectionId, VectorId,
};
pub use hash::ContentHash;
pub use kernel::{
    BooleanType, CadError, CadKernel, CadResult, EntityKind, KernelOp, NullKernel, QuantityKind,
    Shape, ShapeSummary, StubKernel, default_kernel,
};
pub use model::{CadModel, ExportSpec, ExportedShape};
pub use param::{BinaryOp, Mechanism, ScalarExpr, UnaryFn, VectorExpr};
pub use selection::{Comparison, FeatureSet, Filter, Quantity, QuantityComputer, SelectionNode};
