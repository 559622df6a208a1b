//! Error types
//!
//! Node-level errors ([`ConstructionError`], [`SelectionError`],
//! [`ExpressionError`]) turn a single node into a failed state and propagate to
//! its dependents. Pass-level errors ([`EvalError`]) abort the whole evaluation.

use thiserror::Error;

use crate::cache::PersistError;
use crate::config::ConfigError;
use crate::graph::NodeKind;
use crate::kernel::{CadError, EntityKind};

/// Malformed or out-of-domain numeric expression
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("Division by zero")]
    DivisionByZero,

    #[error("{function} argument {value} is outside its domain")]
    Domain { function: &'static str, value: f64 },

    #[error("Cannot normalize a zero-length vector")]
    ZeroVector,

    #[error("Mechanism has no solution: {0}")]
    Unsolvable(String),

    #[error("Input '{0}' has no value")]
    Unresolved(String),

    #[error("Feature '{feature}' has no reference named '{name}'")]
    MissingReference { feature: String, name: String },

    #[error("Expression '{0}' produced a non-finite value")]
    NonFinite(&'static str),
}

/// Result type for expression evaluation
pub type ExprResult<T> = Result<T, ExpressionError>;

/// Dangling, empty or mistyped sub-entity reference
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionError {
    #[error("No {kind} with index {index} in the current build ({available} available)")]
    MissingIndex {
        kind: EntityKind,
        index: u32,
        available: usize,
    },

    #[error("Selection of {kind}s is empty")]
    Empty { kind: EntityKind },

    #[error("Feature set refers to a different build of the shape")]
    StaleSet,

    #[error("Feature '{feature}' has no sub-shape named '{name}'")]
    UnknownSubshape { feature: String, name: String },

    #[error("Expected a set of {expected}s, got {found}s")]
    KindMismatch {
        expected: EntityKind,
        found: EntityKind,
    },

    #[error(transparent)]
    Kernel(#[from] CadError),

    #[error(transparent)]
    Parameter(#[from] ExpressionError),
}

/// Result type for selection
pub type SelectionResult<T> = Result<T, SelectionError>;

/// The kernel (or a pre-flight capability check) rejected an operation
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{operation} failed at '{node}': {cause}")]
pub struct ConstructionError {
    /// Script-level name of the node that failed
    pub node: String,
    /// Operation tag
    pub operation: &'static str,
    /// Human-readable cause
    pub cause: String,
}

impl ConstructionError {
    pub fn new(operation: &'static str, cause: impl Into<String>) -> Self {
        Self {
            node: String::new(),
            operation,
            cause: cause.into(),
        }
    }

    /// Attach the originating node name
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    /// Wrap a kernel error
    pub fn from_kernel(operation: &'static str, error: CadError) -> Self {
        Self::new(operation, error.to_string())
    }
}

/// The graph is not acyclic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Dependency cycle: {}", .path.join(" -> "))]
pub struct CycleError {
    /// Node names along the cycle, first name repeated at the end
    pub path: Vec<String>,
}

/// Anything that can put a single node into the failed state
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

impl NodeError {
    /// Short category label for reports
    pub fn category(&self) -> &'static str {
        match self {
            NodeError::Construction(_) => "construction",
            NodeError::Selection(_) => "selection",
            NodeError::Expression(_) => "expression",
        }
    }
}

/// Pass-level failure: nothing of the pass is kept
#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Node '{0}' is declared but never defined")]
    UndefinedNode(String),

    #[error("Node '{name}' is a {found}, expected a {expected}")]
    KindMismatch {
        name: String,
        expected: NodeKind,
        found: NodeKind,
    },

    #[error("Node name '{0}' is declared more than once")]
    DuplicateName(String),

    #[error("No node named '{0}'")]
    UnknownName(String),

    #[error("Evaluation pass cancelled")]
    Cancelled,

    #[error("Worker pool error: {0}")]
    Workers(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Result type for evaluation passes
pub type EvalResult<T> = Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = CycleError {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_construction_error_names_node() {
        let err = ConstructionError::from_kernel(
            "Fillet",
            CadError::Degenerate("radius too large".into()),
        )
        .with_node("rounded");
        assert_eq!(err.node, "rounded");
        assert!(err.to_string().contains("'rounded'"));
        assert!(err.to_string().contains("radius too large"));
    }

    #[test]
    fn test_node_error_category() {
        let err: NodeError = ExpressionError::DivisionByZero.into();
        assert_eq!(err.category(), "expression");
        let err: NodeError = SelectionError::StaleSet.into();
        assert_eq!(err.category(), "selection");
    }
}
