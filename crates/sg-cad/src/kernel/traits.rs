//! CAD Kernel trait definitions
//!
//! These traits define the interface that every geometry backend must implement.
//! The evaluator never touches geometry directly: it hands a fully resolved
//! [`KernelOp`] to the kernel and gets back an opaque [`Shape`] handle.

use glam::DVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Kind of sub-entity that can be enumerated on a built shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Vertex,
    Edge,
    Face,
    Solid,
}

impl EntityKind {
    /// Stable tag used in content hashes and messages
    pub fn tag(&self) -> &'static str {
        match self {
            EntityKind::Vertex => "vertex",
            EntityKind::Edge => "edge",
            EntityKind::Face => "face",
            EntityKind::Solid => "solid",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Scalar quantity the kernel can measure on a sub-entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantityKind {
    /// Edge length
    Length,
    /// Face area
    Area,
    /// Solid volume
    Volume,
    /// Centroid coordinates (vertex location for vertices)
    CentroidX,
    CentroidY,
    CentroidZ,
    /// Outward normal components (faces only)
    NormalX,
    NormalY,
    NormalZ,
}

impl QuantityKind {
    /// Stable tag used in content hashes
    pub fn tag(&self) -> &'static str {
        match self {
            QuantityKind::Length => "length",
            QuantityKind::Area => "area",
            QuantityKind::Volume => "volume",
            QuantityKind::CentroidX => "centroid.x",
            QuantityKind::CentroidY => "centroid.y",
            QuantityKind::CentroidZ => "centroid.z",
            QuantityKind::NormalX => "normal.x",
            QuantityKind::NormalY => "normal.y",
            QuantityKind::NormalZ => "normal.z",
        }
    }
}

/// Opaque handle to a shape held by a kernel
///
/// The actual topology lives inside the kernel; the handle only carries its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    /// Unique identifier
    pub id: Uuid,
}

impl Shape {
    /// Create a handle for the given kernel-side id
    pub fn new(id: Uuid) -> Self {
        Self { id }
    }
}

/// Topological census of a built shape
///
/// Capability queries (is this a single closed wire? a single volume?) are
/// answered from this summary of what the kernel actually produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeSummary {
    pub vertices: u32,
    pub edges: u32,
    pub wires: u32,
    /// Number of wires that are closed loops
    pub closed_wires: u32,
    pub faces: u32,
    pub shells: u32,
    pub solids: u32,
}

impl ShapeSummary {
    /// Exactly one edge and nothing of higher dimension
    pub fn is_single_edge(&self) -> bool {
        self.edges == 1 && self.faces == 0 && self.solids == 0
    }

    /// Exactly one wire, no faces
    pub fn is_single_wire(&self) -> bool {
        self.wires == 1 && self.faces == 0 && self.solids == 0
    }

    /// Exactly one wire, and it is open
    pub fn is_single_open_wire(&self) -> bool {
        self.is_single_wire() && self.closed_wires == 0
    }

    /// Exactly one wire, and it is closed
    pub fn is_single_closed_wire(&self) -> bool {
        self.is_single_wire() && self.closed_wires == 1
    }

    /// Exactly one face and no solid
    pub fn is_single_face(&self) -> bool {
        self.faces == 1 && self.solids == 0
    }

    /// Exactly one solid
    pub fn is_single_volume(&self) -> bool {
        self.solids == 1
    }

    /// Contains at least one solid
    pub fn has_volume(&self) -> bool {
        self.solids > 0
    }
}

/// Axis definition for revolve and rotation operations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axis3D {
    /// Origin point of the axis
    pub origin: DVec3,
    /// Direction of the axis (normalized)
    pub direction: DVec3,
}

impl Axis3D {
    /// Create an axis from origin and direction
    pub fn new(origin: DVec3, direction: DVec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    /// Z axis at origin
    pub fn z() -> Self {
        Self::new(DVec3::ZERO, DVec3::Z)
    }
}

/// Boolean operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BooleanType {
    /// Union (add)
    Union,
    /// Subtraction (cut)
    Subtract,
    /// Intersection (common)
    Intersect,
}

impl BooleanType {
    /// Stable tag used in content hashes
    pub fn tag(&self) -> &'static str {
        match self {
            BooleanType::Union => "union",
            BooleanType::Subtract => "subtract",
            BooleanType::Intersect => "intersect",
        }
    }
}

/// A fully resolved construction request handed to the kernel
///
/// All parameters are plain values; shape inputs are borrowed handles of
/// previously built results.
#[derive(Debug, Clone)]
pub enum KernelOp<'a> {
    Box {
        origin: DVec3,
        extent: DVec3,
        centered: bool,
    },
    Cylinder {
        p0: DVec3,
        p1: DVec3,
        radius: f64,
        inner_radius: Option<f64>,
    },
    Sphere {
        center: DVec3,
        radius: f64,
    },
    Polyline {
        points: Vec<DVec3>,
        closed: bool,
    },
    Circle {
        center: DVec3,
        normal: DVec3,
        radius: f64,
    },
    Extrude {
        profile: &'a Shape,
        direction: DVec3,
        symmetric: bool,
    },
    Revolve {
        profile: &'a Shape,
        axis: Axis3D,
        angle: f64,
    },
    Sweep {
        profile: &'a Shape,
        path: &'a Shape,
    },
    Loft {
        profiles: Vec<&'a Shape>,
        ruled: bool,
        solid: bool,
    },
    Boolean {
        target: &'a Shape,
        tool: &'a Shape,
        op: BooleanType,
    },
    Fillet {
        body: &'a Shape,
        edges: &'a [u32],
        radius: f64,
    },
    Chamfer {
        body: &'a Shape,
        edges: &'a [u32],
        distance: f64,
    },
    Shell {
        body: &'a Shape,
        faces_to_remove: &'a [u32],
        thickness: f64,
    },
    Transform {
        body: &'a Shape,
        translation: DVec3,
        rotation: Option<(Axis3D, f64)>,
    },
    Compound {
        parts: Vec<&'a Shape>,
    },
}

impl KernelOp<'_> {
    /// Operation tag, stable across runs
    pub fn tag(&self) -> &'static str {
        match self {
            KernelOp::Box { .. } => "Box",
            KernelOp::Cylinder { .. } => "Cylinder",
            KernelOp::Sphere { .. } => "Sphere",
            KernelOp::Polyline { .. } => "Polyline",
            KernelOp::Circle { .. } => "Circle",
            KernelOp::Extrude { .. } => "Extrude",
            KernelOp::Revolve { .. } => "Revolve",
            KernelOp::Sweep { .. } => "Sweep",
            KernelOp::Loft { .. } => "Loft",
            KernelOp::Boolean { .. } => "Boolean",
            KernelOp::Fillet { .. } => "Fillet",
            KernelOp::Chamfer { .. } => "Chamfer",
            KernelOp::Shell { .. } => "Shell",
            KernelOp::Transform { .. } => "Transform",
            KernelOp::Compound { .. } => "Compound",
        }
    }
}

/// Error type for CAD kernel operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CadError {
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Boolean operation failed: {0}")]
    BooleanFailed(String),

    #[error("Degenerate result: {0}")]
    Degenerate(String),

    #[error("Kernel not available: {0}")]
    KernelNotAvailable(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Unknown shape {0}")]
    UnknownShape(Uuid),

    #[error("No {kind} with index {index} on shape")]
    InvalidEntity { kind: EntityKind, index: u32 },

    #[error("Quantity {quantity:?} is not defined for a {kind}")]
    UndefinedQuantity {
        quantity: QuantityKind,
        kind: EntityKind,
    },

    #[error("Unsupported by this kernel: {0}")]
    Unsupported(String),

    #[error("Shape serialization failed: {0}")]
    Serialization(String),
}

/// Result type for CAD operations
pub type CadResult<T> = Result<T, CadError>;

/// The main CAD kernel trait
///
/// Implementations provide the actual geometry operations. Kernel calls are
/// blocking and cannot be interrupted; a kernel that is not thread-safe is
/// given one handle per worker by the parallel evaluator.
pub trait CadKernel {
    /// Get the name of this kernel
    fn name(&self) -> &str;

    /// Check if the kernel is available
    fn is_available(&self) -> bool;

    /// Perform one construction operation
    fn build(&self, op: &KernelOp<'_>) -> CadResult<Shape>;

    /// Topological census of a built shape
    fn summarize(&self, shape: &Shape) -> CadResult<ShapeSummary>;

    /// Indices of all sub-entities of one kind, in kernel enumeration order
    ///
    /// Indices are only stable within a single build of a shape.
    fn sub_entities(&self, shape: &Shape, kind: EntityKind) -> CadResult<Vec<u32>>;

    /// Measure a scalar quantity on one sub-entity
    fn measure(
        &self,
        shape: &Shape,
        quantity: QuantityKind,
        kind: EntityKind,
        index: u32,
    ) -> CadResult<f64>;

    /// Serialize a shape for the persistent cache
    fn export_shape(&self, _shape: &Shape) -> CadResult<Vec<u8>> {
        Err(CadError::Unsupported(format!(
            "{} kernel cannot serialize shapes",
            self.name()
        )))
    }

    /// Restore a shape written by [`CadKernel::export_shape`]
    fn import_shape(&self, _bytes: &[u8]) -> CadResult<Shape> {
        Err(CadError::Unsupported(format!(
            "{} kernel cannot deserialize shapes",
            self.name()
        )))
    }
}

/// Shared kernels can be handed out as independent handles
impl<K: CadKernel + ?Sized> CadKernel for std::sync::Arc<K> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn build(&self, op: &KernelOp<'_>) -> CadResult<Shape> {
        (**self).build(op)
    }

    fn summarize(&self, shape: &Shape) -> CadResult<ShapeSummary> {
        (**self).summarize(shape)
    }

    fn sub_entities(&self, shape: &Shape, kind: EntityKind) -> CadResult<Vec<u32>> {
        (**self).sub_entities(shape, kind)
    }

    fn measure(
        &self,
        shape: &Shape,
        quantity: QuantityKind,
        kind: EntityKind,
        index: u32,
    ) -> CadResult<f64> {
        (**self).measure(shape, quantity, kind, index)
    }

    fn export_shape(&self, shape: &Shape) -> CadResult<Vec<u8>> {
        (**self).export_shape(shape)
    }

    fn import_shape(&self, bytes: &[u8]) -> CadResult<Shape> {
        (**self).import_shape(bytes)
    }
}

/// A null kernel that always returns errors (used when no kernel is available)
#[derive(Debug, Default)]
pub struct NullKernel;

impl CadKernel for NullKernel {
    fn name(&self) -> &str {
        "null"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn build(&self, op: &KernelOp<'_>) -> CadResult<Shape> {
        Err(CadError::KernelNotAvailable(format!(
            "No CAD kernel available for {}",
            op.tag()
        )))
    }

    fn summarize(&self, _shape: &Shape) -> CadResult<ShapeSummary> {
        Err(CadError::KernelNotAvailable(
            "No CAD kernel available".into(),
        ))
    }

    fn sub_entities(&self, _shape: &Shape, _kind: EntityKind) -> CadResult<Vec<u32>> {
        Err(CadError::KernelNotAvailable(
            "No CAD kernel available".into(),
        ))
    }

    fn measure(
        &self,
        _shape: &Shape,
        _quantity: QuantityKind,
        _kind: EntityKind,
        _index: u32,
    ) -> CadResult<f64> {
        Err(CadError::KernelNotAvailable(
            "No CAD kernel available".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_capabilities() {
        let open_wire = ShapeSummary {
            vertices: 3,
            edges: 2,
            wires: 1,
            ..Default::default()
        };
        assert!(open_wire.is_single_open_wire());
        assert!(!open_wire.is_single_closed_wire());
        assert!(!open_wire.is_single_volume());

        let block = ShapeSummary {
            vertices: 8,
            edges: 12,
            wires: 6,
            closed_wires: 6,
            faces: 6,
            shells: 1,
            solids: 1,
        };
        assert!(block.is_single_volume());
        assert!(!block.is_single_wire());
        assert!(!block.is_single_face());
    }

    #[test]
    fn test_null_kernel_rejects() {
        let kernel = NullKernel;
        assert!(!kernel.is_available());
        let op = KernelOp::Sphere {
            center: DVec3::ZERO,
            radius: 1.0,
        };
        assert!(matches!(
            kernel.build(&op),
            Err(CadError::KernelNotAvailable(_))
        ));
    }
}
