//! Feature Operations
//!
//! A feature is one construction step of the graph. Its [`Recipe`] names the
//! operation and its typed inputs (parameter, feature and selection handles);
//! optional trailing parameters live in per-operation option structs instead
//! of separate operation variants.

mod build;
mod node;

pub use build::BuildContext;
pub use node::FeatureNode;

use serde::{Deserialize, Serialize};

use crate::graph::{FeatureId, NodeContent, NodeId, ScalarId, SelectionId, VectorId};
use crate::hash::HashBuilder;
use crate::kernel::BooleanType;

/// Options of [`Recipe::Box`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoxOptions {
    /// Place the box center (instead of its minimum corner) at the origin
    pub centered: bool,
}

/// Options of [`Recipe::Cylinder`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CylinderOptions {
    /// Makes a tube
    pub inner_diameter: Option<ScalarId>,
}

/// Options of [`Recipe::Extrude`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtrudeOptions {
    /// Extrude half the direction each way
    pub symmetric: bool,
}

/// Options of [`Recipe::Loft`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoftOptions {
    /// Straight segments between sections
    pub ruled: bool,
    /// Close the ends into a solid
    pub solid: bool,
}

impl Default for LoftOptions {
    fn default() -> Self {
        Self {
            ruled: false,
            solid: true,
        }
    }
}

/// Options of [`Recipe::Transform`]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TransformOptions {
    /// Rotation axis direction; the rotation applies only when an angle is also given
    pub rotation_axis: Option<VectorId>,
    pub rotation_angle: Option<ScalarId>,
    /// Point the rotation axis passes through (world origin if absent)
    pub rotation_origin: Option<VectorId>,
}

/// A construction operation and its inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Recipe {
    /// Axis-aligned box
    Box {
        origin: VectorId,
        extent: VectorId,
        options: BoxOptions,
    },
    /// Cylinder between two axis points
    Cylinder {
        p0: VectorId,
        p1: VectorId,
        diameter: ScalarId,
        options: CylinderOptions,
    },
    Sphere {
        center: VectorId,
        radius: ScalarId,
    },
    /// Wire through a list of points
    Polyline {
        points: Vec<VectorId>,
        closed: bool,
    },
    /// Closed circular wire
    Circle {
        center: VectorId,
        normal: VectorId,
        radius: ScalarId,
    },
    /// Linear extrusion of a wire or face profile
    Extrude {
        profile: FeatureId,
        direction: VectorId,
        options: ExtrudeOptions,
    },
    /// Revolution of a profile about an axis (angle in radians)
    Revolve {
        profile: FeatureId,
        axis_origin: VectorId,
        axis_direction: VectorId,
        angle: ScalarId,
    },
    /// Profile swept along a path wire
    Sweep { profile: FeatureId, path: FeatureId },
    /// Loft through a sequence of closed profiles
    Loft {
        profiles: Vec<FeatureId>,
        options: LoftOptions,
    },
    Boolean {
        op: BooleanType,
        target: FeatureId,
        tool: FeatureId,
    },
    Fillet {
        body: FeatureId,
        edges: SelectionId,
        radius: ScalarId,
    },
    Chamfer {
        body: FeatureId,
        edges: SelectionId,
        distance: ScalarId,
    },
    /// Hollow a solid, opening the selected faces
    Shell {
        body: FeatureId,
        faces_to_remove: SelectionId,
        thickness: ScalarId,
    },
    /// Rigid motion: optional rotation, then translation
    Transform {
        body: FeatureId,
        translation: VectorId,
        options: TransformOptions,
    },
    /// Several shapes grouped without merging
    Compound { parts: Vec<FeatureId> },
}

impl Recipe {
    /// Operation name used in error messages
    pub fn operation(&self) -> &'static str {
        match self {
            Recipe::Box { .. } => "Box",
            Recipe::Cylinder { .. } => "Cylinder",
            Recipe::Sphere { .. } => "Sphere",
            Recipe::Polyline { .. } => "Polyline",
            Recipe::Circle { .. } => "Circle",
            Recipe::Extrude { .. } => "Extrude",
            Recipe::Revolve { .. } => "Revolve",
            Recipe::Sweep { .. } => "Sweep",
            Recipe::Loft { .. } => "Loft",
            Recipe::Boolean { .. } => "Boolean",
            Recipe::Fillet { .. } => "Fillet",
            Recipe::Chamfer { .. } => "Chamfer",
            Recipe::Shell { .. } => "Shell",
            Recipe::Transform { .. } => "Transform",
            Recipe::Compound { .. } => "Compound",
        }
    }

    /// Create a box feature recipe
    pub fn cube(origin: VectorId, extent: VectorId) -> Self {
        Recipe::Box {
            origin,
            extent,
            options: BoxOptions::default(),
        }
    }

    /// Create a cylinder feature recipe
    pub fn cylinder(p0: VectorId, p1: VectorId, diameter: ScalarId) -> Self {
        Recipe::Cylinder {
            p0,
            p1,
            diameter,
            options: CylinderOptions::default(),
        }
    }

    /// Create an extrude feature recipe
    pub fn extrude(profile: FeatureId, direction: VectorId) -> Self {
        Recipe::Extrude {
            profile,
            direction,
            options: ExtrudeOptions::default(),
        }
    }

    /// Create a translation-only transform recipe
    pub fn translate(body: FeatureId, translation: VectorId) -> Self {
        Recipe::Transform {
            body,
            translation,
            options: TransformOptions::default(),
        }
    }

    pub fn union(target: FeatureId, tool: FeatureId) -> Self {
        Recipe::Boolean {
            op: BooleanType::Union,
            target,
            tool,
        }
    }

    pub fn subtract(target: FeatureId, tool: FeatureId) -> Self {
        Recipe::Boolean {
            op: BooleanType::Subtract,
            target,
            tool,
        }
    }
}

impl NodeContent for Recipe {
    fn tag(&self) -> &'static str {
        match self {
            Recipe::Box { .. } => "feature/box",
            Recipe::Cylinder { .. } => "feature/cylinder",
            Recipe::Sphere { .. } => "feature/sphere",
            Recipe::Polyline { .. } => "feature/polyline",
            Recipe::Circle { .. } => "feature/circle",
            Recipe::Extrude { .. } => "feature/extrude",
            Recipe::Revolve { .. } => "feature/revolve",
            Recipe::Sweep { .. } => "feature/sweep",
            Recipe::Loft { .. } => "feature/loft",
            Recipe::Boolean { .. } => "feature/boolean",
            Recipe::Fillet { .. } => "feature/fillet",
            Recipe::Chamfer { .. } => "feature/chamfer",
            Recipe::Shell { .. } => "feature/shell",
            Recipe::Transform { .. } => "feature/transform",
            Recipe::Compound { .. } => "feature/compound",
        }
    }

    fn inputs(&self) -> Vec<NodeId> {
        match self {
            Recipe::Box { origin, extent, .. } => vec![origin.node(), extent.node()],
            Recipe::Cylinder {
                p0,
                p1,
                diameter,
                options,
            } => {
                let mut out = vec![p0.node(), p1.node(), diameter.node()];
                out.extend(options.inner_diameter.map(|d| d.node()));
                out
            }
            Recipe::Sphere { center, radius } => vec![center.node(), radius.node()],
            Recipe::Polyline { points, .. } => points.iter().map(|p| p.node()).collect(),
            Recipe::Circle {
                center,
                normal,
                radius,
            } => vec![center.node(), normal.node(), radius.node()],
            Recipe::Extrude {
                profile, direction, ..
            } => vec![profile.node(), direction.node()],
            Recipe::Revolve {
                profile,
                axis_origin,
                axis_direction,
                angle,
            } => vec![
                profile.node(),
                axis_origin.node(),
                axis_direction.node(),
                angle.node(),
            ],
            Recipe::Sweep { profile, path } => vec![profile.node(), path.node()],
            Recipe::Loft { profiles, .. } => profiles.iter().map(|p| p.node()).collect(),
            Recipe::Boolean { target, tool, .. } => vec![target.node(), tool.node()],
            Recipe::Fillet {
                body,
                edges,
                radius: size,
            }
            | Recipe::Chamfer {
                body,
                edges,
                distance: size,
            } => vec![body.node(), edges.node(), size.node()],
            Recipe::Shell {
                body,
                faces_to_remove,
                thickness,
            } => vec![body.node(), faces_to_remove.node(), thickness.node()],
            Recipe::Transform {
                body,
                translation,
                options,
            } => {
                let mut out = vec![body.node(), translation.node()];
                out.extend(options.rotation_axis.map(|a| a.node()));
                out.extend(options.rotation_angle.map(|a| a.node()));
                out.extend(options.rotation_origin.map(|o| o.node()));
                out
            }
            Recipe::Compound { parts } => parts.iter().map(|p| p.node()).collect(),
        }
    }

    fn hash_literals(&self, h: &mut HashBuilder) {
        match self {
            Recipe::Box { options, .. } => {
                h.write_bool(options.centered);
            }
            Recipe::Cylinder { options, .. } => {
                h.write_bool(options.inner_diameter.is_some());
            }
            Recipe::Polyline { points, closed } => {
                h.write_u64(points.len() as u64).write_bool(*closed);
            }
            Recipe::Extrude { options, .. } => {
                h.write_bool(options.symmetric);
            }
            Recipe::Loft { profiles, options } => {
                h.write_u64(profiles.len() as u64)
                    .write_bool(options.ruled)
                    .write_bool(options.solid);
            }
            Recipe::Boolean { op, .. } => {
                h.write_str(op.tag());
            }
            Recipe::Transform { options, .. } => {
                h.write_bool(options.rotation_axis.is_some())
                    .write_bool(options.rotation_angle.is_some())
                    .write_bool(options.rotation_origin.is_some());
            }
            Recipe::Sphere { .. }
            | Recipe::Circle { .. }
            | Recipe::Revolve { .. }
            | Recipe::Sweep { .. }
            | Recipe::Fillet { .. }
            | Recipe::Chamfer { .. }
            | Recipe::Shell { .. }
            | Recipe::Compound { .. } => {}
        }
    }
}
