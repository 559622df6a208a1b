//! Recipe building
//!
//! Inputs are resolved to plain values, capability checks run against the
//! summaries of the input shapes, and only then is the kernel called. Named
//! references and sub-shapes are extracted from the result.

use std::sync::Arc;

use glam::DVec3;

use super::Recipe;
use crate::cache::{CacheEntry, NamedReferences};
use crate::error::{ConstructionError, ExpressionError, NodeError};
use crate::graph::{FeatureId, Resolver, SelectionId};
use crate::kernel::{Axis3D, CadError, CadKernel, EntityKind, KernelOp, Shape, ShapeSummary};
use crate::param::rotate_about;
use crate::selection::{FeatureSet, Filter, Quantity, query};

/// Everything a recipe needs to build
pub struct BuildContext<'a> {
    pub kernel: &'a dyn CadKernel,
    /// Outputs of the node's inputs
    pub inputs: &'a dyn Resolver,
    /// Script-level name of the node being built
    pub node: &'a str,
}

impl<'a> BuildContext<'a> {
    fn fail(&self, operation: &'static str, cause: impl Into<String>) -> NodeError {
        ConstructionError::new(operation, cause)
            .with_node(self.node)
            .into()
    }

    fn kernel_error(&self, operation: &'static str, error: CadError) -> NodeError {
        ConstructionError::from_kernel(operation, error)
            .with_node(self.node)
            .into()
    }

    /// Call the kernel and take the census of its result
    fn run(&self, op: &KernelOp<'_>) -> Result<(Shape, ShapeSummary), NodeError> {
        tracing::debug!(node = self.node, op = op.tag(), "Kernel build");
        let shape = self
            .kernel
            .build(op)
            .map_err(|e| self.kernel_error(op.tag(), e))?;
        let summary = self
            .kernel
            .summarize(&shape)
            .map_err(|e| self.kernel_error(op.tag(), e))?;
        if summary == ShapeSummary::default() {
            return Err(self.fail(op.tag(), "kernel produced an empty shape"));
        }
        Ok((shape, summary))
    }

    fn entry(&self, id: FeatureId) -> Result<&'a Arc<CacheEntry>, NodeError> {
        Ok(self.inputs.entry(id)?)
    }

    /// Input usable as a sweep/extrude/revolve/loft profile
    fn profile(&self, operation: &'static str, id: FeatureId) -> Result<&'a Arc<CacheEntry>, NodeError> {
        let entry = self.entry(id)?;
        if !(entry.summary.is_single_wire() || entry.summary.is_single_face()) {
            return Err(self.fail(
                operation,
                format!(
                    "profile '{}' is not a single wire or face",
                    self.inputs.name_of(id.node())
                ),
            ));
        }
        Ok(entry)
    }

    /// Input that must contain a solid
    fn body(&self, operation: &'static str, id: FeatureId) -> Result<&'a Arc<CacheEntry>, NodeError> {
        let entry = self.entry(id)?;
        if !entry.summary.has_volume() {
            return Err(self.fail(
                operation,
                format!("'{}' has no volume", self.inputs.name_of(id.node())),
            ));
        }
        Ok(entry)
    }

    /// Selection input, checked against the build it is applied to
    fn set(&self, id: SelectionId, shape: &Shape, kind: EntityKind) -> Result<&'a FeatureSet, NodeError> {
        let set = self.inputs.set(id)?;
        set.check_against(shape, kind)?;
        Ok(set)
    }

    /// Named sub-shape; `None` if nothing matches
    fn subshape(
        &self,
        shape: &Shape,
        kind: EntityKind,
        filter: &Filter,
    ) -> Result<Option<FeatureSet>, NodeError> {
        let indices = query(self.kernel, shape, kind, filter, self.inputs)?;
        Ok((!indices.is_empty()).then(|| FeatureSet::new(shape.clone(), kind, indices)))
    }

    /// Publish `bottom` and `top` (and the remaining `side`) faces along an axis
    fn end_faces(
        &self,
        shape: &Shape,
        axis: DVec3,
        references: &mut NamedReferences,
    ) -> Result<(), NodeError> {
        let bottom = Filter::minimal(Quantity::along(axis), 0);
        let top = Filter::maximal(Quantity::along(axis), 0);
        let side = Filter::Not(Box::new(Filter::Or(vec![bottom.clone(), top.clone()])));
        for (name, filter) in [("bottom", bottom), ("top", top), ("side", side)] {
            if let Some(set) = self.subshape(shape, EntityKind::Face, &filter)? {
                references.subshapes.insert(name.into(), set);
            }
        }
        Ok(())
    }
}

/// Landmarks of a body carried over to a derived shape (sub-shapes are not)
fn inherited(source: &NamedReferences) -> NamedReferences {
    NamedReferences {
        values: source.values.clone(),
        points: source.points.clone(),
        vectors: source.vectors.clone(),
        subshapes: Default::default(),
    }
}

impl Recipe {
    /// Build this recipe with the kernel
    ///
    /// Idempotent for a fixed content hash with a deterministic kernel.
    pub fn build(&self, ctx: &BuildContext<'_>) -> Result<CacheEntry, NodeError> {
        let inputs = ctx.inputs;
        let mut references = NamedReferences::default();

        let (shape, summary) = match self {
            Recipe::Box {
                origin,
                extent,
                options,
            } => {
                let origin = inputs.vector_value(*origin)?;
                let extent = inputs.vector_value(*extent)?;
                let built = ctx.run(&KernelOp::Box {
                    origin,
                    extent,
                    centered: options.centered,
                })?;

                let center = if options.centered {
                    origin
                } else {
                    origin + extent * 0.5
                };
                references.points.insert("origin".into(), origin);
                references.points.insert("center".into(), center);
                references.vectors.insert("extent".into(), extent);
                ctx.end_faces(&built.0, DVec3::Z, &mut references)?;
                built
            }

            Recipe::Cylinder {
                p0,
                p1,
                diameter,
                options,
            } => {
                let p0 = inputs.vector_value(*p0)?;
                let p1 = inputs.vector_value(*p1)?;
                let radius = inputs.scalar_value(*diameter)? * 0.5;
                let inner_radius = match options.inner_diameter {
                    Some(id) => Some(inputs.scalar_value(id)? * 0.5),
                    None => None,
                };
                let built = ctx.run(&KernelOp::Cylinder {
                    p0,
                    p1,
                    radius,
                    inner_radius,
                })?;

                let axis = (p1 - p0).normalize_or_zero();
                references.points.insert("p0".into(), p0);
                references.points.insert("p1".into(), p1);
                references.points.insert("center".into(), (p0 + p1) * 0.5);
                references.vectors.insert("axis".into(), axis);
                references.values.insert("diameter".into(), radius * 2.0);
                references.values.insert("height".into(), p0.distance(p1));
                ctx.end_faces(&built.0, axis, &mut references)?;
                built
            }

            Recipe::Sphere { center, radius } => {
                let center = inputs.vector_value(*center)?;
                let radius = inputs.scalar_value(*radius)?;
                let built = ctx.run(&KernelOp::Sphere { center, radius })?;
                references.points.insert("center".into(), center);
                references.values.insert("radius".into(), radius);
                built
            }

            Recipe::Polyline { points, closed } => {
                let points = points
                    .iter()
                    .map(|p| inputs.vector_value(*p))
                    .collect::<Result<Vec<_>, _>>()?;
                if let (Some(first), Some(last)) = (points.first(), points.last()) {
                    references.points.insert("start".into(), *first);
                    references.points.insert("end".into(), *last);
                }
                ctx.run(&KernelOp::Polyline {
                    points,
                    closed: *closed,
                })?
            }

            Recipe::Circle {
                center,
                normal,
                radius,
            } => {
                let center = inputs.vector_value(*center)?;
                let normal = inputs
                    .vector_value(*normal)?
                    .try_normalize()
                    .ok_or(ExpressionError::ZeroVector)?;
                let radius = inputs.scalar_value(*radius)?;
                let built = ctx.run(&KernelOp::Circle {
                    center,
                    normal,
                    radius,
                })?;
                references.points.insert("center".into(), center);
                references.vectors.insert("normal".into(), normal);
                references.values.insert("radius".into(), radius);
                built
            }

            Recipe::Extrude {
                profile,
                direction,
                options,
            } => {
                let profile = ctx.profile("Extrude", *profile)?;
                let direction = inputs.vector_value(*direction)?;
                let built = ctx.run(&KernelOp::Extrude {
                    profile: &profile.shape,
                    direction,
                    symmetric: options.symmetric,
                })?;

                references.vectors.insert("direction".into(), direction);
                references.values.insert("length".into(), direction.length());
                if built.1.has_volume() {
                    ctx.end_faces(&built.0, direction.normalize_or_zero(), &mut references)?;
                }
                built
            }

            Recipe::Revolve {
                profile,
                axis_origin,
                axis_direction,
                angle,
            } => {
                let profile = ctx.profile("Revolve", *profile)?;
                let origin = inputs.vector_value(*axis_origin)?;
                let direction = inputs
                    .vector_value(*axis_direction)?
                    .try_normalize()
                    .ok_or(ExpressionError::ZeroVector)?;
                let angle = inputs.scalar_value(*angle)?;
                let built = ctx.run(&KernelOp::Revolve {
                    profile: &profile.shape,
                    axis: Axis3D::new(origin, direction),
                    angle,
                })?;
                references.points.insert("axis_origin".into(), origin);
                references.vectors.insert("axis".into(), direction);
                references.values.insert("angle".into(), angle);
                built
            }

            Recipe::Sweep { profile, path } => {
                let profile = ctx.profile("Sweep", *profile)?;
                let path_entry = ctx.entry(*path)?;
                if !path_entry.summary.is_single_wire() {
                    return Err(ctx.fail(
                        "Sweep",
                        format!("path '{}' is not a single wire", inputs.name_of(path.node())),
                    ));
                }
                ctx.run(&KernelOp::Sweep {
                    profile: &profile.shape,
                    path: &path_entry.shape,
                })?
            }

            Recipe::Loft { profiles, options } => {
                if profiles.len() < 2 {
                    return Err(ctx.fail("Loft", "loft needs at least two profiles"));
                }
                let sections = profiles
                    .iter()
                    .map(|p| ctx.profile("Loft", *p))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(open) = sections
                    .iter()
                    .zip(profiles)
                    .find(|(s, _)| s.summary.is_single_open_wire())
                {
                    return Err(ctx.fail(
                        "Loft",
                        format!("profile '{}' is not closed", inputs.name_of(open.1.node())),
                    ));
                }
                ctx.run(&KernelOp::Loft {
                    profiles: sections.iter().map(|s| &s.shape).collect(),
                    ruled: options.ruled,
                    solid: options.solid,
                })?
            }

            Recipe::Boolean { op, target, tool } => {
                let target = ctx.body("Boolean", *target)?;
                let tool = ctx.body("Boolean", *tool)?;
                references = inherited(&target.references);
                ctx.run(&KernelOp::Boolean {
                    target: &target.shape,
                    tool: &tool.shape,
                    op: *op,
                })?
            }

            Recipe::Fillet {
                body,
                edges,
                radius,
            } => {
                let body = ctx.body("Fillet", *body)?;
                let edges = ctx.set(*edges, &body.shape, EntityKind::Edge)?;
                let radius = inputs.scalar_value(*radius)?;
                references = inherited(&body.references);
                ctx.run(&KernelOp::Fillet {
                    body: &body.shape,
                    edges: &edges.indices,
                    radius,
                })?
            }

            Recipe::Chamfer {
                body,
                edges,
                distance,
            } => {
                let body = ctx.body("Chamfer", *body)?;
                let edges = ctx.set(*edges, &body.shape, EntityKind::Edge)?;
                let distance = inputs.scalar_value(*distance)?;
                references = inherited(&body.references);
                ctx.run(&KernelOp::Chamfer {
                    body: &body.shape,
                    edges: &edges.indices,
                    distance,
                })?
            }

            Recipe::Shell {
                body,
                faces_to_remove,
                thickness,
            } => {
                let body = ctx.body("Shell", *body)?;
                let faces = ctx.set(*faces_to_remove, &body.shape, EntityKind::Face)?;
                let thickness = inputs.scalar_value(*thickness)?;
                references = inherited(&body.references);
                ctx.run(&KernelOp::Shell {
                    body: &body.shape,
                    faces_to_remove: &faces.indices,
                    thickness,
                })?
            }

            Recipe::Transform {
                body,
                translation,
                options,
            } => {
                let body = ctx.entry(*body)?;
                let translation = inputs.vector_value(*translation)?;
                let rotation = match (options.rotation_axis, options.rotation_angle) {
                    (Some(axis), Some(angle)) => {
                        let direction = inputs
                            .vector_value(axis)?
                            .try_normalize()
                            .ok_or(ExpressionError::ZeroVector)?;
                        let origin = match options.rotation_origin {
                            Some(o) => inputs.vector_value(o)?,
                            None => DVec3::ZERO,
                        };
                        Some((Axis3D::new(origin, direction), inputs.scalar_value(angle)?))
                    }
                    (None, None) => None,
                    _ => {
                        return Err(ctx.fail("Transform", "rotation needs both an axis and an angle"));
                    }
                };

                let move_point = |p: DVec3| match rotation {
                    Some((axis, angle)) => {
                        axis.origin + rotate_about(p - axis.origin, axis.direction, angle) + translation
                    }
                    None => p + translation,
                };
                let move_vector = |v: DVec3| match rotation {
                    Some((axis, angle)) => rotate_about(v, axis.direction, angle),
                    None => v,
                };
                references.values = body.references.values.clone();
                references.points = body
                    .references
                    .points
                    .iter()
                    .map(|(k, p)| (k.clone(), move_point(*p)))
                    .collect();
                references.vectors = body
                    .references
                    .vectors
                    .iter()
                    .map(|(k, v)| (k.clone(), move_vector(*v)))
                    .collect();

                ctx.run(&KernelOp::Transform {
                    body: &body.shape,
                    translation,
                    rotation,
                })?
            }

            Recipe::Compound { parts } => {
                if parts.is_empty() {
                    return Err(ctx.fail("Compound", "compound needs at least one part"));
                }
                let parts = parts
                    .iter()
                    .map(|p| ctx.entry(*p))
                    .collect::<Result<Vec<_>, _>>()?;
                ctx.run(&KernelOp::Compound {
                    parts: parts.iter().map(|p| &p.shape).collect(),
                })?
            }
        };

        Ok(CacheEntry {
            shape,
            summary,
            references,
        })
    }
}
