//! Parameter expressions
//!
//! Scalar and vector parameters are graph nodes whose value is a pure
//! function of their inputs. All arithmetic is double precision.

mod mechanism;

pub use mechanism::{Mechanism, crank_drive_position, slider_position};

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::{ExprResult, ExpressionError};
use crate::graph::{FeatureId, NodeContent, NodeId, Resolver, ScalarId, VectorId};
use crate::hash::HashBuilder;

/// Arc-cosine that rejects arguments outside `[-1, 1]`
///
/// Arguments that overshoot by no more than `tolerance` (rounding noise from
/// an upstream computation) are clamped.
pub fn checked_acos(x: f64, tolerance: f64) -> ExprResult<f64> {
    clamp_unit("acos", x, tolerance).map(f64::acos)
}

/// Arc-sine with the same domain policy as [`checked_acos`]
pub fn checked_asin(x: f64, tolerance: f64) -> ExprResult<f64> {
    clamp_unit("asin", x, tolerance).map(f64::asin)
}

fn clamp_unit(function: &'static str, x: f64, tolerance: f64) -> ExprResult<f64> {
    if x.abs() <= 1.0 {
        return Ok(x);
    }
    if x.abs() <= 1.0 + tolerance {
        tracing::warn!(function, value = x, "Clamping argument into [-1, 1]");
        return Ok(x.clamp(-1.0, 1.0));
    }
    Err(ExpressionError::Domain { function, value: x })
}

/// Rotate `v` about the unit axis `k` by `angle` radians (Rodrigues)
pub fn rotate_about(v: DVec3, k: DVec3, angle: f64) -> DVec3 {
    let (sin, cos) = angle.sin_cos();
    v * cos + k.cross(v) * sin + k * k.dot(v) * (1.0 - cos)
}

/// Coordinate axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn tag(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }

    fn of(self, v: DVec3) -> f64 {
        match self {
            Axis::X => v.x,
            Axis::Y => v.y,
            Axis::Z => v.z,
        }
    }
}

/// One-argument scalar function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryFn {
    Neg,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sqrt,
    Abs,
    Exp,
    Ln,
    Deg2Rad,
    Rad2Deg,
}

impl UnaryFn {
    pub fn tag(self) -> &'static str {
        match self {
            UnaryFn::Neg => "neg",
            UnaryFn::Sin => "sin",
            UnaryFn::Cos => "cos",
            UnaryFn::Tan => "tan",
            UnaryFn::Asin => "asin",
            UnaryFn::Acos => "acos",
            UnaryFn::Atan => "atan",
            UnaryFn::Sqrt => "sqrt",
            UnaryFn::Abs => "abs",
            UnaryFn::Exp => "exp",
            UnaryFn::Ln => "ln",
            UnaryFn::Deg2Rad => "deg2rad",
            UnaryFn::Rad2Deg => "rad2deg",
        }
    }

    pub fn apply(self, x: f64, tolerance: f64) -> ExprResult<f64> {
        let domain = |function| ExpressionError::Domain { function, value: x };
        Ok(match self {
            UnaryFn::Neg => -x,
            UnaryFn::Sin => x.sin(),
            UnaryFn::Cos => x.cos(),
            UnaryFn::Tan => x.tan(),
            UnaryFn::Asin => checked_asin(x, tolerance)?,
            UnaryFn::Acos => checked_acos(x, tolerance)?,
            UnaryFn::Atan => x.atan(),
            UnaryFn::Sqrt if x < 0.0 => return Err(domain("sqrt")),
            UnaryFn::Sqrt => x.sqrt(),
            UnaryFn::Abs => x.abs(),
            UnaryFn::Exp => x.exp(),
            UnaryFn::Ln if x <= 0.0 => return Err(domain("ln")),
            UnaryFn::Ln => x.ln(),
            UnaryFn::Deg2Rad => x.to_radians(),
            UnaryFn::Rad2Deg => x.to_degrees(),
        })
    }
}

/// Two-argument scalar operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Atan2,
    Min,
    Max,
}

impl BinaryOp {
    pub fn tag(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Atan2 => "atan2",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
        }
    }

    pub fn apply(self, a: f64, b: f64) -> ExprResult<f64> {
        Ok(match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div if b == 0.0 => return Err(ExpressionError::DivisionByZero),
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Atan2 => a.atan2(b),
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
        })
    }
}

/// Scalar parameter node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpr {
    Literal(f64),
    Unary {
        function: UnaryFn,
        arg: ScalarId,
    },
    Binary {
        op: BinaryOp,
        lhs: ScalarId,
        rhs: ScalarId,
    },
    Dot {
        lhs: VectorId,
        rhs: VectorId,
    },
    Magnitude(VectorId),
    Component {
        vector: VectorId,
        axis: Axis,
    },
    /// Angle between two vectors, in radians
    Angle {
        lhs: VectorId,
        rhs: VectorId,
    },
    /// Named scalar published by a built feature
    ReferenceValue {
        feature: FeatureId,
        name: String,
    },
}

impl ScalarExpr {
    pub fn binary(op: BinaryOp, lhs: ScalarId, rhs: ScalarId) -> Self {
        ScalarExpr::Binary { op, lhs, rhs }
    }

    pub fn unary(function: UnaryFn, arg: ScalarId) -> Self {
        ScalarExpr::Unary { function, arg }
    }

    /// Value given the outputs of the inputs
    pub fn evaluate(&self, inputs: &dyn Resolver, acos_tolerance: f64) -> ExprResult<f64> {
        let value = match self {
            ScalarExpr::Literal(v) => *v,
            ScalarExpr::Unary { function, arg } => {
                function.apply(inputs.scalar_value(*arg)?, acos_tolerance)?
            }
            ScalarExpr::Binary { op, lhs, rhs } => {
                op.apply(inputs.scalar_value(*lhs)?, inputs.scalar_value(*rhs)?)?
            }
            ScalarExpr::Dot { lhs, rhs } => inputs.vector_value(*lhs)?.dot(inputs.vector_value(*rhs)?),
            ScalarExpr::Magnitude(v) => inputs.vector_value(*v)?.length(),
            ScalarExpr::Component { vector, axis } => axis.of(inputs.vector_value(*vector)?),
            ScalarExpr::Angle { lhs, rhs } => {
                let a = inputs.vector_value(*lhs)?.try_normalize();
                let b = inputs.vector_value(*rhs)?.try_normalize();
                match (a, b) {
                    (Some(a), Some(b)) => a.dot(b).clamp(-1.0, 1.0).acos(),
                    _ => return Err(ExpressionError::ZeroVector),
                }
            }
            ScalarExpr::ReferenceValue { feature, name } => {
                let entry = inputs.entry(*feature)?;
                *entry.references.values.get(name).ok_or_else(|| {
                    ExpressionError::MissingReference {
                        feature: inputs.name_of(feature.node()).to_string(),
                        name: name.clone(),
                    }
                })?
            }
        };
        if !value.is_finite() {
            return Err(ExpressionError::NonFinite(self.tag()));
        }
        Ok(value)
    }
}

impl NodeContent for ScalarExpr {
    fn tag(&self) -> &'static str {
        match self {
            ScalarExpr::Literal(_) => "scalar/literal",
            ScalarExpr::Unary { .. } => "scalar/unary",
            ScalarExpr::Binary { .. } => "scalar/binary",
            ScalarExpr::Dot { .. } => "scalar/dot",
            ScalarExpr::Magnitude(_) => "scalar/magnitude",
            ScalarExpr::Component { .. } => "scalar/component",
            ScalarExpr::Angle { .. } => "scalar/angle",
            ScalarExpr::ReferenceValue { .. } => "scalar/reference",
        }
    }

    fn inputs(&self) -> Vec<NodeId> {
        match self {
            ScalarExpr::Literal(_) => Vec::new(),
            ScalarExpr::Unary { arg, .. } => vec![arg.node()],
            ScalarExpr::Binary { lhs, rhs, .. } => vec![lhs.node(), rhs.node()],
            ScalarExpr::Dot { lhs, rhs } | ScalarExpr::Angle { lhs, rhs } => {
                vec![lhs.node(), rhs.node()]
            }
            ScalarExpr::Magnitude(v) => vec![v.node()],
            ScalarExpr::Component { vector, .. } => vec![vector.node()],
            ScalarExpr::ReferenceValue { feature, .. } => vec![feature.node()],
        }
    }

    fn hash_literals(&self, h: &mut HashBuilder) {
        match self {
            ScalarExpr::Literal(v) => {
                h.write_f64(*v);
            }
            ScalarExpr::Unary { function, .. } => {
                h.write_str(function.tag());
            }
            ScalarExpr::Binary { op, .. } => {
                h.write_str(op.tag());
            }
            ScalarExpr::Component { axis, .. } => {
                h.write_str(axis.tag());
            }
            ScalarExpr::ReferenceValue { name, .. } => {
                h.write_str(name);
            }
            ScalarExpr::Dot { .. } | ScalarExpr::Magnitude(_) | ScalarExpr::Angle { .. } => {}
        }
    }
}

/// Vector parameter node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VectorExpr {
    Literal(DVec3),
    FromScalars {
        x: ScalarId,
        y: ScalarId,
        z: ScalarId,
    },
    Add {
        lhs: VectorId,
        rhs: VectorId,
    },
    Sub {
        lhs: VectorId,
        rhs: VectorId,
    },
    Scale {
        vector: VectorId,
        factor: ScalarId,
    },
    Neg(VectorId),
    Cross {
        lhs: VectorId,
        rhs: VectorId,
    },
    Normalize(VectorId),
    /// Rotation about an axis through the origin
    Rotate {
        vector: VectorId,
        axis: VectorId,
        angle: ScalarId,
    },
    /// Named point published by a built feature
    ReferencePoint {
        feature: FeatureId,
        name: String,
    },
    /// Named direction published by a built feature
    ReferenceVector {
        feature: FeatureId,
        name: String,
    },
    Mechanism(Mechanism),
}

impl VectorExpr {
    pub fn literal(x: f64, y: f64, z: f64) -> Self {
        VectorExpr::Literal(DVec3::new(x, y, z))
    }

    /// Value given the outputs of the inputs
    pub fn evaluate(&self, inputs: &dyn Resolver, acos_tolerance: f64) -> ExprResult<DVec3> {
        let value = match self {
            VectorExpr::Literal(v) => *v,
            VectorExpr::FromScalars { x, y, z } => DVec3::new(
                inputs.scalar_value(*x)?,
                inputs.scalar_value(*y)?,
                inputs.scalar_value(*z)?,
            ),
            VectorExpr::Add { lhs, rhs } => inputs.vector_value(*lhs)? + inputs.vector_value(*rhs)?,
            VectorExpr::Sub { lhs, rhs } => inputs.vector_value(*lhs)? - inputs.vector_value(*rhs)?,
            VectorExpr::Scale { vector, factor } => {
                inputs.vector_value(*vector)? * inputs.scalar_value(*factor)?
            }
            VectorExpr::Neg(v) => -inputs.vector_value(*v)?,
            VectorExpr::Cross { lhs, rhs } => inputs.vector_value(*lhs)?.cross(inputs.vector_value(*rhs)?),
            VectorExpr::Normalize(v) => inputs
                .vector_value(*v)?
                .try_normalize()
                .ok_or(ExpressionError::ZeroVector)?,
            VectorExpr::Rotate {
                vector,
                axis,
                angle,
            } => {
                let k = inputs
                    .vector_value(*axis)?
                    .try_normalize()
                    .ok_or(ExpressionError::ZeroVector)?;
                rotate_about(inputs.vector_value(*vector)?, k, inputs.scalar_value(*angle)?)
            }
            VectorExpr::ReferencePoint { feature, name } => {
                let entry = inputs.entry(*feature)?;
                *entry.references.points.get(name).ok_or_else(|| {
                    ExpressionError::MissingReference {
                        feature: inputs.name_of(feature.node()).to_string(),
                        name: name.clone(),
                    }
                })?
            }
            VectorExpr::ReferenceVector { feature, name } => {
                let entry = inputs.entry(*feature)?;
                *entry.references.vectors.get(name).ok_or_else(|| {
                    ExpressionError::MissingReference {
                        feature: inputs.name_of(feature.node()).to_string(),
                        name: name.clone(),
                    }
                })?
            }
            VectorExpr::Mechanism(m) => m.evaluate(inputs, acos_tolerance)?,
        };
        if !value.is_finite() {
            return Err(ExpressionError::NonFinite(self.tag()));
        }
        Ok(value)
    }
}

impl NodeContent for VectorExpr {
    fn tag(&self) -> &'static str {
        match self {
            VectorExpr::Literal(_) => "vector/literal",
            VectorExpr::FromScalars { .. } => "vector/from-scalars",
            VectorExpr::Add { .. } => "vector/add",
            VectorExpr::Sub { .. } => "vector/sub",
            VectorExpr::Scale { .. } => "vector/scale",
            VectorExpr::Neg(_) => "vector/neg",
            VectorExpr::Cross { .. } => "vector/cross",
            VectorExpr::Normalize(_) => "vector/normalize",
            VectorExpr::Rotate { .. } => "vector/rotate",
            VectorExpr::ReferencePoint { .. } => "vector/reference-point",
            VectorExpr::ReferenceVector { .. } => "vector/reference-vector",
            VectorExpr::Mechanism(m) => m.tag(),
        }
    }

    fn inputs(&self) -> Vec<NodeId> {
        match self {
            VectorExpr::Literal(_) => Vec::new(),
            VectorExpr::FromScalars { x, y, z } => vec![x.node(), y.node(), z.node()],
            VectorExpr::Add { lhs, rhs }
            | VectorExpr::Sub { lhs, rhs }
            | VectorExpr::Cross { lhs, rhs } => vec![lhs.node(), rhs.node()],
            VectorExpr::Scale { vector, factor } => vec![vector.node(), factor.node()],
            VectorExpr::Neg(v) | VectorExpr::Normalize(v) => vec![v.node()],
            VectorExpr::Rotate {
                vector,
                axis,
                angle,
            } => vec![vector.node(), axis.node(), angle.node()],
            VectorExpr::ReferencePoint { feature, .. }
            | VectorExpr::ReferenceVector { feature, .. } => vec![feature.node()],
            VectorExpr::Mechanism(m) => m.inputs(),
        }
    }

    fn hash_literals(&self, h: &mut HashBuilder) {
        match self {
            VectorExpr::Literal(v) => {
                h.write_vec3(*v);
            }
            VectorExpr::ReferencePoint { name, .. } | VectorExpr::ReferenceVector { name, .. } => {
                h.write_str(name);
            }
            VectorExpr::Mechanism(m) => m.hash_literals(h),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn test_unbuilt_inputs_are_unresolved() {
        let mut graph = Graph::new();
        let a = graph.scalar("a", ScalarExpr::Literal(2.0));
        let b = graph.scalar("b", ScalarExpr::Literal(3.0));
        let c = ScalarExpr::binary(BinaryOp::Add, a, b);

        assert_relative_eq!(
            ScalarExpr::Literal(2.0).evaluate(&graph, 0.0).unwrap(),
            2.0
        );
        assert_eq!(
            c.evaluate(&graph, 0.0),
            Err(ExpressionError::Unresolved("a".into()))
        );
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            BinaryOp::Div.apply(1.0, 0.0),
            Err(ExpressionError::DivisionByZero)
        );
        assert_relative_eq!(BinaryOp::Div.apply(1.0, 4.0).unwrap(), 0.25);
    }

    #[test]
    fn test_unary_domains() {
        assert!(matches!(
            UnaryFn::Sqrt.apply(-1.0, 0.0),
            Err(ExpressionError::Domain {
                function: "sqrt",
                ..
            })
        ));
        assert!(UnaryFn::Ln.apply(0.0, 0.0).is_err());
        assert_relative_eq!(UnaryFn::Deg2Rad.apply(180.0, 0.0).unwrap(), PI);
    }

    #[test]
    fn test_acos_tolerance_policy() {
        assert_relative_eq!(checked_acos(1.0 + 1e-12, 1e-9).unwrap(), 0.0);
        assert_eq!(
            checked_acos(1.1, 1e-9),
            Err(ExpressionError::Domain {
                function: "acos",
                value: 1.1
            })
        );
        assert!(checked_acos(1.0 + 1e-12, 0.0).is_err());
    }

    #[test]
    fn test_rodrigues_rotation() {
        let v = rotate_about(DVec3::X, DVec3::Z, FRAC_PI_2);
        assert_relative_eq!(v.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(v.y, 1.0, epsilon = 1e-12);

        // Components along the axis are preserved
        let w = rotate_about(DVec3::new(1.0, 0.0, 2.0), DVec3::Z, PI);
        assert_relative_eq!(w.z, 2.0, epsilon = 1e-12);
        assert_relative_eq!(w.x, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_structural_tags_differ() {
        let mut graph = Graph::new();
        let a = graph.scalar("a", ScalarExpr::Literal(1.0));
        let sum = ScalarExpr::binary(BinaryOp::Add, a, a);
        let product = ScalarExpr::binary(BinaryOp::Mul, a, a);

        let mut h1 = HashBuilder::new(sum.tag());
        sum.hash_literals(&mut h1);
        let mut h2 = HashBuilder::new(product.tag());
        product.hash_literals(&mut h2);
        assert_ne!(h1.finish(), h2.finish());
        assert_eq!(sum.inputs(), vec![a.node(), a.node()]);
    }
}
