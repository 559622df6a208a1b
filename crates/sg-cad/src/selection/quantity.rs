//! Per-entity quantities used by filters

use std::fmt;
use std::sync::Arc;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::{ExpressionError, SelectionResult};
use crate::graph::{NodeId, Resolver, ScalarId, VectorId};
use crate::hash::HashBuilder;
use crate::kernel::{CadKernel, EntityKind, QuantityKind, Shape};

/// Everything a quantity needs to measure one candidate
pub struct QueryContext<'a> {
    pub kernel: &'a dyn CadKernel,
    pub shape: &'a Shape,
    pub kind: EntityKind,
    /// Values of parameters referenced by the query
    pub inputs: &'a dyn Resolver,
}

impl QueryContext<'_> {
    pub fn measure(&self, quantity: QuantityKind, index: u32) -> SelectionResult<f64> {
        Ok(self.kernel.measure(self.shape, quantity, self.kind, index)?)
    }

    pub fn centroid(&self, index: u32) -> SelectionResult<DVec3> {
        Ok(DVec3::new(
            self.measure(QuantityKind::CentroidX, index)?,
            self.measure(QuantityKind::CentroidY, index)?,
            self.measure(QuantityKind::CentroidZ, index)?,
        ))
    }

    pub fn normal(&self, index: u32) -> SelectionResult<DVec3> {
        Ok(DVec3::new(
            self.measure(QuantityKind::NormalX, index)?,
            self.measure(QuantityKind::NormalY, index)?,
            self.measure(QuantityKind::NormalZ, index)?,
        ))
    }
}

/// Pluggable scalar strategy evaluated per sub-entity
pub trait QuantityComputer: fmt::Debug + Send + Sync {
    fn evaluate(&self, ctx: &QueryContext<'_>, index: u32) -> SelectionResult<f64>;

    /// Mix the strategy's identity and settings into a content hash
    fn hash_into(&self, h: &mut HashBuilder);
}

/// Vector-valued quantity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VectorQuantity {
    Centroid,
    Normal,
    Constant(DVec3),
    Parameter(VectorId),
}

impl VectorQuantity {
    pub fn evaluate(&self, ctx: &QueryContext<'_>, index: u32) -> SelectionResult<DVec3> {
        match self {
            VectorQuantity::Centroid => ctx.centroid(index),
            VectorQuantity::Normal => ctx.normal(index),
            VectorQuantity::Constant(v) => Ok(*v),
            VectorQuantity::Parameter(id) => Ok(ctx.inputs.vector_value(*id)?),
        }
    }

    fn collect_inputs(&self, out: &mut Vec<NodeId>) {
        if let VectorQuantity::Parameter(id) = self {
            out.push(id.node());
        }
    }

    fn hash_into(&self, h: &mut HashBuilder) {
        match self {
            VectorQuantity::Centroid => h.write_str("centroid"),
            VectorQuantity::Normal => h.write_str("normal"),
            VectorQuantity::Constant(v) => h.write_str("constant").write_vec3(*v),
            VectorQuantity::Parameter(_) => h.write_str("parameter"),
        };
    }
}

/// Scalar quantity over the sub-entities of a shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Quantity {
    Measure(QuantityKind),
    Constant(f64),
    Parameter(ScalarId),
    Add(Box<Quantity>, Box<Quantity>),
    Sub(Box<Quantity>, Box<Quantity>),
    Mul(Box<Quantity>, Box<Quantity>),
    Div(Box<Quantity>, Box<Quantity>),
    Dot(VectorQuantity, VectorQuantity),
    Distance(VectorQuantity, VectorQuantity),
    #[serde(skip)]
    Custom(Arc<dyn QuantityComputer>),
}

impl Quantity {
    pub fn length() -> Self {
        Quantity::Measure(QuantityKind::Length)
    }

    pub fn area() -> Self {
        Quantity::Measure(QuantityKind::Area)
    }

    pub fn volume() -> Self {
        Quantity::Measure(QuantityKind::Volume)
    }

    /// Signed distance of the centroid along a fixed direction
    pub fn along(direction: DVec3) -> Self {
        Quantity::Dot(VectorQuantity::Centroid, VectorQuantity::Constant(direction))
    }

    pub fn evaluate(&self, ctx: &QueryContext<'_>, index: u32) -> SelectionResult<f64> {
        match self {
            Quantity::Measure(kind) => ctx.measure(*kind, index),
            Quantity::Constant(v) => Ok(*v),
            Quantity::Parameter(id) => Ok(ctx.inputs.scalar_value(*id)?),
            Quantity::Add(a, b) => Ok(a.evaluate(ctx, index)? + b.evaluate(ctx, index)?),
            Quantity::Sub(a, b) => Ok(a.evaluate(ctx, index)? - b.evaluate(ctx, index)?),
            Quantity::Mul(a, b) => Ok(a.evaluate(ctx, index)? * b.evaluate(ctx, index)?),
            Quantity::Div(a, b) => {
                let divisor = b.evaluate(ctx, index)?;
                if divisor == 0.0 {
                    return Err(ExpressionError::DivisionByZero.into());
                }
                Ok(a.evaluate(ctx, index)? / divisor)
            }
            Quantity::Dot(a, b) => Ok(a.evaluate(ctx, index)?.dot(b.evaluate(ctx, index)?)),
            Quantity::Distance(a, b) => {
                Ok(a.evaluate(ctx, index)?.distance(b.evaluate(ctx, index)?))
            }
            Quantity::Custom(computer) => computer.evaluate(ctx, index),
        }
    }

    /// Parameter nodes this quantity reads, in a fixed order
    pub fn collect_inputs(&self, out: &mut Vec<NodeId>) {
        match self {
            Quantity::Parameter(id) => out.push(id.node()),
            Quantity::Add(a, b) | Quantity::Sub(a, b) | Quantity::Mul(a, b) | Quantity::Div(a, b) => {
                a.collect_inputs(out);
                b.collect_inputs(out);
            }
            Quantity::Dot(a, b) | Quantity::Distance(a, b) => {
                a.collect_inputs(out);
                b.collect_inputs(out);
            }
            Quantity::Measure(_) | Quantity::Constant(_) | Quantity::Custom(_) => {}
        }
    }

    pub fn hash_into(&self, h: &mut HashBuilder) {
        let pair = |tag: &str, a: &Quantity, b: &Quantity, h: &mut HashBuilder| {
            h.write_str(tag);
            a.hash_into(h);
            b.hash_into(h);
        };
        match self {
            Quantity::Measure(kind) => {
                h.write_str("measure").write_str(kind.tag());
            }
            Quantity::Constant(v) => {
                h.write_str("constant").write_f64(*v);
            }
            Quantity::Parameter(_) => {
                h.write_str("parameter");
            }
            Quantity::Add(a, b) => pair("add", a, b, h),
            Quantity::Sub(a, b) => pair("sub", a, b, h),
            Quantity::Mul(a, b) => pair("mul", a, b, h),
            Quantity::Div(a, b) => pair("div", a, b, h),
            Quantity::Dot(a, b) => {
                h.write_str("dot");
                a.hash_into(h);
                b.hash_into(h);
            }
            Quantity::Distance(a, b) => {
                h.write_str("distance");
                a.hash_into(h);
                b.hash_into(h);
            }
            Quantity::Custom(computer) => {
                h.write_str("custom");
                computer.hash_into(h);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::kernel::{KernelOp, StubKernel};
    use approx::assert_relative_eq;

    #[derive(Debug)]
    struct IndexSquared;

    impl QuantityComputer for IndexSquared {
        fn evaluate(&self, _ctx: &QueryContext<'_>, index: u32) -> SelectionResult<f64> {
            Ok(f64::from(index * index))
        }

        fn hash_into(&self, h: &mut HashBuilder) {
            h.write_str("index-squared");
        }
    }

    #[test]
    fn test_quantities_on_box_faces() {
        let kernel = StubKernel::new();
        let shape = kernel
            .build(&KernelOp::Box {
                origin: DVec3::ZERO,
                extent: DVec3::new(1.0, 2.0, 3.0),
                centered: false,
            })
            .unwrap();
        let graph = Graph::new();
        let ctx = QueryContext {
            kernel: &kernel,
            shape: &shape,
            kind: EntityKind::Face,
            inputs: &graph,
        };

        // Face 5 is the +Z face of the stub box
        assert_relative_eq!(Quantity::along(DVec3::Z).evaluate(&ctx, 5).unwrap(), 3.0);
        assert_relative_eq!(Quantity::area().evaluate(&ctx, 5).unwrap(), 2.0);

        let ratio = Quantity::Div(
            Box::new(Quantity::area()),
            Box::new(Quantity::Constant(0.0)),
        );
        assert!(ratio.evaluate(&ctx, 0).is_err());

        let custom = Quantity::Custom(Arc::new(IndexSquared));
        assert_relative_eq!(custom.evaluate(&ctx, 3).unwrap(), 9.0);
    }

    #[test]
    fn test_hash_distinguishes_structure() {
        let digest = |q: &Quantity| {
            let mut h = HashBuilder::new("q");
            q.hash_into(&mut h);
            h.finish()
        };
        let a = Quantity::Sub(Box::new(Quantity::length()), Box::new(Quantity::area()));
        let b = Quantity::Sub(Box::new(Quantity::area()), Box::new(Quantity::length()));
        assert_ne!(digest(&a), digest(&b));
        assert_ne!(
            digest(&Quantity::Custom(Arc::new(IndexSquared))),
            digest(&Quantity::length())
        );
    }
}
