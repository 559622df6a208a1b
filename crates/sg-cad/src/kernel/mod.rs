//! Geometry kernel abstraction

mod stub;
mod traits;

pub use stub::StubKernel;
pub use traits::*;

/// Get the default kernel (the deterministic stub)
pub fn default_kernel() -> Box<dyn CadKernel> {
    Box::new(StubKernel::new())
}
