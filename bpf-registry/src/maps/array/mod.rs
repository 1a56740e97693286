//! Array types.
#[allow(clippy::module_inception)]
mod array;
mod per_cpu_array;

pub use array::*;
pub use per_cpu_array::PerCpuArray;
