extern crate self as convplan;

pub use linkme;

pub mod capability;
pub mod device;
mod env;
pub mod error;
pub mod handle;
pub mod hashing;
pub mod invoker;
pub mod problem;
pub mod registry;
pub mod solution;
pub mod solver;

pub use capability::SolverFamily;
pub use device::{DeviceBuffer, DeviceDriver, DeviceInfo, KernelArg};
pub use error::{ConvError, ConvResult};
pub use handle::{CacheStats, Handle, Kernel, KernelInvoke, KernelRequest};
pub use invoker::{ConvShape, InvokeParams, Invoker, InvokerFactory};
pub use problem::{CodeObjectVersion, DataType, Direction, ProblemBuilder, ProblemDescription};
pub use registry::SolverRegistry;
pub use solution::{ConvSolution, KernelInfo};
pub use solver::{
    gemmk_groups, Applicable, ConvAsmImplicitGemmV4R1DynamicFwd, ConvAsmImplicitGemmV4R1DynamicWrw,
    ConvDirectNaive, Solver, SolverConfig,
};
