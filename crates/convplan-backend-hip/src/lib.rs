//! ROCm/HIP driver for `convplan`.
//!
//! The HIP runtime is loaded with `libloading` when the driver is opened, so
//! the crate builds and links on machines without ROCm. Kernel programs are
//! compiled on first use and cached on disk.

mod compiler;
mod driver;
mod runtime;

use std::sync::Arc;

use convplan::device::registry::register_driver;
use convplan::DeviceDriver;

pub use compiler::{build_args, CompiledProgram, CompilerConfig, HipCompiler, ProgramKind};
pub use driver::HipDriver;

pub const DRIVER_NAME: &str = "hip";

/// Registers the HIP driver under [`DRIVER_NAME`]. Registration does not
/// touch the runtime; opening does.
pub fn register_hip_driver() {
    register_driver(DRIVER_NAME, || {
        Ok(Arc::new(HipDriver::open()?) as Arc<dyn DeviceDriver>)
    });
}

#[convplan::linkme::distributed_slice(convplan::device::registry::DRIVER_REGISTRARS)]
static REGISTER_HIP_DRIVER: fn() = register_hip_driver;
