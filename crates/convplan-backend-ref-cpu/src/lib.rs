//! Reference host driver for `convplan`.
//!
//! Runs every kernel the built-in solvers name on the host, against memory
//! that rejects out-of-bounds accesses and records the furthest byte each
//! kernel touched in every allocation. Intended for tests and for checking a
//! plan's numerics without an accelerator.

mod driver;
mod kernels;

use std::sync::Arc;

use convplan::device::registry::register_driver;
use convplan::DeviceDriver;

pub use driver::{AccessStats, LaunchRecord, RefCpuDriver};

pub const DRIVER_NAME: &str = "ref-cpu";

/// Registers the reference driver under [`DRIVER_NAME`].
pub fn register_ref_cpu_driver() {
    register_driver(DRIVER_NAME, || {
        Ok(Arc::new(RefCpuDriver::new()) as Arc<dyn DeviceDriver>)
    });
}

#[convplan::linkme::distributed_slice(convplan::device::registry::DRIVER_REGISTRARS)]
static REGISTER_REF_CPU_DRIVER: fn() = register_ref_cpu_driver;
