//! Driver seam between the handle and an accelerator runtime.
//!
//! A [`DeviceDriver`] is the only place that talks to a concrete runtime
//! (HIP, the reference CPU driver, ...). Everything above it works with the
//! opaque ids defined here, which are plain integers so handles stay
//! `Send + Sync` regardless of what the runtime stores behind them.

mod buffer;
pub mod registry;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::ConvResult;

pub use buffer::DeviceBuffer;

/// Runtime queue (stream) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

/// Device allocation address as seen by kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// Loaded program (code object) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u64);

/// Kernel entry point resolved inside a loaded program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u64);

/// Code-object metadata version accepted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeObjectVersion {
    V2,
    /// The runtime loads both v2 and v3 code objects.
    V2V3,
    V3,
}

impl CodeObjectVersion {
    pub fn is_v2(self) -> bool {
        matches!(self, CodeObjectVersion::V2 | CodeObjectVersion::V2V3)
    }

    pub fn is_v3(self) -> bool {
        matches!(self, CodeObjectVersion::V2V3 | CodeObjectVersion::V3)
    }

    /// Whether kernels should be assembled with v3 metadata.
    pub fn use_v3(self) -> bool {
        match self {
            CodeObjectVersion::V3 => true,
            CodeObjectVersion::V2V3 => env::prefer_code_object_v3(),
            CodeObjectVersion::V2 => false,
        }
    }

    /// Value passed to the assembler as `ROCM_METADATA_VERSION`.
    pub fn metadata_version(self) -> u32 {
        if self.use_v3() {
            5
        } else {
            4
        }
    }
}

/// Capabilities of the device behind a handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Architecture string, e.g. `gfx906` or `gfx906:sramecc+:xnack-`.
    pub name: String,
    pub compute_units: usize,
    /// Local (shared) memory available to one workgroup, in bytes.
    pub local_memory_bytes: usize,
    pub code_object: CodeObjectVersion,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compute_units: 64,
            local_memory_bytes: 64 * 1024,
            code_object: CodeObjectVersion::V3,
        }
    }

    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = compute_units;
        self
    }

    pub fn with_local_memory(mut self, bytes: usize) -> Self {
        self.local_memory_bytes = bytes;
        self
    }

    pub fn with_code_object(mut self, code_object: CodeObjectVersion) -> Self {
        self.code_object = code_object;
        self
    }

    /// Architecture name without target feature suffixes.
    pub fn arch(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }
}

/// Scalar or pointer argument passed to a kernel by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(DevicePtr),
    I32(i32),
    U32(u32),
    F32(f32),
}

impl KernelArg {
    pub fn buffer(buffer: &DeviceBuffer) -> Self {
        KernelArg::Buffer(buffer.device_ptr())
    }

    /// Size of the argument in the kernel's argument segment.
    pub fn byte_size(&self) -> usize {
        match self {
            KernelArg::Buffer(_) => 8,
            KernelArg::I32(_) | KernelArg::U32(_) | KernelArg::F32(_) => 4,
        }
    }
}

impl fmt::Display for KernelArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Buffer(ptr) => write!(f, "ptr:{:#x}", ptr.0),
            KernelArg::I32(value) => write!(f, "{value}"),
            KernelArg::U32(value) => write!(f, "{value}u"),
            KernelArg::F32(value) => write!(f, "{value}f"),
        }
    }
}

/// What to build: a kernel source compiled with `params`, or a prebuilt
/// binary when `is_binary` is set (params are ignored for binaries).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramSource {
    pub name: String,
    pub params: String,
    pub is_binary: bool,
}

/// One kernel enqueue request handed to the driver.
#[derive(Debug, Clone, Copy)]
pub struct Launch<'a> {
    pub function: FunctionId,
    pub kernel_name: &'a str,
    /// Global work size in work items.
    pub global: [usize; 3],
    /// Workgroup size in work items.
    pub local: [usize; 3],
    pub args: &'a [KernelArg],
    /// Measure the elapsed device time of this launch.
    pub timed: bool,
}

impl Launch<'_> {
    /// Number of workgroups per dimension; global sizes are whole multiples of
    /// local sizes for every plan the solvers emit.
    pub fn grid_blocks(&self) -> [usize; 3] {
        let mut blocks = [1; 3];
        for (dim, slot) in blocks.iter_mut().enumerate() {
            *slot = self.global[dim] / self.local[dim].max(1);
        }
        blocks
    }
}

/// Accelerator runtime used by a [`crate::Handle`].
///
/// Implementations must execute work submitted to one queue in submission
/// order. `write`/`read`/`copy` return only once the data is valid for the
/// caller to reuse.
pub trait DeviceDriver: Send + Sync {
    /// Human-readable driver identifier (e.g. `"hip"`, `"ref-cpu"`).
    fn driver_name(&self) -> &str;

    fn device_info(&self) -> ConvResult<DeviceInfo>;

    fn create_queue(&self) -> ConvResult<QueueHandle>;

    fn destroy_queue(&self, queue: QueueHandle);

    fn alloc(&self, bytes: usize) -> ConvResult<DevicePtr>;

    fn free(&self, ptr: DevicePtr);

    fn write(&self, queue: QueueHandle, dst: DevicePtr, src: &[u8]) -> ConvResult<()>;

    fn read(&self, queue: QueueHandle, src: DevicePtr, dst: &mut [u8]) -> ConvResult<()>;

    fn copy(
        &self,
        queue: QueueHandle,
        src: DevicePtr,
        dst: DevicePtr,
        bytes: usize,
    ) -> ConvResult<()>;

    /// Compiles or loads a program. Failures are `ConvError::Compile`.
    fn build_program(&self, source: &ProgramSource) -> ConvResult<ProgramId>;

    fn release_program(&self, program: ProgramId);

    fn get_function(&self, program: ProgramId, kernel_name: &str) -> ConvResult<FunctionId>;

    /// Enqueues a kernel. Returns the elapsed device time when `launch.timed`
    /// is set and the runtime can measure it.
    fn launch(&self, queue: QueueHandle, launch: &Launch<'_>) -> ConvResult<Option<Duration>>;

    /// Blocks until all work on `queue` has completed.
    fn finish(&self, queue: QueueHandle) -> ConvResult<()>;

    /// Submits pending work on `queue` without waiting.
    fn flush(&self, queue: QueueHandle) -> ConvResult<()>;
}
