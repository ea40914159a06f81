use std::ffi::c_void;
use std::process::Command;
use std::time::Duration;

use convplan::device::{DevicePtr, FunctionId, Launch, ProgramId, ProgramSource, QueueHandle};
use convplan::{CodeObjectVersion, ConvError, ConvResult, DeviceDriver, DeviceInfo, KernelArg};

use crate::compiler::{CompilerConfig, HipCompiler};
use crate::runtime::{
    HipRuntime, HipStream, ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK, ATTRIBUTE_MULTIPROCESSOR_COUNT,
    MEMCPY_DEVICE_TO_DEVICE, MEMCPY_DEVICE_TO_HOST, MEMCPY_HOST_TO_DEVICE,
};

/// HIP device 0 with kernels built by [`HipCompiler`].
pub struct HipDriver {
    runtime: HipRuntime,
    compiler: HipCompiler,
    device: DeviceInfo,
}

impl HipDriver {
    /// Loads the HIP runtime and describes device 0. The target architecture
    /// comes from `CONVPLAN_HIP_ARCH` or `rocm_agent_enumerator`.
    pub fn open() -> ConvResult<Self> {
        let runtime = HipRuntime::load(0)?;
        let arch = match std::env::var("CONVPLAN_HIP_ARCH") {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => detect_arch()?,
        };
        let compute_units = runtime.attribute(ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let local_memory = runtime.attribute(ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)?;
        let device = DeviceInfo::new(arch.clone())
            .with_compute_units(compute_units.max(1) as usize)
            .with_local_memory(local_memory.max(0) as usize)
            .with_code_object(CodeObjectVersion::V3);
        log::info!(
            "opened HIP device {} ({} compute units)",
            device.name,
            device.compute_units
        );
        Ok(Self {
            runtime,
            compiler: HipCompiler::new(CompilerConfig::from_env(), arch),
            device,
        })
    }

    pub fn compiler(&self) -> &HipCompiler {
        &self.compiler
    }
}

fn stream(queue: QueueHandle) -> HipStream {
    queue.0 as usize as HipStream
}

fn raw(ptr: DevicePtr) -> *mut c_void {
    ptr.0 as usize as *mut c_void
}

fn detect_arch() -> ConvResult<String> {
    let output = Command::new("rocm_agent_enumerator").output().map_err(|err| {
        ConvError::driver_unavailable(
            crate::DRIVER_NAME,
            format!("cannot run rocm_agent_enumerator: {err}; set CONVPLAN_HIP_ARCH"),
        )
    })?;
    parse_agents(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        ConvError::driver_unavailable(crate::DRIVER_NAME, "no GPU agent reported")
    })
}

/// First GPU target in `rocm_agent_enumerator` output; `gfx000` is the host.
pub(crate) fn parse_agents(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("gfx") && *line != "gfx000")
        .map(str::to_string)
}

/// Packs kernel arguments the way the HIP `extra` launch buffer expects:
/// each value aligned to its own size.
pub(crate) fn pack_args(args: &[KernelArg]) -> Vec<u8> {
    let mut packed = Vec::new();
    for arg in args {
        let size = arg.byte_size();
        let padded = packed.len().div_ceil(size) * size;
        packed.resize(padded, 0);
        match arg {
            KernelArg::Buffer(ptr) => packed.extend_from_slice(&ptr.0.to_le_bytes()),
            KernelArg::I32(value) => packed.extend_from_slice(&value.to_le_bytes()),
            KernelArg::U32(value) => packed.extend_from_slice(&value.to_le_bytes()),
            KernelArg::F32(value) => packed.extend_from_slice(&value.to_le_bytes()),
        }
    }
    packed
}

fn dims(kernel: &str, values: [usize; 3]) -> ConvResult<[u32; 3]> {
    let mut out = [0u32; 3];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = u32::try_from(value)
            .map_err(|_| ConvError::launch(kernel, format!("dimension {value} exceeds u32")))?;
    }
    Ok(out)
}

impl DeviceDriver for HipDriver {
    fn driver_name(&self) -> &str {
        crate::DRIVER_NAME
    }

    fn device_info(&self) -> ConvResult<DeviceInfo> {
        Ok(self.device.clone())
    }

    fn create_queue(&self) -> ConvResult<QueueHandle> {
        let stream = self.runtime.stream_create()?;
        Ok(QueueHandle(stream as usize as u64))
    }

    fn destroy_queue(&self, queue: QueueHandle) {
        self.runtime.stream_destroy(stream(queue));
    }

    fn alloc(&self, bytes: usize) -> ConvResult<DevicePtr> {
        let ptr = self.runtime.malloc(bytes)?;
        Ok(DevicePtr(ptr as usize as u64))
    }

    fn free(&self, ptr: DevicePtr) {
        self.runtime.free(raw(ptr));
    }

    fn write(&self, queue: QueueHandle, dst: DevicePtr, src: &[u8]) -> ConvResult<()> {
        self.runtime.ensure_current()?;
        self.runtime.memcpy_async(
            raw(dst),
            src.as_ptr() as *const c_void,
            src.len(),
            MEMCPY_HOST_TO_DEVICE,
            stream(queue),
        )?;
        self.runtime.stream_synchronize(stream(queue))
    }

    fn read(&self, queue: QueueHandle, src: DevicePtr, dst: &mut [u8]) -> ConvResult<()> {
        self.runtime.ensure_current()?;
        self.runtime.memcpy_async(
            dst.as_mut_ptr() as *mut c_void,
            raw(src) as *const c_void,
            dst.len(),
            MEMCPY_DEVICE_TO_HOST,
            stream(queue),
        )?;
        self.runtime.stream_synchronize(stream(queue))
    }

    fn copy(
        &self,
        queue: QueueHandle,
        src: DevicePtr,
        dst: DevicePtr,
        bytes: usize,
    ) -> ConvResult<()> {
        self.runtime.ensure_current()?;
        self.runtime.memcpy_async(
            raw(dst),
            raw(src) as *const c_void,
            bytes,
            MEMCPY_DEVICE_TO_DEVICE,
            stream(queue),
        )
    }

    fn build_program(&self, source: &ProgramSource) -> ConvResult<ProgramId> {
        let compiled = self.compiler.compile(source)?;
        let module = self
            .runtime
            .module_load(&compiled.code_object)
            .map_err(|err| ConvError::compile(&source.name, err.to_string()))?;
        Ok(ProgramId(module as usize as u64))
    }

    fn release_program(&self, program: ProgramId) {
        self.runtime.module_unload(program.0 as usize as *mut c_void);
    }

    fn get_function(&self, program: ProgramId, kernel_name: &str) -> ConvResult<FunctionId> {
        let function = self
            .runtime
            .module_get_function(program.0 as usize as *mut c_void, kernel_name)
            .map_err(|err| ConvError::compile(kernel_name, err.to_string()))?;
        Ok(FunctionId(function as usize as u64))
    }

    fn launch(&self, queue: QueueHandle, launch: &Launch<'_>) -> ConvResult<Option<Duration>> {
        let grid = dims(launch.kernel_name, launch.grid_blocks())?;
        let block = dims(launch.kernel_name, launch.local)?;
        let mut args = pack_args(launch.args);
        let function = launch.function.0 as usize as *mut c_void;
        let queue = stream(queue);
        self.runtime.ensure_current()?;

        if !launch.timed {
            self.runtime
                .launch(function, grid, block, queue, &mut args)
                .map_err(|err| ConvError::launch(launch.kernel_name, err.to_string()))?;
            return Ok(None);
        }

        let start = self.runtime.event_create()?;
        let stop = match self.runtime.event_create() {
            Ok(stop) => stop,
            Err(err) => {
                self.runtime.event_destroy(start);
                return Err(err);
            }
        };
        let timed = (|| {
            self.runtime.event_record(start, queue)?;
            self.runtime
                .launch(function, grid, block, queue, &mut args)
                .map_err(|err| ConvError::launch(launch.kernel_name, err.to_string()))?;
            self.runtime.event_record(stop, queue)?;
            self.runtime.event_elapsed_ms(start, stop)
        })();
        self.runtime.event_destroy(start);
        self.runtime.event_destroy(stop);
        let ms = timed?;
        Ok(Some(Duration::from_secs_f64(f64::from(ms.max(0.0)) / 1000.0)))
    }

    fn finish(&self, queue: QueueHandle) -> ConvResult<()> {
        self.runtime.stream_synchronize(stream(queue))
    }

    fn flush(&self, _queue: QueueHandle) -> ConvResult<()> {
        // HIP submits work at enqueue time.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_are_naturally_aligned() {
        let packed = pack_args(&[
            KernelArg::I32(7),
            KernelArg::Buffer(DevicePtr(0x1122_3344_5566_7788)),
            KernelArg::U32(3),
            KernelArg::F32(1.5),
            KernelArg::Buffer(DevicePtr(1)),
        ]);
        assert_eq!(packed.len(), 32);
        assert_eq!(&packed[0..4], &7i32.to_le_bytes());
        assert_eq!(&packed[4..8], &[0; 4]);
        assert_eq!(&packed[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&packed[16..20], &3u32.to_le_bytes());
        assert_eq!(&packed[20..24], &1.5f32.to_le_bytes());
        assert_eq!(&packed[24..32], &1u64.to_le_bytes());
    }

    #[test]
    fn agent_listing_skips_the_host() {
        assert_eq!(
            parse_agents("gfx000\ngfx906\ngfx906\n").as_deref(),
            Some("gfx906")
        );
        assert_eq!(parse_agents("gfx000\n"), None);
        assert_eq!(parse_agents(""), None);
    }

    #[test]
    fn oversized_dimensions_are_rejected() {
        assert!(dims("k", [1 << 40, 1, 1]).is_err());
        assert_eq!(dims("k", [4, 2, 1]).expect("dims"), [4, 2, 1]);
    }
}
