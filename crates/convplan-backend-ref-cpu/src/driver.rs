use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use convplan::device::{
    DevicePtr, FunctionId, Launch, ProgramId, ProgramSource, QueueHandle,
};
use convplan::{ConvError, ConvResult, DeviceDriver, DeviceInfo, KernelArg};

use crate::kernels::{self, KernelContext, KernelDef};

/// Addresses start here so a null or small integer is never a valid buffer.
const BASE_ADDRESS: u64 = 0x1000_0000;
/// Unmapped gap between consecutive allocations.
const GUARD_BYTES: u64 = 0x1000;

/// Per-allocation record of how far kernels reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessStats {
    pub bytes: usize,
    /// One past the highest byte any kernel read.
    pub kernel_read_end: usize,
    /// One past the highest byte any kernel wrote.
    pub kernel_write_end: usize,
    pub kernel_reads: u64,
    pub kernel_writes: u64,
}

/// One kernel launch as the driver received it.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub program: String,
    pub kernel_name: String,
    pub global: [usize; 3],
    pub local: [usize; 3],
    pub args: Vec<KernelArg>,
}

struct Allocation {
    data: Vec<u8>,
    stats: AccessStats,
}

/// Flat device memory with bounds-checked element access.
pub(crate) struct Memory {
    allocations: HashMap<u64, Allocation>,
    next_address: u64,
}

impl Memory {
    fn new() -> Self {
        Self {
            allocations: HashMap::new(),
            next_address: BASE_ADDRESS,
        }
    }

    fn alloc(&mut self, bytes: usize) -> DevicePtr {
        let address = self.next_address;
        let span = (bytes as u64).div_ceil(GUARD_BYTES) * GUARD_BYTES;
        self.next_address = address + span + GUARD_BYTES;
        self.allocations.insert(
            address,
            Allocation {
                data: vec![0; bytes],
                stats: AccessStats {
                    bytes,
                    ..AccessStats::default()
                },
            },
        );
        DevicePtr(address)
    }

    fn allocation(&self, ptr: DevicePtr) -> ConvResult<&Allocation> {
        self.allocations
            .get(&ptr.0)
            .ok_or_else(|| ConvError::device(format!("{:#x} is not a live allocation", ptr.0)))
    }

    fn allocation_mut(&mut self, ptr: DevicePtr) -> ConvResult<&mut Allocation> {
        self.allocations
            .get_mut(&ptr.0)
            .ok_or_else(|| ConvError::device(format!("{:#x} is not a live allocation", ptr.0)))
    }

    fn host_write(&mut self, dst: DevicePtr, src: &[u8]) -> ConvResult<()> {
        let allocation = self.allocation_mut(dst)?;
        let target = allocation.data.get_mut(..src.len()).ok_or_else(|| {
            ConvError::device(format!(
                "write of {} bytes overflows {:#x} ({} bytes)",
                src.len(),
                dst.0,
                allocation.stats.bytes
            ))
        })?;
        target.copy_from_slice(src);
        Ok(())
    }

    fn host_read(&self, src: DevicePtr, dst: &mut [u8]) -> ConvResult<()> {
        let allocation = self.allocation(src)?;
        let source = allocation.data.get(..dst.len()).ok_or_else(|| {
            ConvError::device(format!(
                "read of {} bytes overflows {:#x} ({} bytes)",
                dst.len(),
                src.0,
                allocation.stats.bytes
            ))
        })?;
        dst.copy_from_slice(source);
        Ok(())
    }

    /// Reads element `index` of type `T` for `kernel`.
    pub(crate) fn load<T: kernels::Element>(
        &mut self,
        kernel: &str,
        ptr: DevicePtr,
        index: usize,
    ) -> ConvResult<T> {
        let allocation = self
            .allocations
            .get_mut(&ptr.0)
            .ok_or_else(|| ConvError::launch(kernel, format!("{:#x} is not a buffer", ptr.0)))?;
        let start = index * T::SIZE;
        let end = start + T::SIZE;
        let bytes = allocation.data.get(start..end).ok_or_else(|| {
            ConvError::launch(
                kernel,
                format!(
                    "out-of-bounds read of bytes {start}..{end} in {:#x} ({} bytes)",
                    ptr.0, allocation.stats.bytes
                ),
            )
        })?;
        let value = T::from_le_bytes(bytes);
        allocation.stats.kernel_read_end = allocation.stats.kernel_read_end.max(end);
        allocation.stats.kernel_reads += 1;
        Ok(value)
    }

    /// Writes element `index` of type `T` for `kernel`.
    pub(crate) fn store<T: kernels::Element>(
        &mut self,
        kernel: &str,
        ptr: DevicePtr,
        index: usize,
        value: T,
    ) -> ConvResult<()> {
        let allocation = self
            .allocations
            .get_mut(&ptr.0)
            .ok_or_else(|| ConvError::launch(kernel, format!("{:#x} is not a buffer", ptr.0)))?;
        let start = index * T::SIZE;
        let end = start + T::SIZE;
        let total = allocation.stats.bytes;
        let bytes = allocation.data.get_mut(start..end).ok_or_else(|| {
            ConvError::launch(
                kernel,
                format!(
                    "out-of-bounds write of bytes {start}..{end} in {:#x} ({total} bytes)",
                    ptr.0
                ),
            )
        })?;
        value.write_le_bytes(bytes);
        allocation.stats.kernel_write_end = allocation.stats.kernel_write_end.max(end);
        allocation.stats.kernel_writes += 1;
        Ok(())
    }
}

struct LoadedFunction {
    program: u64,
    def: &'static KernelDef,
}

struct State {
    next_id: u64,
    queues: HashSet<u64>,
    memory: Memory,
    programs: HashMap<u64, ProgramSource>,
    functions: HashMap<u64, LoadedFunction>,
    launches: Vec<LaunchRecord>,
    builds: Vec<ProgramSource>,
    failing_programs: HashSet<String>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_queue(&self, queue: QueueHandle) -> ConvResult<()> {
        if self.queues.contains(&queue.0) {
            Ok(())
        } else {
            Err(ConvError::device(format!("queue {} does not exist", queue.0)))
        }
    }
}

/// Host driver executing kernels synchronously at enqueue time.
pub struct RefCpuDriver {
    device: DeviceInfo,
    state: Mutex<State>,
}

impl RefCpuDriver {
    /// A gfx906-like device with 60 compute units and 64 KiB of LDS.
    pub fn new() -> Self {
        Self::with_device(DeviceInfo::new("gfx906").with_compute_units(60))
    }

    /// Reports `device` from [`DeviceDriver::device_info`]; kernels still run
    /// on the host regardless of the name.
    pub fn with_device(device: DeviceInfo) -> Self {
        Self {
            device,
            state: Mutex::new(State {
                next_id: 0,
                queues: HashSet::new(),
                memory: Memory::new(),
                programs: HashMap::new(),
                functions: HashMap::new(),
                launches: Vec::new(),
                builds: Vec::new(),
                failing_programs: HashSet::new(),
            }),
        }
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state_or_recover().launches.clone()
    }

    pub fn clear_launches(&self) {
        self.state_or_recover().launches.clear();
    }

    /// Every program build the driver performed, in order.
    pub fn builds(&self) -> Vec<ProgramSource> {
        self.state_or_recover().builds.clone()
    }

    pub fn live_programs(&self) -> usize {
        self.state_or_recover().programs.len()
    }

    pub fn live_functions(&self) -> usize {
        self.state_or_recover().functions.len()
    }

    pub fn live_queues(&self) -> usize {
        self.state_or_recover().queues.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state_or_recover().memory.allocations.len()
    }

    pub fn access_stats(&self, ptr: DevicePtr) -> Option<AccessStats> {
        self.state_or_recover()
            .memory
            .allocations
            .get(&ptr.0)
            .map(|allocation| allocation.stats)
    }

    pub fn reset_access_stats(&self) {
        for allocation in self.state_or_recover().memory.allocations.values_mut() {
            allocation.stats = AccessStats {
                bytes: allocation.stats.bytes,
                ..AccessStats::default()
            };
        }
    }

    /// Makes every later build of `program` fail with a compile error.
    pub fn fail_builds_of(&self, program: &str) {
        self.state_or_recover()
            .failing_programs
            .insert(program.to_string());
    }

    fn state(&self) -> ConvResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| ConvError::device("reference driver state poisoned"))
    }

    fn state_or_recover(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RefCpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for RefCpuDriver {
    fn driver_name(&self) -> &str {
        crate::DRIVER_NAME
    }

    fn device_info(&self) -> ConvResult<DeviceInfo> {
        Ok(self.device.clone())
    }

    fn create_queue(&self) -> ConvResult<QueueHandle> {
        let mut state = self.state()?;
        let id = state.next_id();
        state.queues.insert(id);
        Ok(QueueHandle(id))
    }

    fn destroy_queue(&self, queue: QueueHandle) {
        self.state_or_recover().queues.remove(&queue.0);
    }

    fn alloc(&self, bytes: usize) -> ConvResult<DevicePtr> {
        Ok(self.state()?.memory.alloc(bytes))
    }

    fn free(&self, ptr: DevicePtr) {
        self.state_or_recover().memory.allocations.remove(&ptr.0);
    }

    fn write(&self, queue: QueueHandle, dst: DevicePtr, src: &[u8]) -> ConvResult<()> {
        let mut state = self.state()?;
        state.check_queue(queue)?;
        state.memory.host_write(dst, src)
    }

    fn read(&self, queue: QueueHandle, src: DevicePtr, dst: &mut [u8]) -> ConvResult<()> {
        let state = self.state()?;
        state.check_queue(queue)?;
        state.memory.host_read(src, dst)
    }

    fn copy(
        &self,
        queue: QueueHandle,
        src: DevicePtr,
        dst: DevicePtr,
        bytes: usize,
    ) -> ConvResult<()> {
        let mut state = self.state()?;
        state.check_queue(queue)?;
        let mut staging = vec![0u8; bytes];
        state.memory.host_read(src, &mut staging)?;
        state.memory.host_write(dst, &staging)
    }

    fn build_program(&self, source: &ProgramSource) -> ConvResult<ProgramId> {
        let mut state = self.state()?;
        if state.failing_programs.contains(&source.name) {
            return Err(ConvError::compile(&source.name, "build failure requested"));
        }
        if !kernels::is_known_program(&source.name) {
            return Err(ConvError::compile(
                &source.name,
                "no host implementation for this program",
            ));
        }
        log::trace!("ref-cpu build {} `{}`", source.name, source.params);
        state.builds.push(source.clone());
        let id = state.next_id();
        state.programs.insert(id, source.clone());
        Ok(ProgramId(id))
    }

    fn release_program(&self, program: ProgramId) {
        let mut state = self.state_or_recover();
        state.programs.remove(&program.0);
        state
            .functions
            .retain(|_, function| function.program != program.0);
    }

    fn get_function(&self, program: ProgramId, kernel_name: &str) -> ConvResult<FunctionId> {
        let mut state = self.state()?;
        let source = state
            .programs
            .get(&program.0)
            .ok_or_else(|| ConvError::device(format!("program {} is not loaded", program.0)))?;
        let def = kernels::find(&source.name, kernel_name).ok_or_else(|| {
            ConvError::compile(&source.name, format!("no kernel named `{kernel_name}`"))
        })?;
        let id = state.next_id();
        state.functions.insert(
            id,
            LoadedFunction {
                program: program.0,
                def,
            },
        );
        Ok(FunctionId(id))
    }

    fn launch(&self, queue: QueueHandle, launch: &Launch<'_>) -> ConvResult<Option<Duration>> {
        let mut state = self.state()?;
        state.check_queue(queue)?;
        let (program, def) = {
            let function = state.functions.get(&launch.function.0).ok_or_else(|| {
                ConvError::launch(launch.kernel_name, "unknown function handle")
            })?;
            (function.program, function.def)
        };
        let program_name = state
            .programs
            .get(&program)
            .map(|source| source.name.clone())
            .ok_or_else(|| ConvError::launch(launch.kernel_name, "program was released"))?;

        state.launches.push(LaunchRecord {
            program: program_name,
            kernel_name: launch.kernel_name.to_string(),
            global: launch.global,
            local: launch.local,
            args: launch.args.to_vec(),
        });

        let started = Instant::now();
        let mut context = KernelContext::new(
            def.name,
            launch.grid_blocks(),
            launch.local,
            launch.args,
            &mut state.memory,
        );
        (def.run)(&mut context)?;
        let elapsed = started.elapsed().max(Duration::from_nanos(1));
        Ok(launch.timed.then_some(elapsed))
    }

    fn finish(&self, queue: QueueHandle) -> ConvResult<()> {
        self.state()?.check_queue(queue)
    }

    fn flush(&self, queue: QueueHandle) -> ConvResult<()> {
        self.state()?.check_queue(queue)
    }
}
