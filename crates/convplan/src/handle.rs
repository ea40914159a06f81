//! Device context: one queue, the program and kernel caches, profiling state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytemuck::Pod;

use crate::device::registry::create_driver;
use crate::device::{
    DeviceBuffer, DeviceDriver, DeviceInfo, FunctionId, KernelArg, Launch, ProgramId,
    ProgramSource, QueueHandle,
};
use crate::env;
use crate::error::{ConvError, ConvResult};

/// Everything needed to fetch (and, on a miss, compile) one kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRequest {
    /// Kernel cache namespace, usually the solver id.
    pub algorithm: String,
    /// Problem-derived key under the algorithm.
    pub network_config: String,
    pub program_name: String,
    pub kernel_name: String,
    pub local: [usize; 3],
    pub global: [usize; 3],
    pub params: String,
    pub is_binary: bool,
}

impl KernelRequest {
    fn program_source(&self) -> ProgramSource {
        ProgramSource {
            name: self.program_name.clone(),
            params: if self.is_binary {
                String::new()
            } else {
                self.params.clone()
            },
            is_binary: self.is_binary,
        }
    }
}

/// Program-cache hit and miss counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub programs: usize,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Program {
    driver: Arc<dyn DeviceDriver>,
    /// Id of the handle whose cache built the program.
    owner: u64,
    id: ProgramId,
    source: ProgramSource,
}

impl Drop for Program {
    fn drop(&mut self) {
        log::trace!("releasing program `{}`", self.source.name);
        self.driver.release_program(self.id);
    }
}

/// A kernel resolved from a cached program with its launch geometry bound.
#[derive(Clone)]
pub struct Kernel {
    program: Arc<Program>,
    function: FunctionId,
    name: String,
    local: [usize; 3],
    global: [usize; 3],
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program_name(&self) -> &str {
        &self.program.source.name
    }

    pub fn local(&self) -> [usize; 3] {
        self.local
    }

    pub fn global(&self) -> [usize; 3] {
        self.global
    }

    fn matches(&self, request: &KernelRequest, source: &ProgramSource) -> bool {
        self.program.source == *source
            && self.name == request.kernel_name
            && self.local == request.local
            && self.global == request.global
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("program", &self.program.source.name)
            .field("name", &self.name)
            .field("local", &self.local)
            .field("global", &self.global)
            .finish()
    }
}

/// A kernel bound to the handle whose queue it launches on.
pub struct KernelInvoke<'h> {
    handle: &'h Handle,
    kernel: Kernel,
}

impl KernelInvoke<'_> {
    /// Enqueues the kernel with `args`.
    pub fn call(&self, args: &[KernelArg]) -> ConvResult<()> {
        self.handle.launch(&self.kernel, args)
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn into_kernel(self) -> Kernel {
        self.kernel
    }
}

type ProgramKey = ProgramSource;
type KernelKey = (String, String);

/// Device context. Owns exactly one queue for its whole lifetime. Kernels
/// fetched from it only launch on it.
pub struct Handle {
    id: u64,
    driver: Arc<dyn DeviceDriver>,
    queue: QueueHandle,
    device: DeviceInfo,
    profiling: AtomicBool,
    kernel_time: Mutex<Duration>,
    programs: Mutex<HashMap<ProgramKey, Arc<Program>>>,
    compile_gates: Mutex<HashMap<ProgramKey, Arc<Mutex<()>>>>,
    kernels: Mutex<HashMap<KernelKey, Vec<Kernel>>>,
    program_hits: AtomicU64,
    program_misses: AtomicU64,
}

impl Handle {
    /// Creates a handle with a fresh queue on `driver`.
    pub fn new(driver: Arc<dyn DeviceDriver>) -> ConvResult<Self> {
        let queue = driver
            .create_queue()
            .map_err(|err| ConvError::no_queue(err.to_string()))?;
        match Self::with_queue(Arc::clone(&driver), queue) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                driver.destroy_queue(queue);
                Err(err)
            }
        }
    }

    /// Adopts `queue`, which the handle destroys when dropped.
    pub fn with_queue(driver: Arc<dyn DeviceDriver>, queue: QueueHandle) -> ConvResult<Self> {
        let device = driver.device_info()?;
        log::debug!(
            "handle on driver `{}` device `{}` ({} CUs)",
            driver.driver_name(),
            device.name,
            device.compute_units
        );
        Ok(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            driver,
            queue,
            device,
            profiling: AtomicBool::new(false),
            kernel_time: Mutex::new(Duration::ZERO),
            programs: Mutex::new(HashMap::new()),
            compile_gates: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            program_hits: AtomicU64::new(0),
            program_misses: AtomicU64::new(0),
        })
    }

    /// Opens the driver registered under `name` and creates a handle on it.
    pub fn from_driver_name(name: &str) -> ConvResult<Self> {
        Self::new(create_driver(name)?)
    }

    /// Uses the driver named by `CONVPLAN_DRIVER` (default `hip`).
    pub fn from_env() -> ConvResult<Self> {
        Self::from_driver_name(&env::driver_name())
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub fn get_stream(&self) -> QueueHandle {
        self.queue
    }

    pub fn enable_profiling(&self, enable: bool) {
        self.profiling.store(enable, Ordering::Relaxed);
    }

    pub fn is_profiling_enabled(&self) -> bool {
        self.profiling.load(Ordering::Relaxed)
    }

    /// Adds `elapsed` to the kernel time. Ignored unless profiling is enabled.
    pub fn accum_kernel_time(&self, elapsed: Duration) {
        if !self.is_profiling_enabled() {
            return;
        }
        let mut total = self
            .kernel_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *total += elapsed;
    }

    pub fn kernel_time(&self) -> Duration {
        *self
            .kernel_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset_kernel_time(&self) {
        *self
            .kernel_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Duration::ZERO;
    }

    /// Returns the kernel described by `request`, compiling its program on a
    /// cache miss, and records it under `(algorithm, network_config)`.
    pub fn get_kernel(&self, request: &KernelRequest) -> ConvResult<KernelInvoke<'_>> {
        let source = request.program_source();
        let key = (request.algorithm.clone(), request.network_config.clone());

        if let Some(found) = lock(&self.kernels, "kernel cache")?
            .get(&key)
            .and_then(|kernels| kernels.iter().find(|k| k.matches(request, &source)))
            .cloned()
        {
            log::trace!("kernel cache hit for {}:{}", key.0, request.kernel_name);
            return Ok(self.bind(found));
        }

        let program = self.program(&source)?;
        let function = self
            .driver
            .get_function(program.id, &request.kernel_name)?;
        let kernel = Kernel {
            program,
            function,
            name: request.kernel_name.clone(),
            local: request.local,
            global: request.global,
        };
        lock(&self.kernels, "kernel cache")?
            .entry(key)
            .or_default()
            .push(kernel.clone());
        Ok(self.bind(kernel))
    }

    /// Kernels previously compiled under `(algorithm, network_config)`, in the
    /// order they were added. Empty when nothing is cached for the key.
    pub fn get_kernels(
        &self,
        algorithm: &str,
        network_config: &str,
    ) -> ConvResult<Vec<KernelInvoke<'_>>> {
        let kernels = lock(&self.kernels, "kernel cache")?;
        Ok(kernels
            .get(&(algorithm.to_string(), network_config.to_string()))
            .map(|found| found.iter().cloned().map(|k| self.bind(k)).collect())
            .unwrap_or_default())
    }

    /// Builds (or fetches from the cache) the program `name` compiled with
    /// `params`.
    pub fn load_program(&self, name: &str, params: &str) -> ConvResult<()> {
        self.program(&ProgramSource {
            name: name.to_string(),
            params: params.to_string(),
            is_binary: false,
        })
        .map(|_| ())
    }

    /// Loads the prebuilt program `name`.
    pub fn load_binary_program(&self, name: &str) -> ConvResult<()> {
        self.program(&ProgramSource {
            name: name.to_string(),
            params: String::new(),
            is_binary: true,
        })
        .map(|_| ())
    }

    pub fn program_cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.program_hits.load(Ordering::Relaxed),
            misses: self.program_misses.load(Ordering::Relaxed),
            programs: self
                .programs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    pub fn finish(&self) -> ConvResult<()> {
        self.driver.finish(self.queue)
    }

    pub fn flush(&self) -> ConvResult<()> {
        self.driver.flush(self.queue)
    }

    pub fn create(&self, bytes: usize) -> ConvResult<DeviceBuffer> {
        let ptr = self.driver.alloc(bytes)?;
        Ok(DeviceBuffer::new(Arc::clone(&self.driver), ptr, bytes))
    }

    pub fn create_zeroed(&self, bytes: usize) -> ConvResult<DeviceBuffer> {
        let buffer = self.create(bytes)?;
        self.write_to(&vec![0u8; bytes], &buffer)?;
        Ok(buffer)
    }

    pub fn write_to(&self, src: &[u8], dst: &DeviceBuffer) -> ConvResult<()> {
        self.check_buffer(dst, src.len(), "write")?;
        self.driver.write(self.queue, dst.device_ptr(), src)
    }

    pub fn read_to(&self, dst: &mut [u8], src: &DeviceBuffer) -> ConvResult<()> {
        self.check_buffer(src, dst.len(), "read")?;
        self.driver.read(self.queue, src.device_ptr(), dst)
    }

    pub fn copy(&self, src: &DeviceBuffer, dst: &DeviceBuffer, bytes: usize) -> ConvResult<()> {
        self.check_buffer(src, bytes, "copy from")?;
        self.check_buffer(dst, bytes, "copy to")?;
        self.driver
            .copy(self.queue, src.device_ptr(), dst.device_ptr(), bytes)
    }

    /// Allocates a buffer holding `data`.
    pub fn write<T: Pod>(&self, data: &[T]) -> ConvResult<DeviceBuffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = self.create(bytes.len())?;
        self.write_to(bytes, &buffer)?;
        Ok(buffer)
    }

    /// Reads the first `len` elements of `src`.
    pub fn read<T: Pod>(&self, src: &DeviceBuffer, len: usize) -> ConvResult<Vec<T>> {
        let mut out = vec![T::zeroed(); len];
        self.read_to(bytemuck::cast_slice_mut(&mut out), src)?;
        Ok(out)
    }

    pub fn get_local_memory_size(&self) -> usize {
        self.device.local_memory_bytes
    }

    pub fn get_max_compute_units(&self) -> usize {
        self.device.compute_units
    }

    pub fn get_device_name(&self) -> &str {
        &self.device.name
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    pub(crate) fn launch(&self, kernel: &Kernel, args: &[KernelArg]) -> ConvResult<()> {
        if kernel.program.owner != self.id {
            return Err(ConvError::launch(
                &kernel.name,
                "kernel belongs to another handle",
            ));
        }
        for dim in 0..3 {
            if kernel.local[dim] == 0 || kernel.global[dim] % kernel.local[dim] != 0 {
                return Err(ConvError::launch(
                    &kernel.name,
                    format!(
                        "global size {:?} is not a multiple of local size {:?}",
                        kernel.global, kernel.local
                    ),
                ));
            }
        }
        let timed = self.is_profiling_enabled();
        let elapsed = self.driver.launch(
            self.queue,
            &Launch {
                function: kernel.function,
                kernel_name: &kernel.name,
                global: kernel.global,
                local: kernel.local,
                args,
                timed,
            },
        )?;
        if let Some(elapsed) = elapsed {
            self.accum_kernel_time(elapsed);
        }
        Ok(())
    }

    fn bind(&self, kernel: Kernel) -> KernelInvoke<'_> {
        KernelInvoke {
            handle: self,
            kernel,
        }
    }

    fn program(&self, source: &ProgramSource) -> ConvResult<Arc<Program>> {
        if let Some(found) = lock(&self.programs, "program cache")?.get(source).cloned() {
            self.program_hits.fetch_add(1, Ordering::Relaxed);
            log::trace!("program cache hit: {}", source.name);
            return Ok(found);
        }

        let gate = {
            let mut gates = lock(&self.compile_gates, "compile gate table")?;
            Arc::clone(
                gates
                    .entry(source.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _gate_lock = lock(&*gate, "compile gate")?;

        if let Some(found) = lock(&self.programs, "program cache")?.get(source).cloned() {
            self.program_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(found);
        }

        self.program_misses.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "building program `{}` (params: `{}`, binary: {})",
            source.name,
            source.params,
            source.is_binary
        );
        let id = self.driver.build_program(source)?;
        let program = Arc::new(Program {
            driver: Arc::clone(&self.driver),
            owner: self.id,
            id,
            source: source.clone(),
        });
        lock(&self.programs, "program cache")?.insert(source.clone(), Arc::clone(&program));
        Ok(program)
    }

    fn check_buffer(&self, buffer: &DeviceBuffer, bytes: usize, what: &str) -> ConvResult<()> {
        if !buffer.belongs_to(&self.driver) {
            return Err(ConvError::device(format!(
                "cannot {what} a buffer allocated by another driver"
            )));
        }
        if bytes > buffer.bytes() {
            return Err(ConvError::device(format!(
                "cannot {what} {bytes} bytes with a {}-byte buffer",
                buffer.bytes()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("driver", &self.driver.driver_name())
            .field("queue", &self.queue)
            .field("device", &self.device.name)
            .finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.kernels
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.programs
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.driver.destroy_queue(self.queue);
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> ConvResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| ConvError::device(format!("{what} mutex poisoned")))
}
