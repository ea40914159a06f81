use std::ffi::{c_char, c_void, CString};

use convplan::{ConvError, ConvResult};
use libloading::Library;

type HipError = i32;
pub(crate) type HipStream = *mut c_void;
pub(crate) type HipModule = *mut c_void;
pub(crate) type HipFunction = *mut c_void;
pub(crate) type HipEvent = *mut c_void;

const HIP_SUCCESS: HipError = 0;

pub(crate) const MEMCPY_HOST_TO_DEVICE: i32 = 1;
pub(crate) const MEMCPY_DEVICE_TO_HOST: i32 = 2;
pub(crate) const MEMCPY_DEVICE_TO_DEVICE: i32 = 3;

// hipDeviceAttribute_t numbering of ROCm 5 and later.
pub(crate) const ATTRIBUTE_MULTIPROCESSOR_COUNT: i32 = 63;
pub(crate) const ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK: i32 = 74;

pub(crate) const LAUNCH_PARAM_BUFFER_POINTER: usize = 0x01;
pub(crate) const LAUNCH_PARAM_BUFFER_SIZE: usize = 0x02;
pub(crate) const LAUNCH_PARAM_END: usize = 0x03;

type HipInitFn = unsafe extern "C" fn(flags: u32) -> HipError;
type HipSetDeviceFn = unsafe extern "C" fn(device: i32) -> HipError;
type HipDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attribute: i32, device: i32) -> HipError;
type HipStreamCreateFn = unsafe extern "C" fn(stream: *mut HipStream) -> HipError;
type HipStreamDestroyFn = unsafe extern "C" fn(stream: HipStream) -> HipError;
type HipStreamSynchronizeFn = unsafe extern "C" fn(stream: HipStream) -> HipError;
type HipMallocFn = unsafe extern "C" fn(ptr: *mut *mut c_void, bytes: usize) -> HipError;
type HipFreeFn = unsafe extern "C" fn(ptr: *mut c_void) -> HipError;
type HipMemcpyAsyncFn = unsafe extern "C" fn(
    dst: *mut c_void,
    src: *const c_void,
    bytes: usize,
    kind: i32,
    stream: HipStream,
) -> HipError;
type HipModuleLoadDataFn =
    unsafe extern "C" fn(module: *mut HipModule, image: *const c_void) -> HipError;
type HipModuleUnloadFn = unsafe extern "C" fn(module: HipModule) -> HipError;
type HipModuleGetFunctionFn = unsafe extern "C" fn(
    function: *mut HipFunction,
    module: HipModule,
    name: *const c_char,
) -> HipError;
type HipModuleLaunchKernelFn = unsafe extern "C" fn(
    function: HipFunction,
    grid_x: u32,
    grid_y: u32,
    grid_z: u32,
    block_x: u32,
    block_y: u32,
    block_z: u32,
    shared_mem_bytes: u32,
    stream: HipStream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> HipError;
type HipEventCreateFn = unsafe extern "C" fn(event: *mut HipEvent) -> HipError;
type HipEventDestroyFn = unsafe extern "C" fn(event: HipEvent) -> HipError;
type HipEventRecordFn = unsafe extern "C" fn(event: HipEvent, stream: HipStream) -> HipError;
type HipEventSynchronizeFn = unsafe extern "C" fn(event: HipEvent) -> HipError;
type HipEventElapsedTimeFn =
    unsafe extern "C" fn(ms: *mut f32, start: HipEvent, stop: HipEvent) -> HipError;

struct RuntimeFns {
    hip_init: HipInitFn,
    hip_set_device: HipSetDeviceFn,
    hip_device_get_attribute: HipDeviceGetAttributeFn,
    hip_stream_create: HipStreamCreateFn,
    hip_stream_destroy: HipStreamDestroyFn,
    hip_stream_synchronize: HipStreamSynchronizeFn,
    hip_malloc: HipMallocFn,
    hip_free: HipFreeFn,
    hip_memcpy_async: HipMemcpyAsyncFn,
    hip_module_load_data: HipModuleLoadDataFn,
    hip_module_unload: HipModuleUnloadFn,
    hip_module_get_function: HipModuleGetFunctionFn,
    hip_module_launch_kernel: HipModuleLaunchKernelFn,
    hip_event_create: HipEventCreateFn,
    hip_event_destroy: HipEventDestroyFn,
    hip_event_record: HipEventRecordFn,
    hip_event_synchronize: HipEventSynchronizeFn,
    hip_event_elapsed_time: HipEventElapsedTimeFn,
}

/// Entry points of the HIP runtime library, resolved once.
pub(crate) struct HipRuntime {
    _lib: Library,
    fns: RuntimeFns,
    device: i32,
}

impl HipRuntime {
    pub(crate) fn load(device: i32) -> ConvResult<Self> {
        let lib = load_hip_library()?;
        let fns = RuntimeFns {
            hip_init: load_symbol(&lib, b"hipInit\0")?,
            hip_set_device: load_symbol(&lib, b"hipSetDevice\0")?,
            hip_device_get_attribute: load_symbol(&lib, b"hipDeviceGetAttribute\0")?,
            hip_stream_create: load_symbol(&lib, b"hipStreamCreate\0")?,
            hip_stream_destroy: load_symbol(&lib, b"hipStreamDestroy\0")?,
            hip_stream_synchronize: load_symbol(&lib, b"hipStreamSynchronize\0")?,
            hip_malloc: load_symbol(&lib, b"hipMalloc\0")?,
            hip_free: load_symbol(&lib, b"hipFree\0")?,
            hip_memcpy_async: load_symbol(&lib, b"hipMemcpyAsync\0")?,
            hip_module_load_data: load_symbol(&lib, b"hipModuleLoadData\0")?,
            hip_module_unload: load_symbol(&lib, b"hipModuleUnload\0")?,
            hip_module_get_function: load_symbol(&lib, b"hipModuleGetFunction\0")?,
            hip_module_launch_kernel: load_symbol(&lib, b"hipModuleLaunchKernel\0")?,
            hip_event_create: load_symbol(&lib, b"hipEventCreate\0")?,
            hip_event_destroy: load_symbol(&lib, b"hipEventDestroy\0")?,
            hip_event_record: load_symbol(&lib, b"hipEventRecord\0")?,
            hip_event_synchronize: load_symbol(&lib, b"hipEventSynchronize\0")?,
            hip_event_elapsed_time: load_symbol(&lib, b"hipEventElapsedTime\0")?,
        };
        // SAFETY: plain integer arguments, symbols resolved with their HIP signatures.
        unsafe {
            check_hip((fns.hip_init)(0), "hipInit")?;
            check_hip((fns.hip_set_device)(device), "hipSetDevice")?;
        }
        Ok(Self {
            _lib: lib,
            fns,
            device,
        })
    }

    /// Makes this runtime's device current on the calling thread.
    pub(crate) fn ensure_current(&self) -> ConvResult<()> {
        // SAFETY: integer argument only.
        unsafe { check_hip((self.fns.hip_set_device)(self.device), "hipSetDevice") }
    }

    pub(crate) fn attribute(&self, attribute: i32) -> ConvResult<i32> {
        let mut value = 0;
        // SAFETY: `value` is a valid out pointer.
        unsafe {
            check_hip(
                (self.fns.hip_device_get_attribute)(&mut value, attribute, self.device),
                "hipDeviceGetAttribute",
            )?;
        }
        Ok(value)
    }

    pub(crate) fn stream_create(&self) -> ConvResult<HipStream> {
        self.ensure_current()?;
        let mut stream: HipStream = std::ptr::null_mut();
        // SAFETY: `stream` is a valid out pointer.
        unsafe {
            check_hip((self.fns.hip_stream_create)(&mut stream), "hipStreamCreate")?;
        }
        Ok(stream)
    }

    pub(crate) fn stream_destroy(&self, stream: HipStream) {
        // SAFETY: stream was created by `stream_create` and is destroyed once.
        let _ = unsafe { (self.fns.hip_stream_destroy)(stream) };
    }

    pub(crate) fn stream_synchronize(&self, stream: HipStream) -> ConvResult<()> {
        // SAFETY: stream is live for the duration of the call.
        unsafe {
            check_hip(
                (self.fns.hip_stream_synchronize)(stream),
                "hipStreamSynchronize",
            )
        }
    }

    pub(crate) fn malloc(&self, bytes: usize) -> ConvResult<*mut c_void> {
        self.ensure_current()?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: `ptr` is a valid out pointer.
        unsafe {
            check_hip((self.fns.hip_malloc)(&mut ptr, bytes.max(1)), "hipMalloc")?;
        }
        Ok(ptr)
    }

    pub(crate) fn free(&self, ptr: *mut c_void) {
        // SAFETY: pointer came from `malloc` and is released once.
        let _ = unsafe { (self.fns.hip_free)(ptr) };
    }

    /// Asynchronous copy on `stream`. Callers synchronize before touching
    /// host memory involved in the copy.
    pub(crate) fn memcpy_async(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        bytes: usize,
        kind: i32,
        stream: HipStream,
    ) -> ConvResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        // SAFETY: caller guarantees both ranges are valid for `bytes`.
        unsafe {
            check_hip(
                (self.fns.hip_memcpy_async)(dst, src, bytes, kind, stream),
                "hipMemcpyAsync",
            )
        }
    }

    pub(crate) fn module_load(&self, image: &[u8]) -> ConvResult<HipModule> {
        self.ensure_current()?;
        let mut module: HipModule = std::ptr::null_mut();
        // SAFETY: the image slice outlives the call; HIP copies it.
        unsafe {
            check_hip(
                (self.fns.hip_module_load_data)(&mut module, image.as_ptr() as *const c_void),
                "hipModuleLoadData",
            )?;
        }
        Ok(module)
    }

    pub(crate) fn module_unload(&self, module: HipModule) {
        // SAFETY: module came from `module_load` and is unloaded once.
        let _ = unsafe { (self.fns.hip_module_unload)(module) };
    }

    pub(crate) fn module_get_function(
        &self,
        module: HipModule,
        name: &str,
    ) -> ConvResult<HipFunction> {
        let c_name = CString::new(name)
            .map_err(|_| ConvError::device("kernel name contains NUL byte"))?;
        let mut function: HipFunction = std::ptr::null_mut();
        // SAFETY: module is live, name is NUL-terminated, out pointer is valid.
        unsafe {
            check_hip(
                (self.fns.hip_module_get_function)(&mut function, module, c_name.as_ptr()),
                "hipModuleGetFunction",
            )?;
        }
        Ok(function)
    }

    /// Launches `function` with its arguments packed in `args`.
    pub(crate) fn launch(
        &self,
        function: HipFunction,
        grid: [u32; 3],
        block: [u32; 3],
        stream: HipStream,
        args: &mut [u8],
    ) -> ConvResult<()> {
        let mut size = args.len();
        let mut config: [*mut c_void; 5] = [
            LAUNCH_PARAM_BUFFER_POINTER as *mut c_void,
            args.as_mut_ptr() as *mut c_void,
            LAUNCH_PARAM_BUFFER_SIZE as *mut c_void,
            &mut size as *mut usize as *mut c_void,
            LAUNCH_PARAM_END as *mut c_void,
        ];
        // SAFETY: `config` describes a packed argument buffer that outlives
        // the call; HIP copies the arguments at enqueue time.
        unsafe {
            check_hip(
                (self.fns.hip_module_launch_kernel)(
                    function,
                    grid[0],
                    grid[1],
                    grid[2],
                    block[0],
                    block[1],
                    block[2],
                    0,
                    stream,
                    std::ptr::null_mut(),
                    config.as_mut_ptr(),
                ),
                "hipModuleLaunchKernel",
            )
        }
    }

    pub(crate) fn event_create(&self) -> ConvResult<HipEvent> {
        let mut event: HipEvent = std::ptr::null_mut();
        // SAFETY: `event` is a valid out pointer.
        unsafe {
            check_hip((self.fns.hip_event_create)(&mut event), "hipEventCreate")?;
        }
        Ok(event)
    }

    pub(crate) fn event_destroy(&self, event: HipEvent) {
        // SAFETY: event came from `event_create` and is destroyed once.
        let _ = unsafe { (self.fns.hip_event_destroy)(event) };
    }

    pub(crate) fn event_record(&self, event: HipEvent, stream: HipStream) -> ConvResult<()> {
        // SAFETY: event and stream are live.
        unsafe { check_hip((self.fns.hip_event_record)(event, stream), "hipEventRecord") }
    }

    /// Milliseconds between two recorded events, waiting for `stop`.
    pub(crate) fn event_elapsed_ms(&self, start: HipEvent, stop: HipEvent) -> ConvResult<f32> {
        let mut ms = 0.0f32;
        // SAFETY: both events are live and recorded; `ms` is a valid out pointer.
        unsafe {
            check_hip(
                (self.fns.hip_event_synchronize)(stop),
                "hipEventSynchronize",
            )?;
            check_hip(
                (self.fns.hip_event_elapsed_time)(&mut ms, start, stop),
                "hipEventElapsedTime",
            )?;
        }
        Ok(ms)
    }
}

fn load_hip_library() -> ConvResult<Library> {
    let candidates = [
        "libamdhip64.so",
        "libamdhip64.so.6",
        "libamdhip64.so.5",
        "/opt/rocm/lib/libamdhip64.so",
        "amdhip64.dll",
    ];
    for candidate in candidates {
        // SAFETY: library probe only; no symbols are invoked here.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            log::debug!("loaded HIP runtime from {candidate}");
            return Ok(lib);
        }
    }
    Err(ConvError::driver_unavailable(
        crate::DRIVER_NAME,
        format!("failed to load the HIP runtime (tried {})", candidates.join(", ")),
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> ConvResult<T> {
    // SAFETY: the caller names the symbol with its HIP runtime signature.
    let symbol = unsafe { lib.get::<T>(name) }.map_err(|err| {
        ConvError::driver_unavailable(
            crate::DRIVER_NAME,
            format!(
                "failed to resolve HIP symbol {}: {err}",
                String::from_utf8_lossy(name).trim_end_matches('\0')
            ),
        )
    })?;
    Ok(*symbol)
}

pub(crate) fn check_hip(code: HipError, op: &str) -> ConvResult<()> {
    if code == HIP_SUCCESS {
        Ok(())
    } else {
        Err(ConvError::device(format!(
            "HIP runtime call {op} failed with code {code}"
        )))
    }
}
