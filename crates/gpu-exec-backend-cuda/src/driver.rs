use std::ffi::{c_char, c_void, CString};
use std::sync::{Arc, OnceLock};

use gpu_exec::{ExecError, ExecResult};
use libloading::Library;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
const CUDA_ERROR_NOT_FOUND: CUresult = 500;

const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: i32 = 76;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attribute: i32, dev: CUdevice) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSynchronizeFn = unsafe extern "C" fn() -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemsetD8V2Fn =
    unsafe extern "C" fn(dst_device: CUdeviceptr, value: u8, count: usize) -> CUresult;
type CuMemsetD32V2Fn =
    unsafe extern "C" fn(dst_device: CUdeviceptr, value: u32, count: usize) -> CUresult;
type CuModuleLoadDataExFn = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: u32,
    options: *mut u32,
    option_values: *mut *mut c_void,
) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetGlobalV2Fn = unsafe extern "C" fn(
    dptr: *mut CUdeviceptr,
    bytes: *mut usize,
    hmod: CUmodule,
    name: *const c_char,
) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const c_char) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_get_attribute: CuDeviceGetAttributeFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_ctx_synchronize: CuCtxSynchronizeFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_memcpy_dto_d_v2: CuMemcpyDtoDV2Fn,
    cu_memset_d8_v2: CuMemsetD8V2Fn,
    cu_memset_d32_v2: CuMemsetD32V2Fn,
    cu_module_load_data_ex: CuModuleLoadDataExFn,
    cu_module_unload: CuModuleUnloadFn,
    cu_module_get_global_v2: CuModuleGetGlobalV2Fn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_launch_kernel: CuLaunchKernelFn,
}

/// One CUDA context on device 0, driven through the dynamically loaded driver library.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    // Stored as usize so CudaDriver can satisfy Send/Sync requirements for executor traits.
    ctx: usize,
    compute_capability: (u32, u32),
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: `ctx` came from cuCtxCreate_v2 in `new` and is zeroed after this call.
            let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

pub fn driver() -> ExecResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(ExecError::failed_precondition(format!(
            "CUDA driver unavailable: {msg}"
        ))),
    }
}

impl CudaDriver {
    fn new() -> ExecResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_attribute: load_symbol(&lib, b"cuDeviceGetAttribute\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_ctx_synchronize: load_symbol(&lib, b"cuCtxSynchronize\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_memcpy_dto_d_v2: load_symbol(&lib, b"cuMemcpyDtoD_v2\0")?,
            cu_memset_d8_v2: load_symbol(&lib, b"cuMemsetD8_v2\0")?,
            cu_memset_d32_v2: load_symbol(&lib, b"cuMemsetD32_v2\0")?,
            cu_module_load_data_ex: load_symbol(&lib, b"cuModuleLoadDataEx\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_global_v2: load_symbol(&lib, b"cuModuleGetGlobal_v2\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
        };

        // SAFETY: every symbol was resolved against its driver prototype; out-params are locals.
        unsafe {
            check_cuda((fns.cu_init)(0), "cuInit")?;
            let mut dev: CUdevice = 0;
            check_cuda(
                (fns.cu_device_get)(&mut dev as *mut CUdevice, 0),
                "cuDeviceGet",
            )?;
            let mut major = 0i32;
            let mut minor = 0i32;
            check_cuda(
                (fns.cu_device_get_attribute)(
                    &mut major as *mut i32,
                    CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
                    dev,
                ),
                "cuDeviceGetAttribute",
            )?;
            check_cuda(
                (fns.cu_device_get_attribute)(
                    &mut minor as *mut i32,
                    CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
                    dev,
                ),
                "cuDeviceGetAttribute",
            )?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda(
                (fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                "cuCtxCreate_v2",
            )?;
            check_cuda((fns.cu_ctx_set_current)(ctx), "cuCtxSetCurrent")?;
            log::debug!("created CUDA context on device 0 (sm_{major}{minor})");
            Ok(Self {
                _lib: lib,
                fns,
                ctx: ctx as usize,
                compute_capability: (major.max(0) as u32, minor.max(0) as u32),
            })
        }
    }

    pub fn context_id(&self) -> u64 {
        self.ctx as u64
    }

    pub fn compute_capability(&self) -> (u32, u32) {
        self.compute_capability
    }

    pub fn alloc(&self, bytes: u64) -> ExecResult<u64> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a live local the driver writes the new address into.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, to_usize(bytes)?),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(ptr)
    }

    pub fn free(&self, ptr: u64) -> ExecResult<()> {
        self.ensure_current()?;
        // SAFETY: executors only free addresses they got from `alloc` on this context.
        unsafe { check_cuda((self.fns.cu_mem_free_v2)(ptr), "cuMemFree_v2") }
    }

    pub fn upload(&self, dst: u64, bytes: &[u8]) -> ExecResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: the stream checked `dst` holds `bytes.len()`; the slice outlives the blocking copy.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_hto_d_v2)(dst, bytes.as_ptr() as *const c_void, bytes.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    pub fn download(&self, out: &mut [u8], src: u64) -> ExecResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: the stream checked `src` holds `out.len()`; `out` is borrowed mutably for the copy.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_dto_h_v2)(out.as_mut_ptr() as *mut c_void, src, out.len()),
                "cuMemcpyDtoH_v2",
            )
        }
    }

    pub fn copy_device_to_device(&self, dst: u64, src: u64, bytes: u64) -> ExecResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: both regions were bounds-checked by the stream against `bytes`.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_dto_d_v2)(dst, src, to_usize(bytes)?),
                "cuMemcpyDtoD_v2",
            )
        }
    }

    pub fn memset_d8(&self, dst: u64, value: u8, bytes: u64) -> ExecResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: the stream checked `dst` holds `bytes`.
        unsafe {
            check_cuda(
                (self.fns.cu_memset_d8_v2)(dst, value, to_usize(bytes)?),
                "cuMemsetD8_v2",
            )
        }
    }

    pub fn memset_d32(&self, dst: u64, value: u32, words: u64) -> ExecResult<()> {
        if words == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: the stream checked `dst` holds `words * 4` bytes.
        unsafe {
            check_cuda(
                (self.fns.cu_memset_d32_v2)(dst, value, to_usize(words)?),
                "cuMemsetD32_v2",
            )
        }
    }

    /// Loads a cubin image, or NUL-terminated PTX when `image` came from text.
    pub fn load_module(&self, image: &[u8]) -> ExecResult<u64> {
        self.ensure_current()?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: the image is borrowed for the call and no JIT options are passed.
        unsafe {
            check_cuda(
                (self.fns.cu_module_load_data_ex)(
                    &mut module as *mut CUmodule,
                    image.as_ptr() as *const c_void,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                ),
                "cuModuleLoadDataEx",
            )?;
        }
        Ok(module as u64)
    }

    pub fn load_ptx_module(&self, ptx: &str) -> ExecResult<u64> {
        let c_ptx = CString::new(ptx)
            .map_err(|_| ExecError::invalid_argument("ptx source contains NUL byte"))?;
        self.load_module(c_ptx.as_bytes_with_nul())
    }

    pub fn unload_module(&self, module: u64) -> ExecResult<()> {
        self.ensure_current()?;
        // SAFETY: handles reach here only from `load_module` and are unloaded by a single owner.
        unsafe { check_cuda((self.fns.cu_module_unload)(module as CUmodule), "cuModuleUnload") }
    }

    /// Address and size of a module global, `None` if the module does not define it.
    pub fn module_global(&self, module: u64, name: &str) -> ExecResult<Option<(u64, u64)>> {
        self.ensure_current()?;
        let c_name = CString::new(name)
            .map_err(|_| ExecError::invalid_argument("global symbol contains NUL byte"))?;
        let mut ptr: CUdeviceptr = 0;
        let mut bytes = 0usize;
        // SAFETY: `c_name` is NUL-terminated and the out-params are locals.
        let code = unsafe {
            (self.fns.cu_module_get_global_v2)(
                &mut ptr as *mut CUdeviceptr,
                &mut bytes as *mut usize,
                module as CUmodule,
                c_name.as_ptr(),
            )
        };
        if code == CUDA_ERROR_NOT_FOUND {
            return Ok(None);
        }
        check_cuda(code, "cuModuleGetGlobal_v2")?;
        Ok(Some((ptr, bytes as u64)))
    }

    pub fn get_function(&self, module: u64, symbol: &str) -> ExecResult<u64> {
        self.ensure_current()?;
        let c_symbol = CString::new(symbol)
            .map_err(|_| ExecError::invalid_argument("kernel symbol contains NUL byte"))?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: `c_symbol` is NUL-terminated and the out-params are locals.
        unsafe {
            check_cuda(
                (self.fns.cu_module_get_function)(
                    &mut function as *mut CUfunction,
                    module as CUmodule,
                    c_symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }
        Ok(function as u64)
    }

    /// Launches on the legacy default stream with one device pointer per parameter.
    pub fn launch_kernel(
        &self,
        function: u64,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        shared_mem_bytes: u32,
        args: &[u64],
    ) -> ExecResult<()> {
        self.ensure_current()?;
        let mut values = args.to_vec();
        let mut params: Vec<*mut c_void> = values
            .iter_mut()
            .map(|value| value as *mut u64 as *mut c_void)
            .collect();
        // SAFETY: `params` points into `values`, which lives until cuLaunchKernel returns.
        unsafe {
            check_cuda(
                (self.fns.cu_launch_kernel)(
                    function as CUfunction,
                    grid.0,
                    grid.1,
                    grid.2,
                    block.0,
                    block.1,
                    block.2,
                    shared_mem_bytes,
                    std::ptr::null_mut(),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        }
    }

    pub fn synchronize(&self) -> ExecResult<()> {
        self.ensure_current()?;
        // SAFETY: takes no pointers; `ensure_current` ran first.
        unsafe { check_cuda((self.fns.cu_ctx_synchronize)(), "cuCtxSynchronize") }
    }

    pub fn ensure_current(&self) -> ExecResult<()> {
        // SAFETY: `ctx` stays valid while `self` is alive.
        unsafe {
            check_cuda(
                (self.fns.cu_ctx_set_current)(self.ctx_ptr()),
                "cuCtxSetCurrent",
            )
        }
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }
}

fn load_cuda_library() -> ExecResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: opening libcuda runs no initializers beyond the loader's own.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(ExecError::failed_precondition(
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> ExecResult<T> {
    // SAFETY: each call site names the typedef matching the exported prototype.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        ExecError::failed_precondition(format!(
            "failed to resolve CUDA symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn to_usize(bytes: u64) -> ExecResult<usize> {
    usize::try_from(bytes)
        .map_err(|_| ExecError::invalid_argument(format!("{bytes} bytes do not fit in usize")))
}

fn check_cuda(code: CUresult, op: &str) -> ExecResult<()> {
    match code {
        CUDA_SUCCESS => Ok(()),
        CUDA_ERROR_OUT_OF_MEMORY => Err(ExecError::resource_exhausted(format!(
            "CUDA driver call {op} ran out of device memory"
        ))),
        _ => Err(ExecError::internal(format!(
            "CUDA driver call {op} failed with code {code}"
        ))),
    }
}
