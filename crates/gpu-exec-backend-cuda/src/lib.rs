//! CUDA driver backend for gpu-exec.
//!
//! The driver library is opened at run time, so this crate builds and links on machines
//! without CUDA; [`is_available`] reports whether a context could be created.

mod driver;

use std::sync::{Arc, RwLock};

use gpu_exec::constants::ConstantCache;
use gpu_exec::device::{
    Event, ExecutorId, KernelHandle, LaunchDimensions, ModuleHandle, ModuleSpec,
};
use gpu_exec::{
    DeviceMemoryAllocator, DeviceMemoryBase, ExecError, ExecResult, GpuVersion, PlatformKind,
    RunOptions, Stream, StreamBorrower, StreamExecutor,
};

use crate::driver::CudaDriver;

pub fn is_available() -> bool {
    driver::is_available()
}

/// The process-wide CUDA context on device 0.
pub struct CudaExecutor {
    driver: Arc<CudaDriver>,
    device_lock: RwLock<()>,
    constant_cache: ConstantCache,
}

impl CudaExecutor {
    pub fn new() -> ExecResult<Self> {
        Ok(Self {
            driver: driver::driver()?,
            device_lock: RwLock::new(()),
            constant_cache: ConstantCache::new(),
        })
    }
}

impl StreamExecutor for CudaExecutor {
    fn id(&self) -> ExecutorId {
        ExecutorId(self.driver.context_id())
    }

    fn device_ordinal(&self) -> i32 {
        0
    }

    fn platform_kind(&self) -> PlatformKind {
        PlatformKind::Cuda
    }

    fn gpu_version(&self) -> GpuVersion {
        let (major, minor) = self.driver.compute_capability();
        GpuVersion::cuda(major, minor)
    }

    fn device_lock(&self) -> &RwLock<()> {
        &self.device_lock
    }

    fn allocate(&self, size: u64) -> ExecResult<DeviceMemoryBase> {
        if size == 0 {
            return Ok(DeviceMemoryBase::null());
        }
        Ok(DeviceMemoryBase::new(self.driver.alloc(size)?, size))
    }

    fn deallocate(&self, memory: DeviceMemoryBase) -> ExecResult<()> {
        if memory.is_null() {
            return Ok(());
        }
        self.driver.free(memory.opaque())
    }

    fn load_module(&self, spec: &ModuleSpec<'_>) -> ExecResult<ModuleHandle> {
        let module = if !spec.binary.is_empty() {
            self.driver.load_module(spec.binary)?
        } else if !spec.text.is_empty() {
            self.driver.load_ptx_module(spec.text)?
        } else {
            return Err(ExecError::invalid_argument(
                "module has neither a cubin nor PTX text",
            ));
        };
        log::debug!("loaded CUDA module {module:#x}");
        Ok(ModuleHandle(module))
    }

    fn unload_module(&self, module: ModuleHandle) -> ExecResult<()> {
        self.driver.unload_module(module.0)
    }

    fn get_symbol(&self, module: ModuleHandle, name: &str) -> ExecResult<Option<DeviceMemoryBase>> {
        Ok(self
            .driver
            .module_global(module.0, name)?
            .map(|(address, size)| DeviceMemoryBase::new(address, size)))
    }

    fn get_kernel(&self, module: ModuleHandle, name: &str) -> ExecResult<KernelHandle> {
        Ok(KernelHandle(self.driver.get_function(module.0, name)?))
    }

    fn synchronize_all_activity(&self) -> ExecResult<()> {
        self.driver.synchronize()
    }

    fn constant_cache(&self) -> &ConstantCache {
        &self.constant_cache
    }
}

/// Work already finished when the event was recorded.
#[derive(Debug)]
pub struct CompletedEvent;

impl Event for CompletedEvent {
    fn is_complete(&self) -> bool {
        true
    }
}

/// The legacy default stream of the executor's context.
///
/// Every operation is ordered with every other one on the context, so events are recorded by
/// synchronizing and waiting on them is a no-op.
pub struct CudaStream {
    executor: Arc<CudaExecutor>,
}

impl CudaStream {
    pub fn new(executor: Arc<CudaExecutor>) -> Self {
        Self { executor }
    }

    fn driver(&self) -> &CudaDriver {
        &self.executor.driver
    }
}

impl Stream for CudaStream {
    fn executor(&self) -> Arc<dyn StreamExecutor> {
        self.executor.clone()
    }

    fn memcpy_host_to_device(&self, dst: DeviceMemoryBase, src: &[u8]) -> ExecResult<()> {
        check_fits(dst, src.len() as u64, "host-to-device copy")?;
        self.driver().upload(dst.opaque(), src)
    }

    fn memcpy_device_to_device(
        &self,
        dst: DeviceMemoryBase,
        src: DeviceMemoryBase,
        size: u64,
    ) -> ExecResult<()> {
        check_fits(dst, size, "device-to-device copy")?;
        check_fits(src, size, "device-to-device copy")?;
        self.driver()
            .copy_device_to_device(dst.opaque(), src.opaque(), size)
    }

    fn memcpy_device_to_host(&self, dst: &mut [u8], src: DeviceMemoryBase) -> ExecResult<()> {
        check_fits(src, dst.len() as u64, "device-to-host copy")?;
        self.driver().download(dst, src.opaque())
    }

    fn memzero(&self, dst: DeviceMemoryBase, size: u64) -> ExecResult<()> {
        check_fits(dst, size, "memzero")?;
        self.driver().memset_d8(dst.opaque(), 0, size)
    }

    fn memset32(&self, dst: DeviceMemoryBase, pattern: u32, size: u64) -> ExecResult<()> {
        check_fits(dst, size, "memset32")?;
        if size % 4 != 0 {
            return Err(ExecError::invalid_argument(format!(
                "memset32 size {size} is not a multiple of 4"
            )));
        }
        self.driver().memset_d32(dst.opaque(), pattern, size / 4)
    }

    fn launch_kernel(
        &self,
        kernel: KernelHandle,
        dims: &LaunchDimensions,
        args: &[DeviceMemoryBase],
    ) -> ExecResult<()> {
        let pointers: Vec<u64> = args.iter().map(DeviceMemoryBase::opaque).collect();
        self.driver().launch_kernel(
            kernel.0,
            dims.grid,
            dims.block,
            dims.shared_mem_bytes,
            &pointers,
        )
    }

    fn record_event(&self) -> ExecResult<Arc<dyn Event>> {
        self.driver().synchronize()?;
        Ok(Arc::new(CompletedEvent))
    }

    fn wait_for_event(&self, _event: &dyn Event) -> ExecResult<()> {
        Ok(())
    }

    fn block_host_until_done(&self) -> ExecResult<()> {
        self.driver().synchronize()
    }
}

/// Lends the default stream; it is the only one this backend drives.
pub struct CudaStreamBorrower {
    executor: Arc<CudaExecutor>,
}

impl CudaStreamBorrower {
    pub fn new(executor: Arc<CudaExecutor>) -> Self {
        Self { executor }
    }
}

impl StreamBorrower for CudaStreamBorrower {
    fn borrow_stream(&self, device_ordinal: i32) -> ExecResult<Arc<dyn Stream>> {
        if device_ordinal != self.executor.device_ordinal() {
            return Err(ExecError::invalid_argument(format!(
                "no CUDA stream on device {device_ordinal}"
            )));
        }
        Ok(Arc::new(CudaStream::new(Arc::clone(&self.executor))))
    }
}

/// Allocates straight from the driver. Frees are immediate, so deallocation is synchronous.
pub struct CudaAllocator {
    executor: Arc<CudaExecutor>,
}

impl CudaAllocator {
    pub fn new(executor: Arc<CudaExecutor>) -> Self {
        Self { executor }
    }
}

impl DeviceMemoryAllocator for CudaAllocator {
    fn allocate_raw(&self, device_ordinal: i32, size: u64) -> ExecResult<DeviceMemoryBase> {
        check_ordinal(&self.executor, device_ordinal)?;
        self.executor.allocate(size)
    }

    fn deallocate(&self, device_ordinal: i32, memory: DeviceMemoryBase) -> ExecResult<()> {
        check_ordinal(&self.executor, device_ordinal)?;
        self.executor.deallocate(memory)
    }

    fn allows_asynchronous_deallocation(&self) -> bool {
        false
    }
}

/// Executor, default stream and allocator for device 0, wired together.
pub struct CudaDevice {
    pub executor: Arc<CudaExecutor>,
    pub stream: Arc<CudaStream>,
    pub allocator: Arc<CudaAllocator>,
}

impl CudaDevice {
    pub fn new() -> ExecResult<Self> {
        let executor = Arc::new(CudaExecutor::new()?);
        Ok(Self {
            stream: Arc::new(CudaStream::new(Arc::clone(&executor))),
            allocator: Arc::new(CudaAllocator::new(Arc::clone(&executor))),
            executor,
        })
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions::new(self.stream.clone(), self.allocator.clone())
    }

    pub fn borrower(&self) -> Arc<dyn StreamBorrower> {
        Arc::new(CudaStreamBorrower::new(Arc::clone(&self.executor)))
    }
}

fn check_ordinal(executor: &CudaExecutor, device_ordinal: i32) -> ExecResult<()> {
    if device_ordinal == executor.device_ordinal() {
        Ok(())
    } else {
        Err(ExecError::invalid_argument(format!(
            "CUDA allocator serves device {} but device {device_ordinal} was requested",
            executor.device_ordinal()
        )))
    }
}

fn check_fits(memory: DeviceMemoryBase, size: u64, op: &str) -> ExecResult<()> {
    if size > memory.size() {
        return Err(ExecError::internal(format!(
            "{op} of {size} bytes exceeds buffer {memory}"
        )));
    }
    Ok(())
}
