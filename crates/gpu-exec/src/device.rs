use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::constants::ConstantCache;
use crate::error::{ExecError, ExecResult};

/// Untyped device address plus the size of the region behind it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceMemoryBase {
    opaque: u64,
    size: u64,
}

impl DeviceMemoryBase {
    pub const fn new(opaque: u64, size: u64) -> Self {
        Self { opaque, size }
    }

    pub const fn null() -> Self {
        Self { opaque: 0, size: 0 }
    }

    pub fn is_null(&self) -> bool {
        self.opaque == 0
    }

    pub fn opaque(&self) -> u64 {
        self.opaque
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Sub-region starting `offset` bytes into this one.
    pub fn sub_region(&self, offset: u64, size: u64) -> ExecResult<Self> {
        if offset.checked_add(size).map_or(true, |end| end > self.size) {
            return Err(ExecError::internal(format!(
                "sub-region [{offset}, {offset}+{size}) exceeds buffer of {} bytes at {:#x}",
                self.size, self.opaque
            )));
        }
        if self.is_null() {
            return Ok(Self::null());
        }
        Ok(Self::new(self.opaque + offset, size))
    }
}

impl fmt::Display for DeviceMemoryBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} ({} bytes)", self.opaque, self.size)
    }
}

/// Device memory allocator used for per-invocation buffers.
pub trait DeviceMemoryAllocator: Send + Sync {
    /// Allocates `size` bytes on `device_ordinal`. A zero-sized request may return null.
    fn allocate_raw(&self, device_ordinal: i32, size: u64) -> ExecResult<DeviceMemoryBase>;

    fn deallocate(&self, device_ordinal: i32, memory: DeviceMemoryBase) -> ExecResult<()>;

    /// Whether buffers may be freed while work that uses them is still queued.
    fn allows_asynchronous_deallocation(&self) -> bool;
}

/// Allocates through `allocator` and wraps the result so it is freed on drop.
pub fn allocate_owned(
    allocator: &Arc<dyn DeviceMemoryAllocator>,
    device_ordinal: i32,
    size: u64,
) -> ExecResult<OwningDeviceMemory> {
    let memory = allocator.allocate_raw(device_ordinal, size)?;
    Ok(OwningDeviceMemory::new(
        memory,
        device_ordinal,
        Arc::clone(allocator),
    ))
}

/// Device memory that is returned to its allocator when dropped.
pub struct OwningDeviceMemory {
    memory: DeviceMemoryBase,
    device_ordinal: i32,
    allocator: Arc<dyn DeviceMemoryAllocator>,
}

impl OwningDeviceMemory {
    pub fn new(
        memory: DeviceMemoryBase,
        device_ordinal: i32,
        allocator: Arc<dyn DeviceMemoryAllocator>,
    ) -> Self {
        Self {
            memory,
            device_ordinal,
            allocator,
        }
    }

    pub fn as_device_memory(&self) -> DeviceMemoryBase {
        self.memory
    }

    pub fn device_ordinal(&self) -> i32 {
        self.device_ordinal
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceMemoryAllocator> {
        &self.allocator
    }

    /// Gives up ownership; the caller becomes responsible for freeing the address.
    pub fn release(mut self) -> DeviceMemoryBase {
        std::mem::take(&mut self.memory)
    }

    /// Frees now and reports the allocator's result.
    pub fn free(mut self) -> ExecResult<()> {
        let memory = std::mem::take(&mut self.memory);
        if memory.is_null() {
            return Ok(());
        }
        self.allocator.deallocate(self.device_ordinal, memory)
    }
}

impl fmt::Debug for OwningDeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwningDeviceMemory")
            .field("memory", &self.memory)
            .field("device_ordinal", &self.device_ordinal)
            .finish()
    }
}

impl Drop for OwningDeviceMemory {
    fn drop(&mut self) {
        if self.memory.is_null() {
            return;
        }
        if let Err(err) = self.allocator.deallocate(self.device_ordinal, self.memory) {
            log::warn!("failed to free device buffer {}: {err}", self.memory);
        }
    }
}

/// Stable identity of a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutorId(pub u64);

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformKind {
    Cuda,
    Rocm,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CudaComputeCapability {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RocmComputeCapability {
    pub gcn_arch_name: String,
}

/// Architecture a program was compiled for, or that a device reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GpuVersion {
    Cuda(CudaComputeCapability),
    Rocm(RocmComputeCapability),
}

impl GpuVersion {
    pub fn cuda(major: u32, minor: u32) -> Self {
        GpuVersion::Cuda(CudaComputeCapability { major, minor })
    }

    pub fn rocm(gcn_arch_name: impl Into<String>) -> Self {
        GpuVersion::Rocm(RocmComputeCapability {
            gcn_arch_name: gcn_arch_name.into(),
        })
    }
}

impl fmt::Display for GpuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuVersion::Cuda(cc) => write!(f, "sm_{}{}", cc.major, cc.minor),
            GpuVersion::Rocm(cc) => write!(f, "{}", cc.gcn_arch_name),
        }
    }
}

/// Images handed to the driver when loading a module.
#[derive(Debug, Clone, Copy)]
pub struct ModuleSpec<'a> {
    pub binary: &'a [u8],
    pub text: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDimensions {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchDimensions {
    pub fn linear(blocks: u32, threads_per_block: u32) -> Self {
        Self {
            grid: (blocks, 1, 1),
            block: (threads_per_block, 1, 1),
            shared_mem_bytes: 0,
        }
    }
}

/// A device context: memory, modules and the device-wide reader/writer lock.
pub trait StreamExecutor: Send + Sync {
    fn id(&self) -> ExecutorId;

    fn device_ordinal(&self) -> i32;

    fn platform_kind(&self) -> PlatformKind;

    fn gpu_version(&self) -> GpuVersion;

    /// Shared side for executions, exclusive side for device-wide maintenance.
    fn device_lock(&self) -> &RwLock<()>;

    /// Raw allocation for memory owned by a program rather than an invocation.
    fn allocate(&self, size: u64) -> ExecResult<DeviceMemoryBase>;

    fn deallocate(&self, memory: DeviceMemoryBase) -> ExecResult<()>;

    fn load_module(&self, spec: &ModuleSpec<'_>) -> ExecResult<ModuleHandle>;

    fn unload_module(&self, module: ModuleHandle) -> ExecResult<()>;

    /// Address of a global defined by a loaded module, `None` if the module has no such symbol.
    fn get_symbol(&self, module: ModuleHandle, name: &str) -> ExecResult<Option<DeviceMemoryBase>>;

    fn get_kernel(&self, module: ModuleHandle, name: &str) -> ExecResult<KernelHandle>;

    fn synchronize_all_activity(&self) -> ExecResult<()>;

    /// Content-addressed cache of program constants allocated on this context.
    fn constant_cache(&self) -> &ConstantCache;
}

/// Completion marker recorded on a stream.
pub trait Event: Send + Sync {
    fn is_complete(&self) -> bool;
}

/// Ordered queue of device work.
pub trait Stream: Send + Sync {
    fn executor(&self) -> Arc<dyn StreamExecutor>;

    /// Implementations must finish reading `src` before returning.
    fn memcpy_host_to_device(&self, dst: DeviceMemoryBase, src: &[u8]) -> ExecResult<()>;

    fn memcpy_device_to_device(
        &self,
        dst: DeviceMemoryBase,
        src: DeviceMemoryBase,
        size: u64,
    ) -> ExecResult<()>;

    /// Completes before returning; `dst.len()` bytes are read from `src`.
    fn memcpy_device_to_host(&self, dst: &mut [u8], src: DeviceMemoryBase) -> ExecResult<()>;

    fn memzero(&self, dst: DeviceMemoryBase, size: u64) -> ExecResult<()>;

    fn memset32(&self, dst: DeviceMemoryBase, pattern: u32, size: u64) -> ExecResult<()>;

    fn launch_kernel(
        &self,
        kernel: KernelHandle,
        dims: &LaunchDimensions,
        args: &[DeviceMemoryBase],
    ) -> ExecResult<()>;

    fn record_event(&self) -> ExecResult<Arc<dyn Event>>;

    fn wait_for_event(&self, event: &dyn Event) -> ExecResult<()>;

    fn block_host_until_done(&self) -> ExecResult<()>;
}

/// Lends auxiliary streams, e.g. for asynchronous collectives.
pub trait StreamBorrower: Send + Sync {
    fn borrow_stream(&self, device_ordinal: i32) -> ExecResult<Arc<dyn Stream>>;
}

pub fn lock_device_shared(executor: &dyn StreamExecutor) -> ExecResult<RwLockReadGuard<'_, ()>> {
    let ordinal = executor.device_ordinal();
    executor
        .device_lock()
        .read()
        .map_err(|_| ExecError::internal(format!("device {ordinal} lock poisoned")))
}

pub fn lock_device_exclusive(
    executor: &dyn StreamExecutor,
) -> ExecResult<RwLockWriteGuard<'_, ()>> {
    let ordinal = executor.device_ordinal();
    executor
        .device_lock()
        .write()
        .map_err(|_| ExecError::internal(format!("device {ordinal} lock poisoned")))
}
