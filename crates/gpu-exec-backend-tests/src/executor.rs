use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use gpu_exec::constants::ConstantCache;
use gpu_exec::device::{
    Event, ExecutorId, KernelHandle, LaunchDimensions, ModuleHandle, ModuleSpec,
};
use gpu_exec::{
    DeviceMemoryBase, ExecError, ExecResult, GpuVersion, PlatformKind, Stream, StreamBorrower,
    StreamExecutor,
};

use crate::memory::HostMemory;

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Host implementation of a kernel: receives the memory and the launch arguments.
pub type HostKernel = Arc<dyn Fn(&HostMemory, &[DeviceMemoryBase]) -> ExecResult<()> + Send + Sync>;

struct LoadedModule {
    globals: HashMap<String, DeviceMemoryBase>,
}

/// Device context over [`HostMemory`] with counters for everything tests assert on.
pub struct HostExecutor {
    id: ExecutorId,
    device_ordinal: i32,
    platform_kind: PlatformKind,
    gpu_version: GpuVersion,
    memory: Arc<HostMemory>,
    device_lock: RwLock<()>,
    constant_cache: ConstantCache,
    module_globals: HashMap<String, u64>,
    kernels: HashMap<String, HostKernel>,
    load_delay: Option<Duration>,
    modules: Mutex<HashMap<u64, LoadedModule>>,
    kernel_handles: Mutex<Vec<String>>,
    next_module: AtomicU64,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    synchronizations: AtomicUsize,
}

impl HostExecutor {
    /// A CUDA sm_80 device on `device_ordinal` with its own memory.
    pub fn new(device_ordinal: i32) -> Self {
        Self::with_memory(device_ordinal, Arc::new(HostMemory::new()))
    }

    pub fn with_memory(device_ordinal: i32, memory: Arc<HostMemory>) -> Self {
        Self {
            id: ExecutorId(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed)),
            device_ordinal,
            platform_kind: PlatformKind::Cuda,
            gpu_version: GpuVersion::cuda(8, 0),
            memory,
            device_lock: RwLock::new(()),
            constant_cache: ConstantCache::new(),
            module_globals: HashMap::new(),
            kernels: HashMap::new(),
            load_delay: None,
            modules: Mutex::new(HashMap::new()),
            kernel_handles: Mutex::new(Vec::new()),
            next_module: AtomicU64::new(1),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            synchronizations: AtomicUsize::new(0),
        }
    }

    pub fn with_platform(mut self, platform_kind: PlatformKind, gpu_version: GpuVersion) -> Self {
        self.platform_kind = platform_kind;
        self.gpu_version = gpu_version;
        self
    }

    /// Every loaded module defines a global `name` of `size` bytes.
    pub fn with_module_global(mut self, name: impl Into<String>, size: u64) -> Self {
        self.module_globals.insert(name.into(), size);
        self
    }

    pub fn with_kernel(
        mut self,
        name: impl Into<String>,
        kernel: impl Fn(&HostMemory, &[DeviceMemoryBase]) -> ExecResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.kernels.insert(name.into(), Arc::new(kernel));
        self
    }

    /// Slows module loading down to widen race windows.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn memory(&self) -> &Arc<HostMemory> {
        &self.memory
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.load(Ordering::SeqCst)
    }

    pub fn loaded_modules(&self) -> usize {
        self.modules.lock().expect("module table poisoned").len()
    }

    fn kernel_by_handle(&self, kernel: KernelHandle) -> ExecResult<(String, HostKernel)> {
        let name = self
            .kernel_handles
            .lock()
            .expect("kernel table poisoned")
            .get(kernel.0 as usize)
            .cloned()
            .ok_or_else(|| ExecError::internal(format!("unknown kernel handle {}", kernel.0)))?;
        let function = self
            .kernels
            .get(&name)
            .cloned()
            .ok_or_else(|| ExecError::not_found(format!("kernel {name} is not registered")))?;
        Ok((name, function))
    }
}

impl StreamExecutor for HostExecutor {
    fn id(&self) -> ExecutorId {
        self.id
    }

    fn device_ordinal(&self) -> i32 {
        self.device_ordinal
    }

    fn platform_kind(&self) -> PlatformKind {
        self.platform_kind
    }

    fn gpu_version(&self) -> GpuVersion {
        self.gpu_version.clone()
    }

    fn device_lock(&self) -> &RwLock<()> {
        &self.device_lock
    }

    fn allocate(&self, size: u64) -> ExecResult<DeviceMemoryBase> {
        Ok(self.memory.allocate(size))
    }

    fn deallocate(&self, memory: DeviceMemoryBase) -> ExecResult<()> {
        if self.memory.free(memory.opaque()) {
            Ok(())
        } else {
            Err(ExecError::internal(format!("{memory} was not allocated")))
        }
    }

    fn load_module(&self, spec: &ModuleSpec<'_>) -> ExecResult<ModuleHandle> {
        if spec.binary.is_empty() {
            return Err(ExecError::invalid_argument("cannot load an empty module image"));
        }
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let globals = self
            .module_globals
            .iter()
            .map(|(name, size)| (name.clone(), self.memory.allocate(*size)))
            .collect();
        let handle = self.next_module.fetch_add(1, Ordering::Relaxed);
        self.modules
            .lock()
            .expect("module table poisoned")
            .insert(handle, LoadedModule { globals });
        Ok(ModuleHandle(handle))
    }

    fn unload_module(&self, module: ModuleHandle) -> ExecResult<()> {
        let loaded = self
            .modules
            .lock()
            .expect("module table poisoned")
            .remove(&module.0)
            .ok_or_else(|| ExecError::internal(format!("module {} is not loaded", module.0)))?;
        for global in loaded.globals.values() {
            self.memory.free(global.opaque());
        }
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_symbol(&self, module: ModuleHandle, name: &str) -> ExecResult<Option<DeviceMemoryBase>> {
        let modules = self.modules.lock().expect("module table poisoned");
        let loaded = modules
            .get(&module.0)
            .ok_or_else(|| ExecError::internal(format!("module {} is not loaded", module.0)))?;
        Ok(loaded.globals.get(name).copied())
    }

    fn get_kernel(&self, module: ModuleHandle, name: &str) -> ExecResult<KernelHandle> {
        if !self
            .modules
            .lock()
            .expect("module table poisoned")
            .contains_key(&module.0)
        {
            return Err(ExecError::internal(format!("module {} is not loaded", module.0)));
        }
        if !self.kernels.contains_key(name) {
            return Err(ExecError::not_found(format!("kernel {name} is not in the module")));
        }
        let mut handles = self.kernel_handles.lock().expect("kernel table poisoned");
        handles.push(name.to_string());
        Ok(KernelHandle((handles.len() - 1) as u64))
    }

    fn synchronize_all_activity(&self) -> ExecResult<()> {
        self.synchronizations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn constant_cache(&self) -> &ConstantCache {
        &self.constant_cache
    }
}

/// Operation observed by a [`HostStream`], in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOp {
    HostToDevice { dst: DeviceMemoryBase, len: usize },
    DeviceToDevice { dst: DeviceMemoryBase, src: DeviceMemoryBase, size: u64 },
    DeviceToHost { src: DeviceMemoryBase, len: usize },
    Memzero { dst: DeviceMemoryBase, size: u64 },
    Memset32 { dst: DeviceMemoryBase, pattern: u32, size: u64 },
    Launch { kernel: String, args: Vec<DeviceMemoryBase> },
    RecordEvent,
    WaitEvent,
    BlockHostUntilDone,
}

#[derive(Debug)]
pub struct HostEvent;

impl Event for HostEvent {
    fn is_complete(&self) -> bool {
        true
    }
}

/// A stream that performs every operation immediately and records it.
pub struct HostStream {
    executor: Arc<HostExecutor>,
    ops: Mutex<Vec<StreamOp>>,
    fail_block: AtomicBool,
}

impl HostStream {
    pub fn new(executor: Arc<HostExecutor>) -> Self {
        Self {
            executor,
            ops: Mutex::new(Vec::new()),
            fail_block: AtomicBool::new(false),
        }
    }

    pub fn host_executor(&self) -> &Arc<HostExecutor> {
        &self.executor
    }

    pub fn ops(&self) -> Vec<StreamOp> {
        self.ops.lock().expect("stream log poisoned").clone()
    }

    pub fn count(&self, matches: impl Fn(&StreamOp) -> bool) -> usize {
        self.ops
            .lock()
            .expect("stream log poisoned")
            .iter()
            .filter(|op| matches(op))
            .count()
    }

    /// Makes every following `block_host_until_done` report a device failure.
    pub fn fail_blocks(&self) {
        self.fail_block.store(true, Ordering::SeqCst);
    }

    fn record(&self, op: StreamOp) {
        self.ops.lock().expect("stream log poisoned").push(op);
    }
}

impl Stream for HostStream {
    fn executor(&self) -> Arc<dyn StreamExecutor> {
        self.executor.clone()
    }

    fn memcpy_host_to_device(&self, dst: DeviceMemoryBase, src: &[u8]) -> ExecResult<()> {
        self.record(StreamOp::HostToDevice { dst, len: src.len() });
        self.executor.memory.write(dst, src)
    }

    fn memcpy_device_to_device(
        &self,
        dst: DeviceMemoryBase,
        src: DeviceMemoryBase,
        size: u64,
    ) -> ExecResult<()> {
        self.record(StreamOp::DeviceToDevice { dst, src, size });
        self.executor.memory.copy(dst, src, size)
    }

    fn memcpy_device_to_host(&self, dst: &mut [u8], src: DeviceMemoryBase) -> ExecResult<()> {
        self.record(StreamOp::DeviceToHost { src, len: dst.len() });
        let bytes = self.executor.memory.read(src, dst.len())?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    fn memzero(&self, dst: DeviceMemoryBase, size: u64) -> ExecResult<()> {
        self.record(StreamOp::Memzero { dst, size });
        self.executor.memory.fill(dst, size, &[0])
    }

    fn memset32(&self, dst: DeviceMemoryBase, pattern: u32, size: u64) -> ExecResult<()> {
        self.record(StreamOp::Memset32 { dst, pattern, size });
        self.executor.memory.fill(dst, size, &pattern.to_le_bytes())
    }

    fn launch_kernel(
        &self,
        kernel: KernelHandle,
        _dims: &LaunchDimensions,
        args: &[DeviceMemoryBase],
    ) -> ExecResult<()> {
        let (name, function) = self.executor.kernel_by_handle(kernel)?;
        self.record(StreamOp::Launch {
            kernel: name,
            args: args.to_vec(),
        });
        function(&self.executor.memory, args)
    }

    fn record_event(&self) -> ExecResult<Arc<dyn Event>> {
        self.record(StreamOp::RecordEvent);
        Ok(Arc::new(HostEvent))
    }

    fn wait_for_event(&self, _event: &dyn Event) -> ExecResult<()> {
        self.record(StreamOp::WaitEvent);
        Ok(())
    }

    fn block_host_until_done(&self) -> ExecResult<()> {
        self.record(StreamOp::BlockHostUntilDone);
        if self.fail_block.load(Ordering::SeqCst) {
            return Err(ExecError::unavailable("device reported an illegal address"));
        }
        Ok(())
    }
}

/// Lends fresh [`HostStream`]s on the executor it was created for.
pub struct HostStreamBorrower {
    executor: Arc<HostExecutor>,
    borrowed: Mutex<Vec<Arc<HostStream>>>,
    fail: bool,
}

impl HostStreamBorrower {
    pub fn new(executor: Arc<HostExecutor>) -> Self {
        Self {
            executor,
            borrowed: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// A borrower that has no streams to lend.
    pub fn exhausted(executor: Arc<HostExecutor>) -> Self {
        Self {
            fail: true,
            ..Self::new(executor)
        }
    }

    pub fn borrowed(&self) -> Vec<Arc<HostStream>> {
        self.borrowed.lock().expect("borrower poisoned").clone()
    }
}

impl StreamBorrower for HostStreamBorrower {
    fn borrow_stream(&self, device_ordinal: i32) -> ExecResult<Arc<dyn Stream>> {
        if self.fail {
            return Err(ExecError::unavailable(format!(
                "no stream available on device {device_ordinal}"
            )));
        }
        let stream = Arc::new(HostStream::new(Arc::clone(&self.executor)));
        self.borrowed
            .lock()
            .expect("borrower poisoned")
            .push(Arc::clone(&stream));
        Ok(stream)
    }
}
