use std::sync::Arc;

use gpu_exec::device::allocate_owned;
use gpu_exec::{
    AliasConfig, AliasKind, AllocationKind, BufferAllocation, DeviceMemoryAllocator,
    DeviceMemoryBase, ExecResult, GpuExecutableParams, GpuVersion, OutputInfo,
    OwningDeviceMemory, PrimitiveType, RunOptions, Shape, ShapeIndex, ShapeTree, ShapedBuffer,
    StreamBorrower, ThunkSequence,
};

use crate::allocator::HostAllocator;
use crate::executor::{HostExecutor, HostStream, HostStreamBorrower};
use crate::memory::HostMemory;

/// One host device: executor, main stream and allocator sharing the same memory.
pub struct HostDevice {
    pub memory: Arc<HostMemory>,
    pub executor: Arc<HostExecutor>,
    pub stream: Arc<HostStream>,
    pub allocator: Arc<HostAllocator>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::build(|executor| executor, |allocator| allocator)
    }

    /// Customizes the executor and allocator before they are shared.
    pub fn build(
        executor: impl FnOnce(HostExecutor) -> HostExecutor,
        allocator: impl FnOnce(HostAllocator) -> HostAllocator,
    ) -> Self {
        let memory = Arc::new(HostMemory::new());
        let executor = Arc::new(executor(HostExecutor::with_memory(0, Arc::clone(&memory))));
        let stream = Arc::new(HostStream::new(Arc::clone(&executor)));
        let allocator = Arc::new(allocator(HostAllocator::new(Arc::clone(&memory))));
        Self {
            memory,
            executor,
            stream,
            allocator,
        }
    }

    pub fn allocator_dyn(&self) -> Arc<dyn DeviceMemoryAllocator> {
        self.allocator.clone()
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions::new(self.stream.clone(), self.allocator_dyn())
    }

    pub fn borrower(&self) -> Arc<dyn StreamBorrower> {
        Arc::new(HostStreamBorrower::new(Arc::clone(&self.executor)))
    }

    /// Allocates through the device allocator and fills the buffer with `bytes`.
    pub fn upload(&self, bytes: &[u8]) -> ExecResult<OwningDeviceMemory> {
        let buffer = allocate_owned(&self.allocator_dyn(), 0, bytes.len() as u64)?;
        self.memory.write(buffer.as_device_memory(), bytes)?;
        Ok(buffer)
    }

    pub fn download(&self, memory: DeviceMemoryBase) -> ExecResult<Vec<u8>> {
        self.memory.read(memory, memory.size() as usize)
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

pub fn int32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub fn bytes_to_int32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Caller buffer with every index of `shape` at `memory`; meant for array shapes.
pub fn shaped_buffer(shape: Shape, memory: DeviceMemoryBase) -> ShapedBuffer {
    ShapedBuffer::from_tree(ShapeTree::from_fn(shape, |_| memory), 0)
}

pub fn s32_vector(len: u64) -> Shape {
    Shape::array(PrimitiveType::S32, &[len])
}

/// Architecture the host executor reports by default.
pub fn host_gpu_version() -> GpuVersion {
    GpuVersion::cuda(8, 0)
}

/// `s32[4]` parameter 0 aliased by the output with `kind`, plus a 16-byte temp.
pub fn aliased_parameter_program(kind: AliasKind) -> GpuExecutableParams {
    GpuExecutableParams::new("aliased_parameter", host_gpu_version(), s32_vector(4))
        .with_allocations(vec![
            BufferAllocation::entry_parameter(0, 16, 0, ShapeIndex::root(), true),
            BufferAllocation::new(1, 16, AllocationKind::Temp),
        ])
        .with_output(
            ShapeIndex::root(),
            OutputInfo::new(0).with_alias(AliasConfig::new(0, ShapeIndex::root(), kind)),
        )
        .with_thunks(ThunkSequence::default())
}

/// Parameter 0 feeds a freshly allocated `s32[4]` output through a temp; no constants.
pub fn fresh_output_program() -> GpuExecutableParams {
    GpuExecutableParams::new("fresh_output", host_gpu_version(), s32_vector(4))
        .with_allocations(vec![
            BufferAllocation::entry_parameter(0, 16, 0, ShapeIndex::root(), false),
            BufferAllocation::new(1, 16, AllocationKind::Temp),
            BufferAllocation::new(2, 16, AllocationKind::MaybeLiveOut),
        ])
        .with_output(ShapeIndex::root(), OutputInfo::new(2))
        .with_thunks(ThunkSequence::default())
}
