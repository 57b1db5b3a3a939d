//! Host-memory device and recording fixtures shared by the gpu-exec test suites.

pub mod allocator;
pub mod executor;
pub mod fixtures;
pub mod memory;
pub mod recording;

pub use allocator::HostAllocator;
pub use executor::{HostEvent, HostExecutor, HostKernel, HostStream, HostStreamBorrower, StreamOp};
pub use fixtures::{
    aliased_parameter_program, bytes_to_int32, fresh_output_program, host_gpu_version, int32_bytes,
    s32_vector, shaped_buffer, HostDevice,
};
pub use memory::HostMemory;
pub use recording::{
    logged, thunk_log, RecordingExecutable, RecordingRuntime, RecordingThunk, RuntimeInvocation,
    ThunkLog,
};
