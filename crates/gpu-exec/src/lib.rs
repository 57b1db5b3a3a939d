//! Execution layer for compiled GPU programs.
//!
//! A [`GpuExecutable`] binds its static [`BufferAllocation`]s to device memory for each
//! invocation, resolves constant globals once per device context, runs either a
//! [`ThunkSequence`] or a [`RuntimeGpuExecutable`], and assembles the result while
//! honoring input donation.

pub mod allocation;
pub mod arguments;
pub mod buffer_allocations;
pub mod constants;
pub mod device;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod executable;
pub mod output;
pub mod profile;
pub mod run_options;
pub mod runtime;
pub mod shape;
pub mod thunk;

pub use allocation::{AllocationIndex, AllocationKind, BufferAllocation, Slice};
pub use arguments::{Arguments, ExecutionInput, MaybeOwningDeviceMemory, ShapedBuffer};
pub use buffer_allocations::BufferAllocations;
pub use constants::{ConstantCache, ConstantInfo, ConstantResolver};
pub use device::{
    DeviceMemoryAllocator, DeviceMemoryBase, GpuVersion, OwningDeviceMemory, PlatformKind, Stream,
    StreamBorrower, StreamExecutor,
};
pub use dispatch::ExecutableVariant;
pub use env::DebugOptions;
pub use error::{ErrorCode, ExecError, ExecResult};
pub use executable::{GpuExecutable, GpuExecutableParams};
pub use output::{AliasConfig, AliasKind, ExecutionOutput, OutputInfo, ScopedShapedBuffer};
pub use profile::ExecutionProfile;
pub use run_options::{DeviceAssignment, RunOptions};
pub use runtime::{RuntimeArtifact, RuntimeGpuExecutable, RuntimeProgram};
pub use shape::{PrimitiveType, Shape, ShapeIndex, ShapeTree};
pub use thunk::{Thunk, ThunkInfo, ThunkKind, ThunkSequence};
