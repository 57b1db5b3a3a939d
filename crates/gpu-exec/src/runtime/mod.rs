//! Runtime programs: compiled entry points invoked through a flat call frame.

mod artifact;
mod caches;
mod call_frame;

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

pub use artifact::{EntryArgument, EntryLayout, EntrySignature, RuntimeArtifact};
pub use caches::{
    AsyncCollectiveSupport, CollectiveSupport, GemmConfig, GemmConfigCache, KernelsCache, Uid,
};
pub use call_frame::{CallFrame, MemrefDesc, UserData, SLOTS_PER_ALLOCATION};

use crate::allocation::BufferAllocation;
use crate::buffer_allocations::BufferAllocations;
use crate::device::DeviceMemoryBase;
use crate::env::DebugOptions;
use crate::error::{lock_named, ExecError, ExecResult};
use crate::run_options::RunOptions;

/// Serialized module plus the statically known size of every buffer it takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeProgram {
    pub entry_point: String,
    pub module: String,
    pub buffer_sizes: Vec<u64>,
    #[serde(default)]
    pub debug_options: DebugOptions,
}

/// A compiled entry point.
pub trait RuntimeExecutable: Send + Sync {
    fn execute(&self, call_frame: &mut CallFrame, user_data: &UserData<'_>) -> ExecResult<()>;

    /// Object file the entry point can be reloaded from, if it can be serialized.
    fn obj_file(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Compiles a [`RuntimeProgram`] just in time.
pub trait RuntimeCompiler: Send + Sync {
    fn compile(&self, program: &RuntimeProgram) -> ExecResult<Arc<dyn RuntimeExecutable>>;
}

/// Links an ahead-of-time compiled object file.
pub trait RuntimeLoader: Send + Sync {
    fn load(
        &self,
        entry_point: &str,
        obj_file: &[u8],
        buffer_sizes: &[u64],
    ) -> ExecResult<Arc<dyn RuntimeExecutable>>;
}

/// Code-generation outputs made available to custom-call handlers.
#[derive(Debug, Clone)]
pub struct ExecutableArtifacts {
    pub text: Arc<str>,
    pub binary: Arc<[u8]>,
}

/// The preallocated scratch buffer; null when the program has none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TempBuffer(pub DeviceMemoryBase);

enum Compiled {
    Jit {
        compiler: Arc<dyn RuntimeCompiler>,
        executable: Mutex<Option<Arc<dyn RuntimeExecutable>>>,
    },
    Aot {
        executable: Arc<dyn RuntimeExecutable>,
        obj_file: Vec<u8>,
    },
}

/// Runtime program of an executable together with its per-uid caches.
pub struct RuntimeGpuExecutable {
    program: RuntimeProgram,
    compiled: Compiled,
    gemm_configs: GemmConfigCache,
    kernels: KernelsCache,
    collectives: CollectiveSupport,
}

impl RuntimeGpuExecutable {
    /// Compiled on first execution.
    pub fn jit(program: RuntimeProgram, compiler: Arc<dyn RuntimeCompiler>) -> Self {
        Self::with_compiled(
            program,
            Compiled::Jit {
                compiler,
                executable: Mutex::new(None),
            },
        )
    }

    pub fn aot(
        program: RuntimeProgram,
        executable: Arc<dyn RuntimeExecutable>,
        obj_file: Vec<u8>,
    ) -> Self {
        Self::with_compiled(program, Compiled::Aot { executable, obj_file })
    }

    fn with_compiled(program: RuntimeProgram, compiled: Compiled) -> Self {
        Self {
            program,
            compiled,
            gemm_configs: GemmConfigCache::default(),
            kernels: KernelsCache::default(),
            collectives: CollectiveSupport::default(),
        }
    }

    pub fn program(&self) -> &RuntimeProgram {
        &self.program
    }

    pub fn buffer_sizes(&self) -> &[u64] {
        &self.program.buffer_sizes
    }

    pub fn debug_options(&self) -> &DebugOptions {
        &self.program.debug_options
    }

    pub fn gemm_configs(&self) -> &GemmConfigCache {
        &self.gemm_configs
    }

    pub fn kernels_cache(&self) -> &KernelsCache {
        &self.kernels
    }

    pub fn collectives(&self) -> &CollectiveSupport {
        &self.collectives
    }

    pub fn executable(&self) -> ExecResult<Arc<dyn RuntimeExecutable>> {
        match &self.compiled {
            Compiled::Aot { executable, .. } => Ok(Arc::clone(executable)),
            Compiled::Jit {
                compiler,
                executable,
            } => {
                let mut slot = lock_named(executable, "runtime executable")?;
                if let Some(found) = slot.as_ref() {
                    return Ok(Arc::clone(found));
                }
                log::debug!("compiling runtime program {}", self.program.entry_point);
                let compiled = compiler.compile(&self.program)?;
                *slot = Some(Arc::clone(&compiled));
                Ok(compiled)
            }
        }
    }

    pub fn obj_file(&self) -> ExecResult<Vec<u8>> {
        match &self.compiled {
            Compiled::Aot { obj_file, .. } => Ok(obj_file.clone()),
            Compiled::Jit { .. } => self.executable()?.obj_file().ok_or_else(|| {
                ExecError::internal(format!(
                    "runtime program {} has no object file",
                    self.program.entry_point
                ))
            }),
        }
    }

    /// Invokes the entry point with every bound buffer as a rank-1 memref.
    pub fn execute(
        &self,
        run_options: &RunOptions,
        buffer_allocations: &BufferAllocations,
        temp_buffer: Option<&BufferAllocation>,
        artifacts: &ExecutableArtifacts,
    ) -> ExecResult<()> {
        if self.program.buffer_sizes.len() != buffer_allocations.len() {
            return Err(ExecError::internal(format!(
                "runtime program {} expects {} buffers but {} are bound",
                self.program.entry_point,
                self.program.buffer_sizes.len(),
                buffer_allocations.len()
            )));
        }
        let executable = self.executable()?;
        let mut call_frame =
            CallFrame::new(buffer_allocations.addresses(), &self.program.buffer_sizes);

        // Each run gets its own events so concurrent runs do not observe each other.
        let async_collectives = run_options
            .stream_borrower
            .as_ref()
            .and_then(|borrower| borrower.borrow_stream(run_options.device_ordinal()).ok())
            .map(AsyncCollectiveSupport::new);

        // Passed even when null so zero-sized scratch is handled uniformly.
        let temp = TempBuffer(
            temp_buffer
                .map(|allocation| buffer_allocations.device_address(allocation.index()))
                .unwrap_or_default(),
        );

        let mut user_data = UserData::new();
        user_data.insert(self);
        user_data.insert(run_options);
        user_data.insert(&self.program.debug_options);
        user_data.insert(artifacts);
        user_data.insert(&temp);
        user_data.insert(&self.kernels);
        user_data.insert(&self.gemm_configs);
        user_data.insert(&self.collectives);
        if let Some(async_collectives) = async_collectives.as_ref() {
            user_data.insert(async_collectives);
        }

        log::trace!(
            "invoking runtime program {} with {} call frame slots",
            self.program.entry_point,
            call_frame.args().len()
        );
        executable
            .execute(&mut call_frame, &user_data)
            .map_err(|err| {
                err.with_context(&format!(
                    "failed to execute runtime program {}",
                    self.program.entry_point
                ))
            })
    }
}

impl fmt::Debug for RuntimeGpuExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.compiled {
            Compiled::Jit { .. } => "jit",
            Compiled::Aot { .. } => "aot",
        };
        f.debug_struct("RuntimeGpuExecutable")
            .field("entry_point", &self.program.entry_point)
            .field("buffers", &self.program.buffer_sizes.len())
            .field("mode", &mode)
            .finish()
    }
}
