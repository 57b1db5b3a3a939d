use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::allocation::BufferAllocation;
use crate::buffer_allocations::BufferAllocations;
use crate::device::{Stream, StreamExecutor};
use crate::env::DebugOptions;
use crate::error::{ExecError, ExecResult};
use crate::run_options::RunOptions;
use crate::runtime::{ExecutableArtifacts, RuntimeGpuExecutable};
use crate::thunk::{ExecuteParams, InitializeParams, ThunkSequence};

/// The execution strategy of a program, fixed when it is loaded.
pub enum ExecutableVariant {
    Thunks(ThunkSequence),
    Runtime(RuntimeGpuExecutable),
}

impl ExecutableVariant {
    /// Picks the strategy from what compilation produced.
    ///
    /// When both are present the runtime program wins only if enabled in `options`.
    pub fn select(
        thunks: Option<ThunkSequence>,
        runtime: Option<RuntimeGpuExecutable>,
        options: &DebugOptions,
    ) -> ExecResult<Self> {
        match (thunks, runtime) {
            (Some(_), Some(runtime)) if options.enable_runtime_executable => {
                Ok(ExecutableVariant::Runtime(runtime))
            }
            (Some(thunks), _) => Ok(ExecutableVariant::Thunks(thunks)),
            (None, Some(runtime)) => Ok(ExecutableVariant::Runtime(runtime)),
            (None, None) => Err(ExecError::failed_precondition(
                "expected a thunk sequence or a runtime program, but neither was supplied",
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutableVariant::Thunks(_) => "thunks",
            ExecutableVariant::Runtime(_) => "runtime",
        }
    }

    pub fn thunks(&self) -> Option<&ThunkSequence> {
        match self {
            ExecutableVariant::Thunks(thunks) => Some(thunks),
            ExecutableVariant::Runtime(_) => None,
        }
    }

    pub fn runtime(&self) -> Option<&RuntimeGpuExecutable> {
        match self {
            ExecutableVariant::Runtime(runtime) => Some(runtime),
            ExecutableVariant::Thunks(_) => None,
        }
    }
}

impl fmt::Debug for ExecutableVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutableVariant::Thunks(thunks) => f
                .debug_struct("Thunks")
                .field("len", &thunks.len())
                .finish(),
            ExecutableVariant::Runtime(runtime) => f.debug_tuple("Runtime").field(runtime).finish(),
        }
    }
}

/// Everything the dispatcher needs for one invocation.
pub(crate) struct Dispatch<'a> {
    pub run_options: &'a RunOptions,
    pub buffer_allocations: &'a BufferAllocations,
    pub allocations: &'a [BufferAllocation],
    pub artifacts: &'a ExecutableArtifacts,
    pub block_host_until_done: bool,
}

impl Dispatch<'_> {
    pub(crate) fn run(&self, variant: &ExecutableVariant) -> ExecResult<()> {
        let start = Instant::now();
        match variant {
            ExecutableVariant::Thunks(thunks) => self.run_thunks(thunks)?,
            ExecutableVariant::Runtime(runtime) => {
                let temp_buffer = self
                    .allocations
                    .iter()
                    .find(|allocation| allocation.is_preallocated_temp_buffer());
                runtime.execute(
                    self.run_options,
                    self.buffer_allocations,
                    temp_buffer,
                    self.artifacts,
                )?;
            }
        }
        let stream_to_sync = self
            .block_host_until_done
            .then_some(self.run_options.stream.as_ref());
        maybe_sync_and_profile(self.run_options, start, stream_to_sync)
    }

    fn run_thunks(&self, thunks: &ThunkSequence) -> ExecResult<()> {
        let executor: Arc<dyn StreamExecutor> = self.run_options.stream.executor();
        thunks.initialize(&InitializeParams {
            executor: &executor,
            binary: &self.artifacts.binary,
            text: &self.artifacts.text,
        })?;

        // Only collectives that need it get an auxiliary stream; its absence
        // is reported by the thunk that needs it.
        let async_comms_stream = if thunks.needs_async_comms_stream() {
            self.borrow_async_comms_stream(executor.device_ordinal())
        } else {
            None
        };

        let params = ExecuteParams {
            run_options: self.run_options,
            stream: self.run_options.stream.as_ref(),
            async_comms_stream: async_comms_stream.as_deref(),
            buffer_allocations: self.buffer_allocations,
        };
        thunks.execute(&params)
    }

    fn borrow_async_comms_stream(&self, device_ordinal: i32) -> Option<Arc<dyn Stream>> {
        let borrower = self.run_options.stream_borrower.as_ref()?;
        match borrower.borrow_stream(device_ordinal) {
            Ok(stream) => Some(stream),
            Err(err) => {
                log::warn!("failed to borrow async comms stream for device {device_ordinal}: {err}");
                None
            }
        }
    }
}

/// Blocks on `stream_to_sync` if given, then reports the elapsed time to the profile sink.
pub(crate) fn maybe_sync_and_profile(
    run_options: &RunOptions,
    start: Instant,
    stream_to_sync: Option<&dyn Stream>,
) -> ExecResult<()> {
    if let Some(stream) = stream_to_sync {
        stream.block_host_until_done().map_err(|err| {
            ExecError::internal(format!(
                "Failed to complete all kernels launched on stream: {err}"
            ))
        })?;
    }
    if let Some(profile) = run_options.execution_profile.as_ref() {
        profile.record_since(start);
    }
    Ok(())
}
