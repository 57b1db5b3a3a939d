//! Pre-scheduled device operations and the sequences that hold them.

mod control_flow;
mod kernel;
mod memory;

use std::sync::Arc;

pub use control_flow::{ConditionalThunk, ForThunk, SequentialThunk, WhileThunk};
pub use kernel::KernelThunk;
pub use memory::{DeviceToDeviceCopyThunk, Memset32Thunk, MemzeroThunk};

use crate::buffer_allocations::BufferAllocations;
use crate::device::{Stream, StreamExecutor};
use crate::error::{ExecError, ExecResult};
use crate::run_options::RunOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThunkKind {
    Kernel,
    Copy,
    Memzero,
    Memset32,
    Sequential,
    Conditional,
    While,
    For,
    /// Thunks supplied from outside this crate.
    CustomCall,
    NcclAllReduceStart,
    NcclAllReduceDone,
}

impl ThunkKind {
    /// Collectives that run on the auxiliary stream and sync through events.
    pub fn needs_async_comms_stream(self) -> bool {
        matches!(
            self,
            ThunkKind::NcclAllReduceStart | ThunkKind::NcclAllReduceDone
        )
    }
}

/// Compile-time description shared by every thunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThunkInfo {
    pub profile_annotation: String,
    /// Source operation this thunk was emitted for; only needed while compiling.
    pub op_name: Option<String>,
}

impl ThunkInfo {
    pub fn new(profile_annotation: impl Into<String>) -> Self {
        Self {
            profile_annotation: profile_annotation.into(),
            op_name: None,
        }
    }

    pub fn with_op_name(mut self, op_name: impl Into<String>) -> Self {
        self.op_name = Some(op_name.into());
        self
    }
}

/// What a thunk may touch while preparing itself for an executor.
pub struct InitializeParams<'a> {
    pub executor: &'a Arc<dyn StreamExecutor>,
    pub binary: &'a [u8],
    pub text: &'a str,
}

/// What a thunk may touch while running.
pub struct ExecuteParams<'a> {
    pub run_options: &'a RunOptions,
    pub stream: &'a dyn Stream,
    pub async_comms_stream: Option<&'a dyn Stream>,
    pub buffer_allocations: &'a BufferAllocations,
}

impl<'a> ExecuteParams<'a> {
    pub fn async_comms_stream(&self) -> ExecResult<&'a dyn Stream> {
        self.async_comms_stream.ok_or_else(|| {
            ExecError::internal("run options must have a stream borrower for async thunks")
        })
    }
}

/// A self-contained device operation.
pub trait Thunk: Send + Sync {
    fn kind(&self) -> ThunkKind;

    fn info(&self) -> &ThunkInfo;

    fn info_mut(&mut self) -> &mut ThunkInfo;

    fn profile_annotation(&self) -> &str {
        &self.info().profile_annotation
    }

    /// Prepares per-executor state. Must be idempotent for a given executor.
    fn initialize(&self, _params: &InitializeParams<'_>) -> ExecResult<()> {
        Ok(())
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()>;

    fn nested_sequences(&self) -> Vec<&ThunkSequence> {
        Vec::new()
    }

    fn nested_sequences_mut(&mut self) -> Vec<&mut ThunkSequence> {
        Vec::new()
    }

    fn clear_compile_time_info(&mut self) {
        self.info_mut().op_name = None;
    }
}

/// Thunks in program order.
#[derive(Default)]
pub struct ThunkSequence {
    thunks: Vec<Box<dyn Thunk>>,
}

impl ThunkSequence {
    pub fn new(thunks: Vec<Box<dyn Thunk>>) -> Self {
        Self { thunks }
    }

    pub fn push(&mut self, thunk: Box<dyn Thunk>) {
        self.thunks.push(thunk);
    }

    pub fn len(&self) -> usize {
        self.thunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Thunk> {
        self.thunks.iter().map(|thunk| thunk.as_ref())
    }

    /// Every thunk in the tree, depth-first, each container before its contents.
    pub fn flatten(&self) -> Vec<&dyn Thunk> {
        fn visit<'a>(sequence: &'a ThunkSequence, out: &mut Vec<&'a dyn Thunk>) {
            for thunk in &sequence.thunks {
                out.push(thunk.as_ref());
                for nested in thunk.nested_sequences() {
                    visit(nested, out);
                }
            }
        }
        let mut out = Vec::new();
        visit(self, &mut out);
        out
    }

    pub fn needs_async_comms_stream(&self) -> bool {
        self.flatten()
            .iter()
            .any(|thunk| thunk.kind().needs_async_comms_stream())
    }

    pub fn initialize(&self, params: &InitializeParams<'_>) -> ExecResult<()> {
        for thunk in &self.thunks {
            thunk.initialize(params)?;
        }
        Ok(())
    }

    /// Runs every thunk in order, stopping at the first error.
    pub fn execute(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        for thunk in &self.thunks {
            if thunk.kind().needs_async_comms_stream() {
                params.async_comms_stream()?;
            }
            log::trace!("executing thunk {}", thunk.profile_annotation());
            thunk.execute_on_stream(params)?;
        }
        Ok(())
    }

    /// Drops compile-time-only state from every thunk in the tree.
    pub fn clear_compile_time_info(&mut self) {
        let mut worklist: Vec<&mut ThunkSequence> = vec![self];
        while let Some(sequence) = worklist.pop() {
            for thunk in sequence.thunks.iter_mut() {
                thunk.clear_compile_time_info();
                worklist.extend(thunk.nested_sequences_mut());
            }
        }
    }
}

impl FromIterator<Box<dyn Thunk>> for ThunkSequence {
    fn from_iter<I: IntoIterator<Item = Box<dyn Thunk>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
