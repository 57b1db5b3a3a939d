use crate::allocation::Slice;
use crate::error::{ExecError, ExecResult};

use super::{ExecuteParams, InitializeParams, Thunk, ThunkInfo, ThunkKind, ThunkSequence};

/// Runs a nested sequence as a single step.
pub struct SequentialThunk {
    info: ThunkInfo,
    thunks: ThunkSequence,
}

impl SequentialThunk {
    pub fn new(info: ThunkInfo, thunks: ThunkSequence) -> Self {
        Self { info, thunks }
    }
}

impl Thunk for SequentialThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Sequential
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ThunkInfo {
        &mut self.info
    }

    fn initialize(&self, params: &InitializeParams<'_>) -> ExecResult<()> {
        self.thunks.initialize(params)
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        self.thunks.execute(params)
    }

    fn nested_sequences(&self) -> Vec<&ThunkSequence> {
        vec![&self.thunks]
    }

    fn nested_sequences_mut(&mut self) -> Vec<&mut ThunkSequence> {
        vec![&mut self.thunks]
    }
}

/// Runs one of several branches, chosen by a value computed on device.
///
/// A `pred` selector picks branch 0 when true and branch 1 when false. An `s32` selector
/// outside `[0, branches)` picks the last branch.
pub struct ConditionalThunk {
    info: ThunkInfo,
    branch_index_is_bool: bool,
    branch_index: Slice,
    branches: Vec<ThunkSequence>,
}

impl ConditionalThunk {
    pub fn new(
        info: ThunkInfo,
        branch_index_is_bool: bool,
        branch_index: Slice,
        branches: Vec<ThunkSequence>,
    ) -> ExecResult<Self> {
        if branches.is_empty() {
            return Err(ExecError::internal("conditional thunk needs at least one branch"));
        }
        if branch_index_is_bool && branches.len() != 2 {
            return Err(ExecError::internal(format!(
                "predicated conditional needs exactly 2 branches, got {}",
                branches.len()
            )));
        }
        Ok(Self {
            info,
            branch_index_is_bool,
            branch_index,
            branches,
        })
    }

    fn selected_branch(&self, params: &ExecuteParams<'_>) -> ExecResult<usize> {
        let source = params
            .buffer_allocations
            .slice_address(&self.branch_index)?;
        if self.branch_index_is_bool {
            let mut pred = [0u8; 1];
            params.stream.memcpy_device_to_host(&mut pred, source)?;
            return Ok(if pred[0] != 0 { 0 } else { 1 });
        }
        let mut raw = [0u8; 4];
        params.stream.memcpy_device_to_host(&mut raw, source)?;
        let index = i32::from_ne_bytes(raw);
        let last = self.branches.len() - 1;
        Ok(usize::try_from(index)
            .ok()
            .filter(|&i| i <= last)
            .unwrap_or(last))
    }
}

impl Thunk for ConditionalThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Conditional
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ThunkInfo {
        &mut self.info
    }

    fn initialize(&self, params: &InitializeParams<'_>) -> ExecResult<()> {
        for branch in &self.branches {
            branch.initialize(params)?;
        }
        Ok(())
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        let branch = self.selected_branch(params)?;
        log::trace!("{}: taking branch {branch}", self.info.profile_annotation);
        self.branches[branch].execute(params)
    }

    fn nested_sequences(&self) -> Vec<&ThunkSequence> {
        self.branches.iter().collect()
    }

    fn nested_sequences_mut(&mut self) -> Vec<&mut ThunkSequence> {
        self.branches.iter_mut().collect()
    }
}

/// Repeats a body while a device-computed predicate holds.
///
/// With a known trip count the condition is not evaluated.
pub struct WhileThunk {
    info: ThunkInfo,
    condition_result: Slice,
    condition: ThunkSequence,
    body: ThunkSequence,
    trip_count: Option<u64>,
}

impl WhileThunk {
    pub fn new(
        info: ThunkInfo,
        condition_result: Slice,
        condition: ThunkSequence,
        body: ThunkSequence,
    ) -> Self {
        Self {
            info,
            condition_result,
            condition,
            body,
            trip_count: None,
        }
    }

    pub fn with_trip_count(mut self, trip_count: u64) -> Self {
        self.trip_count = Some(trip_count);
        self
    }
}

impl Thunk for WhileThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::While
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ThunkInfo {
        &mut self.info
    }

    fn initialize(&self, params: &InitializeParams<'_>) -> ExecResult<()> {
        self.condition.initialize(params)?;
        self.body.initialize(params)
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        if let Some(trip_count) = self.trip_count {
            for _ in 0..trip_count {
                self.body.execute(params)?;
            }
            return Ok(());
        }

        let predicate = params
            .buffer_allocations
            .slice_address(&self.condition_result)?;
        let mut iteration = 0u64;
        loop {
            self.condition.execute(params)?;
            let mut result = [0u8; 1];
            params.stream.memcpy_device_to_host(&mut result, predicate)?;
            if result[0] == 0 {
                break;
            }
            self.body.execute(params)?;
            iteration += 1;
        }
        log::trace!(
            "{}: finished after {iteration} iterations",
            self.info.profile_annotation
        );
        Ok(())
    }

    fn nested_sequences(&self) -> Vec<&ThunkSequence> {
        vec![&self.condition, &self.body]
    }

    fn nested_sequences_mut(&mut self) -> Vec<&mut ThunkSequence> {
        vec![&mut self.condition, &mut self.body]
    }
}

/// Runs a body a fixed number of times.
pub struct ForThunk {
    info: ThunkInfo,
    loop_limit: u64,
    body: ThunkSequence,
}

impl ForThunk {
    pub fn new(info: ThunkInfo, loop_limit: u64, body: ThunkSequence) -> Self {
        Self {
            info,
            loop_limit,
            body,
        }
    }
}

impl Thunk for ForThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::For
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ThunkInfo {
        &mut self.info
    }

    fn initialize(&self, params: &InitializeParams<'_>) -> ExecResult<()> {
        self.body.initialize(params)
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        for _ in 0..self.loop_limit {
            self.body.execute(params)?;
        }
        Ok(())
    }

    fn nested_sequences(&self) -> Vec<&ThunkSequence> {
        vec![&self.body]
    }

    fn nested_sequences_mut(&mut self) -> Vec<&mut ThunkSequence> {
        vec![&mut self.body]
    }
}
