use crate::allocation::Slice;
use crate::error::{ExecError, ExecResult};

use super::{ExecuteParams, Thunk, ThunkInfo, ThunkKind};

pub struct DeviceToDeviceCopyThunk {
    info: ThunkInfo,
    source: Slice,
    destination: Slice,
    size: u64,
}

impl DeviceToDeviceCopyThunk {
    pub fn new(info: ThunkInfo, source: Slice, destination: Slice, size: u64) -> Self {
        Self {
            info,
            source,
            destination,
            size,
        }
    }
}

impl Thunk for DeviceToDeviceCopyThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Copy
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ThunkInfo {
        &mut self.info
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        let source = params.buffer_allocations.slice_address(&self.source)?;
        let destination = params.buffer_allocations.slice_address(&self.destination)?;
        if self.size > source.size() || self.size > destination.size() {
            return Err(ExecError::internal(format!(
                "copy of {} bytes does not fit source ({}) or destination ({})",
                self.size,
                source.size(),
                destination.size()
            )));
        }
        params
            .stream
            .memcpy_device_to_device(destination, source, self.size)
    }
}

pub struct MemzeroThunk {
    info: ThunkInfo,
    destination: Slice,
}

impl MemzeroThunk {
    pub fn new(info: ThunkInfo, destination: Slice) -> Self {
        Self { info, destination }
    }
}

impl Thunk for MemzeroThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Memzero
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ThunkInfo {
        &mut self.info
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        let destination = params.buffer_allocations.slice_address(&self.destination)?;
        params.stream.memzero(destination, destination.size())
    }
}

/// Fills a buffer with a repeated 32-bit pattern.
pub struct Memset32Thunk {
    info: ThunkInfo,
    value: u32,
    destination: Slice,
}

impl Memset32Thunk {
    pub fn new(info: ThunkInfo, value: u32, destination: Slice) -> Self {
        Self {
            info,
            value,
            destination,
        }
    }
}

impl Thunk for Memset32Thunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Memset32
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ThunkInfo {
        &mut self.info
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        let destination = params.buffer_allocations.slice_address(&self.destination)?;
        if destination.size() % 4 != 0 {
            return Err(ExecError::internal(format!(
                "memset32 destination of {} bytes is not a multiple of 4",
                destination.size()
            )));
        }
        params
            .stream
            .memset32(destination, self.value, destination.size())
    }
}
