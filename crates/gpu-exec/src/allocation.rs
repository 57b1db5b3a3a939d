use std::fmt;

use crate::shape::ShapeIndex;

/// Alignment the caller must guarantee for entry parameter buffers.
pub const ENTRY_PARAMETER_ALIGN_BYTES: u64 = 16;
/// Alignment of buffers allocated by the execution layer.
pub const ALLOCATED_BUFFER_ALIGN_BYTES: u64 = 64;
/// Alignment of constant globals.
pub const CONSTANT_BUFFER_ALIGN_BYTES: u64 = 64;

pub type AllocationIndex = usize;

/// Role of a [`BufferAllocation`]; each allocation has exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Lives in thread-local storage of a kernel; never materialized.
    ThreadLocal,
    /// A (sub)buffer of a caller-supplied parameter.
    EntryParameter {
        parameter_number: usize,
        parameter_shape_index: ShapeIndex,
        /// The parameter may be returned as (part of) the output.
        maybe_live_out: bool,
    },
    /// A constant global resolved once per device context.
    Constant,
    /// Scratch space freed at the end of each invocation.
    Temp,
    /// Freshly allocated per invocation and possibly returned in the result.
    MaybeLiveOut,
}

/// One compile-time-fixed memory region a program needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferAllocation {
    index: AllocationIndex,
    size: u64,
    kind: AllocationKind,
}

impl BufferAllocation {
    pub fn new(index: AllocationIndex, size: u64, kind: AllocationKind) -> Self {
        Self { index, size, kind }
    }

    pub fn entry_parameter(
        index: AllocationIndex,
        size: u64,
        parameter_number: usize,
        parameter_shape_index: impl Into<ShapeIndex>,
        maybe_live_out: bool,
    ) -> Self {
        Self::new(
            index,
            size,
            AllocationKind::EntryParameter {
                parameter_number,
                parameter_shape_index: parameter_shape_index.into(),
                maybe_live_out,
            },
        )
    }

    pub fn index(&self) -> AllocationIndex {
        self.index
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> &AllocationKind {
        &self.kind
    }

    pub fn is_thread_local(&self) -> bool {
        matches!(self.kind, AllocationKind::ThreadLocal)
    }

    pub fn is_entry_computation_parameter(&self) -> bool {
        matches!(self.kind, AllocationKind::EntryParameter { .. })
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, AllocationKind::Constant)
    }

    /// Scratch region handed to kernels and runtime programs as the temp buffer.
    pub fn is_preallocated_temp_buffer(&self) -> bool {
        matches!(self.kind, AllocationKind::Temp)
    }

    pub fn maybe_live_out(&self) -> bool {
        match &self.kind {
            AllocationKind::MaybeLiveOut => true,
            AllocationKind::EntryParameter { maybe_live_out, .. } => *maybe_live_out,
            _ => false,
        }
    }

    pub fn parameter(&self) -> Option<(usize, &ShapeIndex)> {
        match &self.kind {
            AllocationKind::EntryParameter {
                parameter_number,
                parameter_shape_index,
                ..
            } => Some((*parameter_number, parameter_shape_index)),
            _ => None,
        }
    }

    /// Allocated fresh from the run's allocator on every invocation.
    pub fn is_allocated_per_invocation(&self) -> bool {
        matches!(self.kind, AllocationKind::Temp | AllocationKind::MaybeLiveOut)
    }

    pub fn expected_alignment(&self) -> u64 {
        match self.kind {
            AllocationKind::EntryParameter { .. } => ENTRY_PARAMETER_ALIGN_BYTES,
            AllocationKind::Constant => CONSTANT_BUFFER_ALIGN_BYTES,
            _ => ALLOCATED_BUFFER_ALIGN_BYTES,
        }
    }
}

impl fmt::Display for BufferAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation {}: size {}", self.index, self.size)?;
        match &self.kind {
            AllocationKind::ThreadLocal => write!(f, ", thread-local"),
            AllocationKind::EntryParameter {
                parameter_number,
                parameter_shape_index,
                maybe_live_out,
            } => {
                write!(
                    f,
                    ", parameter {parameter_number}, shape index {parameter_shape_index}"
                )?;
                if *maybe_live_out {
                    write!(f, ", maybe-live-out")?;
                }
                Ok(())
            }
            AllocationKind::Constant => write!(f, ", constant"),
            AllocationKind::Temp => write!(f, ", preallocated-temp"),
            AllocationKind::MaybeLiveOut => write!(f, ", maybe-live-out"),
        }
    }
}

/// Byte range within one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slice {
    pub index: AllocationIndex,
    pub offset: u64,
    pub size: u64,
}

impl Slice {
    pub fn new(index: AllocationIndex, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
        }
    }

    pub fn whole(allocation: &BufferAllocation) -> Self {
        Self::new(allocation.index(), 0, allocation.size())
    }
}

/// Human-readable buffer-assignment description attached to allocation failures.
pub fn describe_allocations(allocations: &[BufferAllocation]) -> String {
    let total: u64 = allocations.iter().map(BufferAllocation::size).sum();
    let mut out = format!("buffer assignment: {} allocations, {total} bytes\n", allocations.len());
    for allocation in allocations {
        out.push_str(&allocation.to_string());
        out.push('\n');
    }
    out
}
