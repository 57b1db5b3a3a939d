use std::any::Any;

use crate::device::DeviceMemoryBase;

/// Slots describing one buffer: `{base, data, offset, size, stride}`.
pub const SLOTS_PER_ALLOCATION: usize = 5;

/// Rank-1 memref descriptor as laid out in a [`CallFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemrefDesc {
    pub base: u64,
    pub data: u64,
    pub offset: u64,
    pub size: u64,
    pub stride: u64,
}

/// Flat argument array handed to a runtime program's entry point.
///
/// Slot 0 is the opaque execution context, followed by [`SLOTS_PER_ALLOCATION`] slots per
/// buffer allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    args: Vec<u64>,
}

impl CallFrame {
    pub fn new(buffers: &[DeviceMemoryBase], buffer_sizes: &[u64]) -> Self {
        let mut args = Vec::with_capacity(1 + SLOTS_PER_ALLOCATION * buffers.len());
        args.push(0);
        for (i, buffer) in buffers.iter().enumerate() {
            let size = buffer_sizes.get(i).copied().unwrap_or(buffer.size());
            args.extend_from_slice(&[buffer.opaque(), buffer.opaque(), 0, size, 1]);
        }
        Self { args }
    }

    pub fn args(&self) -> &[u64] {
        &self.args
    }

    pub fn execution_context(&self) -> u64 {
        self.args[0]
    }

    pub fn set_execution_context(&mut self, context: u64) {
        self.args[0] = context;
    }

    pub fn num_allocations(&self) -> usize {
        (self.args.len() - 1) / SLOTS_PER_ALLOCATION
    }

    pub fn memref(&self, allocation: usize) -> Option<MemrefDesc> {
        let start = 1 + allocation * SLOTS_PER_ALLOCATION;
        let slots = self.args.get(start..start + SLOTS_PER_ALLOCATION)?;
        Some(MemrefDesc {
            base: slots[0],
            data: slots[1],
            offset: slots[2],
            size: slots[3],
            stride: slots[4],
        })
    }
}

/// Typed side channel of auxiliary values for custom-call handlers.
#[derive(Default)]
pub struct UserData<'a> {
    entries: Vec<&'a (dyn Any + Send + Sync)>,
}

impl<'a> UserData<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, value: &'a T) {
        self.entries.push(value);
    }

    /// First inserted value of type `T`.
    pub fn get<T: Any>(&self) -> Option<&'a T> {
        self.entries
            .iter()
            .copied()
            .find_map(|entry| entry.downcast_ref::<T>())
    }

    pub fn contains<T: Any>(&self) -> bool {
        self.get::<T>().is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
