use crate::device::{DeviceMemoryBase, OwningDeviceMemory};
use crate::error::{ExecError, ExecResult};
use crate::shape::{Shape, ShapeIndex, ShapeTree};

/// Tree of device addresses shaped like `on_device_shape`. Owns nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapedBuffer {
    buffers: ShapeTree<DeviceMemoryBase>,
    device_ordinal: i32,
}

impl ShapedBuffer {
    /// All addresses start out null.
    pub fn new(on_device_shape: Shape, device_ordinal: i32) -> Self {
        Self {
            buffers: ShapeTree::new(on_device_shape),
            device_ordinal,
        }
    }

    pub fn from_tree(buffers: ShapeTree<DeviceMemoryBase>, device_ordinal: i32) -> Self {
        Self {
            buffers,
            device_ordinal,
        }
    }

    pub fn on_device_shape(&self) -> &Shape {
        self.buffers.shape()
    }

    pub fn device_ordinal(&self) -> i32 {
        self.device_ordinal
    }

    pub fn buffers(&self) -> &ShapeTree<DeviceMemoryBase> {
        &self.buffers
    }

    pub fn buffer(&self, index: &ShapeIndex) -> Option<DeviceMemoryBase> {
        self.buffers.element(index).copied()
    }

    /// Root buffer of an array-shaped value.
    pub fn root_buffer(&self) -> DeviceMemoryBase {
        self.buffer(&ShapeIndex::root()).unwrap_or_default()
    }

    pub fn set_buffer(&mut self, index: &ShapeIndex, buffer: DeviceMemoryBase) -> ExecResult<()> {
        let shape = self.buffers.shape().to_string();
        let slot = self.buffers.element_mut(index).ok_or_else(|| {
            ExecError::invalid_argument(format!("shape index {index} is not part of {shape}"))
        })?;
        *slot = buffer;
        Ok(())
    }
}

/// A caller buffer that is either lent to the callee or handed over to it.
#[derive(Debug)]
pub enum MaybeOwningDeviceMemory {
    Borrowed(DeviceMemoryBase),
    Owned(OwningDeviceMemory),
}

impl Default for MaybeOwningDeviceMemory {
    fn default() -> Self {
        MaybeOwningDeviceMemory::Borrowed(DeviceMemoryBase::null())
    }
}

impl MaybeOwningDeviceMemory {
    pub fn has_ownership(&self) -> bool {
        matches!(self, MaybeOwningDeviceMemory::Owned(_))
    }

    pub fn as_device_memory(&self) -> DeviceMemoryBase {
        match self {
            MaybeOwningDeviceMemory::Borrowed(memory) => *memory,
            MaybeOwningDeviceMemory::Owned(owned) => owned.as_device_memory(),
        }
    }

    /// Takes ownership out, leaving a borrowed reference to the same address behind.
    pub fn release(&mut self) -> Option<OwningDeviceMemory> {
        let address = self.as_device_memory();
        match std::mem::replace(self, MaybeOwningDeviceMemory::Borrowed(address)) {
            MaybeOwningDeviceMemory::Owned(owned) => Some(owned),
            MaybeOwningDeviceMemory::Borrowed(_) => None,
        }
    }
}

impl From<DeviceMemoryBase> for MaybeOwningDeviceMemory {
    fn from(value: DeviceMemoryBase) -> Self {
        MaybeOwningDeviceMemory::Borrowed(value)
    }
}

impl From<OwningDeviceMemory> for MaybeOwningDeviceMemory {
    fn from(value: OwningDeviceMemory) -> Self {
        MaybeOwningDeviceMemory::Owned(value)
    }
}

/// A parameter whose sub-buffers may be donated to the executable.
#[derive(Debug)]
pub struct ExecutionInput {
    buffers: ShapeTree<MaybeOwningDeviceMemory>,
}

impl ExecutionInput {
    pub fn new(shape: Shape) -> Self {
        Self {
            buffers: ShapeTree::new(shape),
        }
    }

    /// Wraps every address of `buffer` as borrowed.
    pub fn borrowed(buffer: &ShapedBuffer) -> Self {
        let buffers = buffer
            .buffers()
            .clone()
            .map(|_, memory| MaybeOwningDeviceMemory::Borrowed(memory));
        Self { buffers }
    }

    pub fn shape(&self) -> &Shape {
        self.buffers.shape()
    }

    pub fn buffer(&self, index: &ShapeIndex) -> Option<&MaybeOwningDeviceMemory> {
        self.buffers.element(index)
    }

    pub fn buffer_mut(&mut self, index: &ShapeIndex) -> Option<&mut MaybeOwningDeviceMemory> {
        self.buffers.element_mut(index)
    }

    pub fn set_buffer(
        &mut self,
        index: &ShapeIndex,
        buffer: impl Into<MaybeOwningDeviceMemory>,
    ) -> ExecResult<()> {
        let shape = self.buffers.shape().to_string();
        let slot = self.buffers.element_mut(index).ok_or_else(|| {
            ExecError::invalid_argument(format!("shape index {index} is not part of {shape}"))
        })?;
        *slot = buffer.into();
        Ok(())
    }

    /// Hands out every sub-buffer the input still owns.
    pub fn take_owned_buffers(&mut self) -> Vec<OwningDeviceMemory> {
        self.buffers
            .iter_mut()
            .filter_map(|(_, memory)| memory.release())
            .collect()
    }
}

/// Caller arguments: read-only shaped buffers or donatable inputs.
pub enum Arguments<'a> {
    Unowned(&'a [&'a ShapedBuffer]),
    Donatable(&'a mut [ExecutionInput]),
}

impl Arguments<'_> {
    pub fn len(&self) -> usize {
        match self {
            Arguments::Unowned(buffers) => buffers.len(),
            Arguments::Donatable(inputs) => inputs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of a parameter sub-buffer; `None` if the parameter or index does not exist.
    pub fn address(&self, parameter_number: usize, index: &ShapeIndex) -> Option<DeviceMemoryBase> {
        match self {
            Arguments::Unowned(buffers) => buffers.get(parameter_number)?.buffer(index),
            Arguments::Donatable(inputs) => inputs
                .get(parameter_number)?
                .buffer(index)
                .map(MaybeOwningDeviceMemory::as_device_memory),
        }
    }

    /// The donatable slot, or `None` when the caller passed read-only buffers.
    pub fn donatable_mut(
        &mut self,
        parameter_number: usize,
        index: &ShapeIndex,
    ) -> Option<&mut MaybeOwningDeviceMemory> {
        match self {
            Arguments::Unowned(_) => None,
            Arguments::Donatable(inputs) => inputs.get_mut(parameter_number)?.buffer_mut(index),
        }
    }
}
