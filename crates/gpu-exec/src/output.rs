use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::allocation::{AllocationIndex, BufferAllocation};
use crate::arguments::{Arguments, ShapedBuffer};
use crate::buffer_allocations::BufferAllocations;
use crate::device::{allocate_owned, DeviceMemoryAllocator, DeviceMemoryBase, OwningDeviceMemory, Stream};
use crate::error::{ExecError, ExecResult};
use crate::shape::{Shape, ShapeIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasKind {
    /// The output may reuse the parameter's storage if the caller donates it.
    MayAlias,
    /// The caller must donate the parameter; the output always reuses its storage.
    MustAlias,
}

/// Declared relationship between an output and an input parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AliasConfig {
    pub parameter_number: usize,
    pub parameter_index: ShapeIndex,
    pub kind: AliasKind,
}

impl AliasConfig {
    pub fn new(parameter_number: usize, parameter_index: impl Into<ShapeIndex>, kind: AliasKind) -> Self {
        Self {
            parameter_number,
            parameter_index: parameter_index.into(),
            kind,
        }
    }

    pub fn must_alias(&self) -> bool {
        self.kind == AliasKind::MustAlias
    }
}

/// How one index of the output shape is backed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub allocation_index: AllocationIndex,
    pub alias_config: Option<AliasConfig>,
    /// The output is a parameter returned unmodified.
    pub passthrough: bool,
}

impl OutputInfo {
    pub fn new(allocation_index: AllocationIndex) -> Self {
        Self {
            allocation_index,
            alias_config: None,
            passthrough: false,
        }
    }

    pub fn with_alias(mut self, alias_config: AliasConfig) -> Self {
        self.alias_config = Some(alias_config);
        self
    }

    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }
}

/// Result buffers that are freed on drop, except the ones borrowed from the caller.
pub struct ScopedShapedBuffer {
    buffer: ShapedBuffer,
    owned: BTreeSet<ShapeIndex>,
    allocator: Arc<dyn DeviceMemoryAllocator>,
}

impl ScopedShapedBuffer {
    fn new(shape: Shape, allocator: Arc<dyn DeviceMemoryAllocator>, device_ordinal: i32) -> Self {
        Self {
            buffer: ShapedBuffer::new(shape, device_ordinal),
            owned: BTreeSet::new(),
            allocator,
        }
    }

    pub fn buffer(&self) -> &ShapedBuffer {
        &self.buffer
    }

    pub fn on_device_shape(&self) -> &Shape {
        self.buffer.on_device_shape()
    }

    pub fn root_buffer(&self) -> DeviceMemoryBase {
        self.buffer.root_buffer()
    }

    pub fn is_owned(&self, index: &ShapeIndex) -> bool {
        self.owned.contains(index)
    }

    /// Gives up ownership of every buffer; nothing is freed.
    pub fn release(mut self) -> ShapedBuffer {
        self.owned.clear();
        let shape = self.buffer.on_device_shape().clone();
        let ordinal = self.buffer.device_ordinal();
        std::mem::replace(&mut self.buffer, ShapedBuffer::new(shape, ordinal))
    }
}

impl fmt::Debug for ScopedShapedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedShapedBuffer")
            .field("buffer", &self.buffer)
            .field("owned", &self.owned)
            .finish()
    }
}

impl Drop for ScopedShapedBuffer {
    fn drop(&mut self) {
        let ordinal = self.buffer.device_ordinal();
        let mut freed = HashSet::new();
        for index in &self.owned {
            let Some(memory) = self.buffer.buffer(index) else {
                continue;
            };
            if memory.is_null() || !freed.insert(memory) {
                continue;
            }
            if let Err(err) = self.allocator.deallocate(ordinal, memory) {
                log::warn!("failed to free result buffer {index} at {memory}: {err}");
            }
        }
    }
}

/// Result of one invocation before the caller takes it over.
///
/// Leaves in [`aliased_indices`](Self::aliased_indices) share storage with caller inputs and
/// are not freed if the output is dropped uncommitted.
pub struct ExecutionOutput {
    result: ScopedShapedBuffer,
    aliased_indices: Vec<ShapeIndex>,
    to_be_released: Vec<OwningDeviceMemory>,
    donations: Vec<Donation>,
}

/// A caller buffer taken over by the result, remembered until the call can no longer fail.
struct Donation {
    parameter_number: usize,
    parameter_index: ShapeIndex,
    output_index: ShapeIndex,
    memory: DeviceMemoryBase,
    device_ordinal: i32,
    allocator: Arc<dyn DeviceMemoryAllocator>,
}

impl ExecutionOutput {
    pub(crate) fn new(
        shape: Shape,
        allocator: Arc<dyn DeviceMemoryAllocator>,
        device_ordinal: i32,
    ) -> Self {
        Self {
            result: ScopedShapedBuffer::new(shape, allocator, device_ordinal),
            aliased_indices: Vec::new(),
            to_be_released: Vec::new(),
            donations: Vec::new(),
        }
    }

    pub fn result(&self) -> &ShapedBuffer {
        self.result.buffer()
    }

    pub fn is_owned(&self, index: &ShapeIndex) -> bool {
        self.result.is_owned(index)
    }

    pub fn aliased_indices(&self) -> &[ShapeIndex] {
        &self.aliased_indices
    }

    /// Donated inputs that were not reused as outputs; freed with this output.
    pub fn to_be_released(&self) -> &[OwningDeviceMemory] {
        &self.to_be_released
    }

    pub fn take_to_be_released(&mut self) -> Vec<OwningDeviceMemory> {
        std::mem::take(&mut self.to_be_released)
    }

    /// Hands the result over to the caller, including donated buffers.
    pub fn commit(mut self) -> ScopedShapedBuffer {
        self.aliased_indices.clear();
        let empty = ScopedShapedBuffer::new(
            Shape::tuple(Vec::new()),
            Arc::clone(&self.result.allocator),
            self.result.buffer.device_ordinal(),
        );
        std::mem::replace(&mut self.result, empty)
    }

    pub(crate) fn set_buffer(
        &mut self,
        index: &ShapeIndex,
        memory: DeviceMemoryBase,
        owned: bool,
    ) -> ExecResult<()> {
        self.result.buffer.set_buffer(index, memory)?;
        if owned {
            self.result.owned.insert(index.clone());
        }
        Ok(())
    }

    pub(crate) fn add_aliased_index(&mut self, index: &ShapeIndex) {
        if !self.aliased_indices.contains(index) {
            self.aliased_indices.push(index.clone());
        }
    }

    /// Puts every donated buffer back into the input slot it came from.
    ///
    /// Called when the invocation fails after donations were taken, so the caller owns them again.
    pub(crate) fn return_donations(&mut self, arguments: &mut Arguments<'_>) {
        for donation in std::mem::take(&mut self.donations) {
            let Some(slot) =
                arguments.donatable_mut(donation.parameter_number, &donation.parameter_index)
            else {
                continue;
            };
            self.result.owned.remove(&donation.output_index);
            let owned = OwningDeviceMemory::new(
                donation.memory,
                donation.device_ordinal,
                donation.allocator,
            );
            *slot = owned.into();
            log::debug!(
                "returned donated parameter {} {} to the caller",
                donation.parameter_number,
                donation.parameter_index
            );
        }
    }

    pub(crate) fn add_to_be_released(&mut self, buffers: Vec<OwningDeviceMemory>) {
        self.to_be_released.extend(buffers);
    }
}

impl Drop for ExecutionOutput {
    fn drop(&mut self) {
        // Aliased storage still holds caller data; the caller keeps its address.
        for index in &self.aliased_indices {
            self.result.owned.remove(index);
        }
    }
}

impl fmt::Debug for ExecutionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOutput")
            .field("result", &self.result)
            .field("aliased_indices", &self.aliased_indices)
            .field("to_be_released", &self.to_be_released.len())
            .finish()
    }
}

/// Inputs of output assembly for one invocation.
pub(crate) struct OutputAssembler<'a> {
    pub output_shape: &'a Shape,
    pub output_info: &'a BTreeMap<ShapeIndex, OutputInfo>,
    pub allocations: &'a [BufferAllocation],
    pub stream: &'a dyn Stream,
    pub allocator: &'a Arc<dyn DeviceMemoryAllocator>,
    pub device_ordinal: i32,
    pub buffer_assignment_dump: &'a dyn Fn() -> String,
}

impl OutputAssembler<'_> {
    /// True when every output index with backing info also declares an alias.
    fn entire_tuple_contents_aliased(&self) -> bool {
        self.output_shape
            .leaf_indices()
            .iter()
            .filter_map(|index| self.output_info.get(index))
            .all(|info| info.alias_config.is_some())
    }

    /// Builds the result tree, rebinding aliased allocations in `buffer_allocations`.
    ///
    /// Returns the result and the set of addresses it contains.
    pub(crate) fn assemble(
        &self,
        arguments: &mut Arguments<'_>,
        buffer_allocations: &mut BufferAllocations,
    ) -> ExecResult<(ExecutionOutput, HashSet<DeviceMemoryBase>)> {
        let mut output = ExecutionOutput::new(
            self.output_shape.clone(),
            Arc::clone(self.allocator),
            self.device_ordinal,
        );
        let mut live = HashSet::new();
        if let Err(err) = self.fill(arguments, buffer_allocations, &mut output, &mut live) {
            output.return_donations(arguments);
            return Err(err);
        }
        Ok((output, live))
    }

    fn fill(
        &self,
        arguments: &mut Arguments<'_>,
        buffer_allocations: &mut BufferAllocations,
        output: &mut ExecutionOutput,
        live: &mut HashSet<DeviceMemoryBase>,
    ) -> ExecResult<()> {
        let mut claimed = HashSet::new();
        let entire_tuple_aliased = self.entire_tuple_contents_aliased();

        for index in self.output_shape.indices() {
            let Some(info) = self.output_info.get(&index) else {
                continue;
            };
            let allocation = self.allocations.get(info.allocation_index).ok_or_else(|| {
                ExecError::internal(format!(
                    "output {index} refers to allocation {} but only {} exist",
                    info.allocation_index,
                    self.allocations.len()
                ))
            })?;
            log::trace!("looking at allocation {} @ index {index}", info.allocation_index);

            let mut installed = None;
            if let Some(alias) = &info.alias_config {
                installed = self.install_aliased(
                    &index,
                    info,
                    alias,
                    allocation,
                    arguments,
                    buffer_allocations,
                    output,
                )?;
            }

            let memory = match installed {
                Some(memory) => memory,
                None => {
                    let memory = buffer_allocations.device_address(info.allocation_index);
                    let owned = match buffer_allocations.take_owned(info.allocation_index) {
                        Some(buffer) => {
                            claimed.insert(info.allocation_index);
                            buffer.release();
                            true
                        }
                        None => claimed.contains(&info.allocation_index),
                    };
                    output.set_buffer(&index, memory, owned)?;
                    if !owned && allocation.is_entry_computation_parameter() {
                        // Caller storage returned as-is.
                        output.add_aliased_index(&index);
                    }
                    // No new tuple is materialized when all contents alias inputs.
                    if entire_tuple_aliased {
                        output.add_aliased_index(&index);
                    }
                    memory
                }
            };
            live.insert(memory);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn install_aliased(
        &self,
        index: &ShapeIndex,
        info: &OutputInfo,
        alias: &AliasConfig,
        allocation: &BufferAllocation,
        arguments: &mut Arguments<'_>,
        buffer_allocations: &mut BufferAllocations,
        output: &mut ExecutionOutput,
    ) -> ExecResult<Option<DeviceMemoryBase>> {
        let donated = arguments
            .donatable_mut(alias.parameter_number, &alias.parameter_index)
            .and_then(|slot| slot.release());

        if let Some(owned) = donated {
            let device_ordinal = owned.device_ordinal();
            let allocator = Arc::clone(owned.allocator());
            let memory = owned.release();
            log::debug!(
                "reusing donated parameter {} {} as output {index}",
                alias.parameter_number,
                alias.parameter_index
            );
            output.donations.push(Donation {
                parameter_number: alias.parameter_number,
                parameter_index: alias.parameter_index.clone(),
                output_index: index.clone(),
                memory,
                device_ordinal,
                allocator,
            });
            buffer_allocations.set_device_address(info.allocation_index, memory)?;
            output.set_buffer(index, memory, true)?;
            output.add_aliased_index(index);
            return Ok(Some(memory));
        }

        if alias.must_alias() {
            return Err(ExecError::invalid_argument(format!(
                "an input was configured to be must-alias at compile time but not donated at runtime: allocation {}",
                info.allocation_index
            )));
        }

        let subshape = self.output_shape.subshape(index).ok_or_else(|| {
            ExecError::internal(format!("output index {index} is not part of {}", self.output_shape))
        })?;
        if info.passthrough || subshape.is_tuple() {
            return Ok(None);
        }

        log::debug!(
            "using copy-protection for output {index}: aliasing is declared but parameter {} was not donated",
            alias.parameter_number
        );
        let size = subshape.byte_size();
        let fresh = allocate_owned(self.allocator, self.device_ordinal, size).map_err(|status| {
            ExecError::resource_exhausted_with_dump(&status, &(self.buffer_assignment_dump)())
        })?;
        let aliased = buffer_allocations.device_address(info.allocation_index);
        if aliased.size() != fresh.as_device_memory().size() {
            return Err(ExecError::internal(format!(
                "allocation {} holds {} bytes but output {index} needs {}",
                allocation.index(),
                aliased.size(),
                fresh.as_device_memory().size()
            )));
        }
        self.stream
            .memcpy_device_to_device(fresh.as_device_memory(), aliased, aliased.size())?;
        let memory = fresh.release();
        buffer_allocations.set_device_address(info.allocation_index, memory)?;
        output.set_buffer(index, memory, true)?;
        Ok(Some(memory))
    }
}
