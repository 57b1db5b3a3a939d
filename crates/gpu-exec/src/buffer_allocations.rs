use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::allocation::{AllocationIndex, AllocationKind, BufferAllocation, Slice};
use crate::arguments::{Arguments, MaybeOwningDeviceMemory};
use crate::device::{allocate_owned, DeviceMemoryAllocator, DeviceMemoryBase, OwningDeviceMemory};
use crate::error::{ExecError, ExecResult};

/// Resolved constant globals of one device context, keyed by allocation index.
pub type GlobalMap = HashMap<AllocationIndex, DeviceMemoryBase>;

/// Address of `allocation` for one invocation.
///
/// Per-invocation allocations come back owned so that an early return frees them.
pub fn resolve_address(
    allocation: &BufferAllocation,
    arguments: &Arguments<'_>,
    globals: &GlobalMap,
    allocator: &Arc<dyn DeviceMemoryAllocator>,
    device_ordinal: i32,
    buffer_assignment_dump: &dyn Fn() -> String,
) -> ExecResult<MaybeOwningDeviceMemory> {
    match allocation.kind() {
        AllocationKind::ThreadLocal => Ok(DeviceMemoryBase::null().into()),
        AllocationKind::EntryParameter {
            parameter_number,
            parameter_shape_index,
            ..
        } => {
            let registered = arguments
                .address(*parameter_number, parameter_shape_index)
                .ok_or_else(|| {
                    ExecError::invalid_argument(format!(
                        "parameter {parameter_number} has no sub-buffer at shape index {parameter_shape_index} ({} arguments supplied)",
                        arguments.len()
                    ))
                })?;
            if registered.is_null() && allocation.size() > 0 {
                return Err(ExecError::failed_precondition(format!(
                    "cannot run computation because pointer to (sub-)buffer at index {parameter_shape_index} of parameter {parameter_number} was null; all pointers to (sub-)buffers must not be null unless the (sub-)buffer has zero elements"
                )));
            }
            Ok(registered.into())
        }
        AllocationKind::Constant => Ok(globals
            .get(&allocation.index())
            .copied()
            .unwrap_or_default()
            .into()),
        AllocationKind::Temp | AllocationKind::MaybeLiveOut => {
            if allocation.size() == 0 {
                return Ok(DeviceMemoryBase::null().into());
            }
            let owned = allocate_owned(allocator, device_ordinal, allocation.size()).map_err(
                |status| {
                    ExecError::resource_exhausted_with_dump(&status, &buffer_assignment_dump())
                },
            )?;
            Ok(owned.into())
        }
    }
}

/// Fails unless a non-null `address` meets the alignment required by the allocation's kind.
pub fn check_alignment(allocation: &BufferAllocation, address: DeviceMemoryBase) -> ExecResult<()> {
    let expected = allocation.expected_alignment();
    if !address.is_null() && address.opaque() % expected != 0 {
        return Err(ExecError::internal(format!(
            "address of buffer {} must be a multiple of {expected:#x}, but was {:#x}",
            allocation.index(),
            address.opaque()
        )));
    }
    Ok(())
}

/// Allocation index to device address binding for one invocation.
pub struct BufferAllocations {
    addresses: Vec<DeviceMemoryBase>,
    owned: Vec<Option<OwningDeviceMemory>>,
    device_ordinal: i32,
    allocator: Arc<dyn DeviceMemoryAllocator>,
}

impl BufferAllocations {
    /// Resolves every allocation in index order, checking alignment as it goes.
    pub fn generate(
        allocations: &[BufferAllocation],
        arguments: &Arguments<'_>,
        globals: &GlobalMap,
        allocator: &Arc<dyn DeviceMemoryAllocator>,
        device_ordinal: i32,
        buffer_assignment_dump: &dyn Fn() -> String,
    ) -> ExecResult<Self> {
        let mut out = Self {
            addresses: Vec::with_capacity(allocations.len()),
            owned: Vec::with_capacity(allocations.len()),
            device_ordinal,
            allocator: Arc::clone(allocator),
        };
        for (position, allocation) in allocations.iter().enumerate() {
            if allocation.index() != position {
                return Err(ExecError::internal(format!(
                    "allocation at position {position} reports index {}",
                    allocation.index()
                )));
            }
            let resolved = resolve_address(
                allocation,
                arguments,
                globals,
                allocator,
                device_ordinal,
                buffer_assignment_dump,
            )?;
            let address = resolved.as_device_memory();
            let owned = match resolved {
                MaybeOwningDeviceMemory::Owned(owned) => Some(owned),
                MaybeOwningDeviceMemory::Borrowed(_) => None,
            };
            out.addresses.push(address);
            out.owned.push(owned);
            check_alignment(allocation, address)?;
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn device_ordinal(&self) -> i32 {
        self.device_ordinal
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceMemoryAllocator> {
        &self.allocator
    }

    pub fn device_address(&self, index: AllocationIndex) -> DeviceMemoryBase {
        self.addresses.get(index).copied().unwrap_or_default()
    }

    pub fn addresses(&self) -> &[DeviceMemoryBase] {
        &self.addresses
    }

    pub fn slice_address(&self, slice: &Slice) -> ExecResult<DeviceMemoryBase> {
        let base = self.addresses.get(slice.index).ok_or_else(|| {
            ExecError::internal(format!(
                "slice refers to allocation {} but only {} are bound",
                slice.index,
                self.addresses.len()
            ))
        })?;
        base.sub_region(slice.offset, slice.size)
    }

    /// Rebinds an allocation, e.g. to a donated or copy-protected output buffer.
    pub(crate) fn set_device_address(
        &mut self,
        index: AllocationIndex,
        address: DeviceMemoryBase,
    ) -> ExecResult<()> {
        let slot = self.addresses.get_mut(index).ok_or_else(|| {
            ExecError::internal(format!("allocation {index} is out of range"))
        })?;
        *slot = address;
        Ok(())
    }

    /// Moves ownership of a freshly allocated buffer out, e.g. into the result.
    pub(crate) fn take_owned(&mut self, index: AllocationIndex) -> Option<OwningDeviceMemory> {
        self.owned.get_mut(index).and_then(Option::take)
    }

    /// Frees every buffer this invocation still owns that is not in `live`.
    ///
    /// Every allocation is attempted; the first failure is returned.
    pub fn tear_down(mut self, live: &HashSet<DeviceMemoryBase>) -> ExecResult<()> {
        let mut status = Ok(());
        for (index, owned) in self.owned.iter_mut().enumerate() {
            let Some(buffer) = owned.take() else {
                continue;
            };
            if live.contains(&buffer.as_device_memory()) {
                log::warn!(
                    "allocation {index} is live in the result but still owned at teardown; leaving it allocated"
                );
                let _ = buffer.release();
                continue;
            }
            if let Err(err) = buffer.free() {
                log::warn!("failed to free allocation {index}: {err}");
                if status.is_ok() {
                    status = Err(err);
                }
            }
        }
        status
    }
}

impl fmt::Display for BufferAllocations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "buffer allocations on device {} ({} entries):",
            self.device_ordinal,
            self.addresses.len()
        )?;
        for (index, address) in self.addresses.iter().enumerate() {
            let owner = if self.owned[index].is_some() { "owned" } else { "borrowed" };
            writeln!(f, "  {index}: {address} [{owner}]")?;
        }
        Ok(())
    }
}
