use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gpu_exec::{DeviceMemoryAllocator, DeviceMemoryBase, ExecError, ExecResult};

use crate::memory::HostMemory;

/// Allocator over [`HostMemory`] that counts traffic and can inject faults.
///
/// Freeing an address that is not live is counted as a double free and reported as an error.
pub struct HostAllocator {
    memory: Arc<HostMemory>,
    asynchronous_deallocation: bool,
    misalignment: AtomicU64,
    fail_after: Mutex<Option<usize>>,
    live: Mutex<HashSet<u64>>,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    double_frees: AtomicUsize,
}

impl HostAllocator {
    pub fn new(memory: Arc<HostMemory>) -> Self {
        Self {
            memory,
            asynchronous_deallocation: true,
            misalignment: AtomicU64::new(0),
            fail_after: Mutex::new(None),
            live: Mutex::new(HashSet::new()),
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
            double_frees: AtomicUsize::new(0),
        }
    }

    /// Buffers may not be freed while queued work still uses them.
    pub fn synchronous(mut self) -> Self {
        self.asynchronous_deallocation = false;
        self
    }

    /// Offsets every following allocation by `bytes` from its natural alignment.
    pub fn misalign_by(&self, bytes: u64) {
        self.misalignment.store(bytes, Ordering::SeqCst);
    }

    /// Lets `successes` more allocations through, then fails every request.
    pub fn fail_after(&self, successes: usize) {
        *self.fail_after.lock().expect("allocator poisoned") = Some(successes);
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn deallocation_count(&self) -> usize {
        self.deallocations.load(Ordering::SeqCst)
    }

    pub fn double_free_count(&self) -> usize {
        self.double_frees.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().expect("allocator poisoned").len()
    }

    pub fn is_live(&self, memory: DeviceMemoryBase) -> bool {
        self.live
            .lock()
            .expect("allocator poisoned")
            .contains(&memory.opaque())
    }
}

impl DeviceMemoryAllocator for HostAllocator {
    fn allocate_raw(&self, device_ordinal: i32, size: u64) -> ExecResult<DeviceMemoryBase> {
        if size == 0 {
            return Ok(DeviceMemoryBase::null());
        }
        {
            let mut fail_after = self.fail_after.lock().expect("allocator poisoned");
            match fail_after.as_mut() {
                Some(0) => {
                    return Err(ExecError::resource_exhausted(format!(
                        "out of memory allocating {size} bytes on device {device_ordinal}"
                    )))
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }
        let misalignment = self.misalignment.load(Ordering::SeqCst);
        let block = self.memory.allocate(size + misalignment);
        let memory = DeviceMemoryBase::new(block.opaque() + misalignment, size);
        self.live
            .lock()
            .expect("allocator poisoned")
            .insert(memory.opaque());
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(memory)
    }

    fn deallocate(&self, device_ordinal: i32, memory: DeviceMemoryBase) -> ExecResult<()> {
        if memory.is_null() {
            return Ok(());
        }
        if !self
            .live
            .lock()
            .expect("allocator poisoned")
            .remove(&memory.opaque())
        {
            self.double_frees.fetch_add(1, Ordering::SeqCst);
            log::error!("double free of {memory} on device {device_ordinal}");
            return Err(ExecError::internal(format!(
                "{memory} freed on device {device_ordinal} but not live"
            )));
        }
        self.memory.free(memory.opaque());
        self.deallocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allows_asynchronous_deallocation(&self) -> bool {
        self.asynchronous_deallocation
    }
}
