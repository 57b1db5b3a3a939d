use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use gpu_exec::{DeviceMemoryBase, ExecError, ExecResult};

const FIRST_ADDRESS: u64 = 0x1000_0000;
const BLOCK_ALIGN: u64 = 256;

/// Host-backed stand-in for device memory with fake, non-overlapping addresses.
pub struct HostMemory {
    blocks: Mutex<BTreeMap<u64, Vec<u8>>>,
    next: AtomicU64,
}

impl Default for HostMemory {
    fn default() -> Self {
        Self {
            blocks: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(FIRST_ADDRESS),
        }
    }
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a zeroed block of `size` bytes, 256-byte aligned.
    pub fn allocate(&self, size: u64) -> DeviceMemoryBase {
        let span = size.max(1).div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN;
        let base = self.next.fetch_add(span + BLOCK_ALIGN, Ordering::Relaxed);
        self.blocks
            .lock()
            .expect("host memory poisoned")
            .insert(base, vec![0; span as usize]);
        DeviceMemoryBase::new(base, size)
    }

    /// Releases the block containing `address`; false if there is none.
    pub fn free(&self, address: u64) -> bool {
        let mut blocks = self.blocks.lock().expect("host memory poisoned");
        match Self::containing(&blocks, address) {
            Some(base) => blocks.remove(&base).is_some(),
            None => false,
        }
    }

    pub fn write(&self, dst: DeviceMemoryBase, src: &[u8]) -> ExecResult<()> {
        self.with_range(dst.opaque(), src.len() as u64, |bytes| {
            bytes.copy_from_slice(src);
        })
    }

    pub fn read(&self, src: DeviceMemoryBase, len: usize) -> ExecResult<Vec<u8>> {
        let mut out = vec![0; len];
        self.with_range(src.opaque(), len as u64, |bytes| out.copy_from_slice(bytes))?;
        Ok(out)
    }

    pub fn fill(&self, dst: DeviceMemoryBase, len: u64, pattern: &[u8]) -> ExecResult<()> {
        self.with_range(dst.opaque(), len, |bytes| {
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = pattern[i % pattern.len()];
            }
        })
    }

    pub fn copy(&self, dst: DeviceMemoryBase, src: DeviceMemoryBase, len: u64) -> ExecResult<()> {
        let bytes = self.read(src, len as usize)?;
        self.write(dst, &bytes)
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().expect("host memory poisoned").len()
    }

    fn containing(blocks: &BTreeMap<u64, Vec<u8>>, address: u64) -> Option<u64> {
        let (base, block) = blocks.range(..=address).next_back()?;
        (address < base + block.len() as u64).then_some(*base)
    }

    fn with_range<R>(&self, address: u64, len: u64, f: impl FnOnce(&mut [u8]) -> R) -> ExecResult<R> {
        if len == 0 {
            return Ok(f(&mut []));
        }
        let mut blocks = self.blocks.lock().expect("host memory poisoned");
        let base = Self::containing(&blocks, address).ok_or_else(|| {
            ExecError::internal(format!("{address:#x} is not inside any host block"))
        })?;
        let block = blocks.get_mut(&base).expect("block found above");
        let start = (address - base) as usize;
        let end = start + len as usize;
        if end > block.len() {
            return Err(ExecError::internal(format!(
                "access of {len} bytes at {address:#x} overruns its block"
            )));
        }
        Ok(f(&mut block[start..end]))
    }
}
