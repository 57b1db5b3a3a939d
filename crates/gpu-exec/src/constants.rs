use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::allocation::AllocationIndex;
use crate::buffer_allocations::GlobalMap;
use crate::device::{DeviceMemoryBase, ExecutorId, ModuleHandle, ModuleSpec, Stream, StreamExecutor};
use crate::error::{lock_named, read_named, write_named, ExecError, ExecResult};

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV1A_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

/// A constant embedded in a compiled program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantInfo {
    pub symbol_name: String,
    /// Host-side initializer. Empty when the module carries its own initializer.
    pub content: Arc<[u8]>,
    /// Allocation that refers to this constant, if any.
    pub allocation_index: Option<AllocationIndex>,
}

impl ConstantInfo {
    pub fn new(
        symbol_name: impl Into<String>,
        content: impl Into<Arc<[u8]>>,
        allocation_index: Option<AllocationIndex>,
    ) -> Self {
        Self {
            symbol_name: symbol_name.into(),
            content: content.into(),
            allocation_index,
        }
    }
}

/// Device copy of constant content, shared by every program that embeds the same bytes.
pub struct SharedConstant {
    memory: DeviceMemoryBase,
    content: Arc<[u8]>,
    executor: Arc<dyn StreamExecutor>,
}

impl SharedConstant {
    pub fn memory(&self) -> DeviceMemoryBase {
        self.memory
    }
}

impl fmt::Debug for SharedConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConstant")
            .field("memory", &self.memory)
            .field("bytes", &self.content.len())
            .finish()
    }
}

impl Drop for SharedConstant {
    fn drop(&mut self) {
        if let Err(err) = self.executor.deallocate(self.memory) {
            log::warn!("failed to free shared constant at {}: {err}", self.memory);
        }
    }
}

/// Per-context cache of constants keyed by content.
///
/// Holds weak references; a constant is freed once the last program using it goes away.
#[derive(Default)]
pub struct ConstantCache {
    entries: Mutex<HashMap<u64, Vec<Weak<SharedConstant>>>>,
}

impl ConstantCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a live device copy of `content`, allocating and uploading on a miss.
    pub fn create_or_share(
        &self,
        stream: &dyn Stream,
        content: &Arc<[u8]>,
    ) -> ExecResult<Arc<SharedConstant>> {
        let key = fnv1a_hash(content);
        let mut entries = lock_named(&self.entries, "constant cache")?;
        let bucket = entries.entry(key).or_default();
        bucket.retain(|weak| weak.strong_count() > 0);
        if let Some(found) = bucket
            .iter()
            .filter_map(Weak::upgrade)
            .find(|shared| shared.content[..] == content[..])
        {
            return Ok(found);
        }

        let executor = stream.executor();
        let memory = executor.allocate(content.len() as u64)?;
        let shared = Arc::new(SharedConstant {
            memory,
            content: Arc::clone(content),
            executor,
        });
        stream.memcpy_host_to_device(memory, content)?;
        bucket.push(Arc::downgrade(&shared));
        Ok(shared)
    }

    /// Number of distinct constants currently alive.
    pub fn live_entries(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .values()
                    .flatten()
                    .filter(|weak| weak.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Constants of one program resolved on one device context.
pub struct ResolvedGlobals {
    globals: GlobalMap,
    module: Option<ModuleHandle>,
    shared_constants: Vec<Arc<SharedConstant>>,
    executor: Arc<dyn StreamExecutor>,
}

impl ResolvedGlobals {
    pub fn globals(&self) -> &GlobalMap {
        &self.globals
    }

    pub fn module(&self) -> Option<ModuleHandle> {
        self.module
    }

    pub fn shared_constants(&self) -> &[Arc<SharedConstant>] {
        &self.shared_constants
    }
}

impl Drop for ResolvedGlobals {
    fn drop(&mut self) {
        // Work queued by earlier executions may still read the globals.
        if let Err(err) = self.executor.synchronize_all_activity() {
            log::warn!(
                "failed to synchronize {} before releasing constants: {err}",
                self.executor.id()
            );
        }
        if let Some(module) = self.module.take() {
            if let Err(err) = self.executor.unload_module(module) {
                log::warn!("failed to unload module {module:?}: {err}");
            }
        }
    }
}

/// Resolves a program's constants once per device context and shares the result.
pub struct ConstantResolver {
    binary: Arc<[u8]>,
    text: Arc<str>,
    constants: Vec<ConstantInfo>,
    resolved: RwLock<HashMap<ExecutorId, Arc<ResolvedGlobals>>>,
    resolve_gates: Mutex<HashMap<ExecutorId, Arc<Mutex<()>>>>,
}

impl ConstantResolver {
    pub fn new(binary: Arc<[u8]>, text: Arc<str>, constants: Vec<ConstantInfo>) -> Self {
        Self {
            binary,
            text,
            constants,
            resolved: RwLock::new(HashMap::new()),
            resolve_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn constants(&self) -> &[ConstantInfo] {
        &self.constants
    }

    /// Globals for the context owning `stream`, resolving them on first use.
    pub fn resolve(&self, stream: &dyn Stream) -> ExecResult<Arc<ResolvedGlobals>> {
        let executor = stream.executor();
        let id = executor.id();
        if let Some(found) = read_named(&self.resolved, "constant globals")?.get(&id) {
            return Ok(Arc::clone(found));
        }

        let gate = lock_named(&self.resolve_gates, "constant resolve gates")?
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _gate_lock = lock_named(&gate, "constant resolve gate")?;

        if let Some(found) = read_named(&self.resolved, "constant globals")?.get(&id) {
            return Ok(Arc::clone(found));
        }

        let resolved = Arc::new(self.load(stream, executor)?);
        write_named(&self.resolved, "constant globals")?.insert(id, Arc::clone(&resolved));
        Ok(resolved)
    }

    /// Contexts that currently hold resolved globals.
    pub fn resolved_contexts(&self) -> Vec<ExecutorId> {
        self.resolved
            .read()
            .map(|resolved| resolved.keys().copied().collect())
            .unwrap_or_default()
    }

    fn load(
        &self,
        stream: &dyn Stream,
        executor: Arc<dyn StreamExecutor>,
    ) -> ExecResult<ResolvedGlobals> {
        // An empty binary cannot be loaded; every symbol lookup then misses.
        let module = if self.binary.is_empty() {
            None
        } else {
            Some(executor.load_module(&ModuleSpec {
                binary: &self.binary,
                text: &self.text,
            })?)
        };
        let mut resolved = ResolvedGlobals {
            globals: GlobalMap::new(),
            module,
            shared_constants: Vec::new(),
            executor: Arc::clone(&executor),
        };

        for info in &self.constants {
            let symbol = match module {
                Some(module) => executor.get_symbol(module, &info.symbol_name)?,
                None => None,
            };
            let global = match symbol {
                Some(global) => {
                    log::trace!("resolved global {} to {global}", info.symbol_name);
                    if !info.content.is_empty() {
                        // The module declares the global without an initializer.
                        stream.memcpy_host_to_device(global, &info.content)?;
                    }
                    global
                }
                None => {
                    if info.content.is_empty() {
                        return Err(ExecError::internal(format!(
                            "constant {} is not defined by the module and has no host content",
                            info.symbol_name
                        )));
                    }
                    let shared = executor
                        .constant_cache()
                        .create_or_share(stream, &info.content)?;
                    let global = shared.memory();
                    log::trace!("allocated (or shared) global {} at {global}", info.symbol_name);
                    resolved.shared_constants.push(shared);
                    global
                }
            };

            if let Some(index) = info.allocation_index {
                if resolved.globals.insert(index, global).is_some() {
                    return Err(ExecError::internal(format!(
                        "allocation {index} is backed by more than one constant"
                    )));
                }
            }
        }

        log::debug!(
            "resolved {} constants ({} shared) on {}",
            resolved.globals.len(),
            resolved.shared_constants.len(),
            executor.id()
        );
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }
}
