use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::device::{Event, ExecutorId, KernelHandle, Stream};
use crate::error::{lock_named, ExecError, ExecResult};

/// Per-operation identifier assigned at compile time.
pub type Uid = i64;

/// Tuned matrix-multiply configuration for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct GemmConfig {
    pub m: u64,
    pub n: u64,
    pub k: u64,
    pub alpha: f64,
    pub beta: f64,
    pub algorithm: Option<i64>,
}

/// GEMM configurations keyed by operation uid.
#[derive(Default)]
pub struct GemmConfigCache {
    configs: Mutex<HashMap<Uid, Arc<GemmConfig>>>,
}

impl GemmConfigCache {
    pub fn get(&self, uid: Uid) -> ExecResult<Option<Arc<GemmConfig>>> {
        Ok(lock_named(&self.configs, "gemm config cache")?.get(&uid).cloned())
    }

    /// Stores `config` unless one is already present; returns the stored entry.
    pub fn set(&self, uid: Uid, config: GemmConfig) -> ExecResult<Arc<GemmConfig>> {
        Ok(Arc::clone(
            lock_named(&self.configs, "gemm config cache")?
                .entry(uid)
                .or_insert_with(|| Arc::new(config)),
        ))
    }
}

/// Kernel handles keyed by device context and kernel name.
#[derive(Default)]
pub struct KernelsCache {
    kernels: Mutex<HashMap<(ExecutorId, String), KernelHandle>>,
}

impl KernelsCache {
    pub fn get(&self, executor: ExecutorId, name: &str) -> ExecResult<Option<KernelHandle>> {
        Ok(lock_named(&self.kernels, "kernels cache")?
            .get(&(executor, name.to_string()))
            .copied())
    }

    /// Stores `kernel` unless one is already present; returns the stored handle.
    pub fn set(&self, executor: ExecutorId, name: &str, kernel: KernelHandle) -> ExecResult<KernelHandle> {
        Ok(*lock_named(&self.kernels, "kernels cache")?
            .entry((executor, name.to_string()))
            .or_insert(kernel))
    }
}

/// State shared by collective operations across runs of the same executable.
#[derive(Default)]
pub struct CollectiveSupport {
    executed: Mutex<HashSet<(Uid, i32)>>,
}

impl CollectiveSupport {
    /// Blocks on `stream` the first time `(uid, device_ordinal)` runs, surfacing errors early.
    pub fn maybe_block_after_first_run(
        &self,
        uid: Uid,
        device_ordinal: i32,
        stream: &dyn Stream,
    ) -> ExecResult<()> {
        let first_run = {
            let mut executed = lock_named(&self.executed, "collective support")?;
            executed.insert((uid, device_ordinal))
        };
        if first_run {
            stream.block_host_until_done()?;
        }
        Ok(())
    }
}

/// Done events of asynchronous collectives for one run.
pub struct AsyncCollectiveSupport {
    async_comm_stream: Arc<dyn Stream>,
    done_events: Mutex<HashMap<(Uid, i32), Arc<dyn Event>>>,
}

impl AsyncCollectiveSupport {
    pub fn new(async_comm_stream: Arc<dyn Stream>) -> Self {
        Self {
            async_comm_stream,
            done_events: Mutex::new(HashMap::new()),
        }
    }

    pub fn async_comm_stream(&self) -> &Arc<dyn Stream> {
        &self.async_comm_stream
    }

    pub fn push_event(&self, uid: Uid, device_ordinal: i32, done: Arc<dyn Event>) -> ExecResult<()> {
        let mut events = lock_named(&self.done_events, "async collective events")?;
        if events.contains_key(&(uid, device_ordinal)) {
            return Err(ExecError::internal(format!(
                "done event of collective {uid} on device {device_ordinal} has not been consumed"
            )));
        }
        events.insert((uid, device_ordinal), done);
        Ok(())
    }

    pub fn pop_event(&self, uid: Uid, device_ordinal: i32) -> ExecResult<Arc<dyn Event>> {
        lock_named(&self.done_events, "async collective events")?
            .remove(&(uid, device_ordinal))
            .ok_or_else(|| {
                ExecError::internal(format!(
                    "async done event of collective {uid} on device {device_ordinal} was not found"
                ))
            })
    }
}
