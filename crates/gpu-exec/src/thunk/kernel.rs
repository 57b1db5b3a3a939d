use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::allocation::Slice;
use crate::device::{ExecutorId, KernelHandle, LaunchDimensions, ModuleHandle, ModuleSpec, StreamExecutor};
use crate::error::{lock_named, ExecError, ExecResult};

use super::{ExecuteParams, InitializeParams, Thunk, ThunkInfo, ThunkKind};

struct LoadedKernel {
    executor: Arc<dyn StreamExecutor>,
    module: ModuleHandle,
    kernel: KernelHandle,
}

impl Drop for LoadedKernel {
    fn drop(&mut self) {
        if let Err(err) = self.executor.unload_module(self.module) {
            log::warn!("failed to unload kernel module {:?}: {err}", self.module);
        }
    }
}

/// Launches one kernel of the program's module.
pub struct KernelThunk {
    info: ThunkInfo,
    kernel_name: String,
    args: Vec<Slice>,
    launch_dimensions: LaunchDimensions,
    loaded: Mutex<HashMap<ExecutorId, LoadedKernel>>,
}

impl KernelThunk {
    pub fn new(
        info: ThunkInfo,
        kernel_name: impl Into<String>,
        args: Vec<Slice>,
        launch_dimensions: LaunchDimensions,
    ) -> Self {
        Self {
            info,
            kernel_name: kernel_name.into(),
            args,
            launch_dimensions,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }
}

impl Thunk for KernelThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Kernel
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ThunkInfo {
        &mut self.info
    }

    fn initialize(&self, params: &InitializeParams<'_>) -> ExecResult<()> {
        let id = params.executor.id();
        let mut loaded = lock_named(&self.loaded, "kernel thunk")?;
        if loaded.contains_key(&id) {
            return Ok(());
        }
        let module = params.executor.load_module(&ModuleSpec {
            binary: params.binary,
            text: params.text,
        })?;
        let mut entry = LoadedKernel {
            executor: Arc::clone(params.executor),
            module,
            kernel: KernelHandle(0),
        };
        // `entry` unloads the module if the lookup fails.
        entry.kernel = params.executor.get_kernel(module, &self.kernel_name)?;
        loaded.insert(id, entry);
        Ok(())
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        let id = params.stream.executor().id();
        let kernel = lock_named(&self.loaded, "kernel thunk")?
            .get(&id)
            .map(|loaded| loaded.kernel)
            .ok_or_else(|| {
                ExecError::internal(format!(
                    "kernel {} was not initialized on {id}",
                    self.kernel_name
                ))
            })?;
        let args = self
            .args
            .iter()
            .map(|slice| params.buffer_allocations.slice_address(slice))
            .collect::<ExecResult<Vec<_>>>()?;
        params
            .stream
            .launch_kernel(kernel, &self.launch_dimensions, &args)
    }
}
