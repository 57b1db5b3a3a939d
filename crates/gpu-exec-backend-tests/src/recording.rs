use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gpu_exec::runtime::{
    AsyncCollectiveSupport, CallFrame, CollectiveSupport, ExecutableArtifacts, GemmConfigCache,
    KernelsCache, RuntimeCompiler, RuntimeExecutable, RuntimeLoader, RuntimeProgram, TempBuffer,
    UserData,
};
use gpu_exec::thunk::{ExecuteParams, InitializeParams};
use gpu_exec::{
    DebugOptions, DeviceMemoryBase, ExecError, ExecResult, RunOptions, RuntimeGpuExecutable, Thunk,
    ThunkInfo, ThunkKind,
};

/// Shared, ordered log of thunk executions.
pub type ThunkLog = Arc<Mutex<Vec<String>>>;

pub fn thunk_log() -> ThunkLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn logged(log: &ThunkLog) -> Vec<String> {
    log.lock().expect("thunk log poisoned").clone()
}

/// Thunk that appends its name to a [`ThunkLog`] when executed.
pub struct RecordingThunk {
    info: ThunkInfo,
    kind: ThunkKind,
    log: ThunkLog,
    initializations: AtomicUsize,
}

impl RecordingThunk {
    pub fn new(name: impl Into<String>, log: &ThunkLog) -> Self {
        Self {
            info: ThunkInfo::new(name),
            kind: ThunkKind::CustomCall,
            log: Arc::clone(log),
            initializations: AtomicUsize::new(0),
        }
    }

    pub fn boxed(name: impl Into<String>, log: &ThunkLog) -> Box<dyn Thunk> {
        Box::new(Self::new(name, log))
    }

    /// Reports `kind`, e.g. an asynchronous collective.
    pub fn with_kind(mut self, kind: ThunkKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_op_name(mut self, op_name: impl Into<String>) -> Self {
        self.info = self.info.with_op_name(op_name);
        self
    }

    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }
}

impl Thunk for RecordingThunk {
    fn kind(&self) -> ThunkKind {
        self.kind
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ThunkInfo {
        &mut self.info
    }

    fn initialize(&self, _params: &InitializeParams<'_>) -> ExecResult<()> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> ExecResult<()> {
        if self.kind.needs_async_comms_stream() {
            params.async_comms_stream()?;
        }
        self.log
            .lock()
            .expect("thunk log poisoned")
            .push(self.info.profile_annotation.clone());
        Ok(())
    }
}

/// What a runtime entry point observed in one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInvocation {
    pub args: Vec<u64>,
    pub temp_buffer: Option<DeviceMemoryBase>,
    pub has_run_options: bool,
    pub has_debug_options: bool,
    pub has_artifacts: bool,
    pub has_executable: bool,
    pub has_gemm_configs: bool,
    pub has_kernels_cache: bool,
    pub has_collectives: bool,
    pub has_async_collectives: bool,
}

impl RuntimeInvocation {
    fn capture(call_frame: &CallFrame, user_data: &UserData<'_>) -> Self {
        Self {
            args: call_frame.args().to_vec(),
            temp_buffer: user_data.get::<TempBuffer>().map(|temp| temp.0),
            has_run_options: user_data.contains::<RunOptions>(),
            has_debug_options: user_data.contains::<DebugOptions>(),
            has_artifacts: user_data.contains::<ExecutableArtifacts>(),
            has_executable: user_data.contains::<RuntimeGpuExecutable>(),
            has_gemm_configs: user_data.contains::<GemmConfigCache>(),
            has_kernels_cache: user_data.contains::<KernelsCache>(),
            has_collectives: user_data.contains::<CollectiveSupport>(),
            has_async_collectives: user_data.contains::<AsyncCollectiveSupport>(),
        }
    }
}

/// Entry point that records every invocation and optionally fails.
pub struct RecordingExecutable {
    entry_point: String,
    obj_file: Vec<u8>,
    fail_with: Option<ExecError>,
    invocations: Arc<Mutex<Vec<RuntimeInvocation>>>,
}

impl RuntimeExecutable for RecordingExecutable {
    fn execute(&self, call_frame: &mut CallFrame, user_data: &UserData<'_>) -> ExecResult<()> {
        self.invocations
            .lock()
            .expect("runtime log poisoned")
            .push(RuntimeInvocation::capture(call_frame, user_data));
        log::trace!("recorded invocation of {}", self.entry_point);
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn obj_file(&self) -> Option<Vec<u8>> {
        Some(self.obj_file.clone())
    }
}

/// Compiler and loader whose executables record their invocations.
#[derive(Default)]
pub struct RecordingRuntime {
    invocations: Arc<Mutex<Vec<RuntimeInvocation>>>,
    compilations: AtomicUsize,
    loads: Mutex<Vec<(String, Vec<u8>, Vec<u64>)>>,
    fail_with: Option<ExecError>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every compiled or loaded entry point fails with `err`.
    pub fn failing(err: ExecError) -> Self {
        Self {
            fail_with: Some(err),
            ..Self::default()
        }
    }

    pub fn invocations(&self) -> Vec<RuntimeInvocation> {
        self.invocations.lock().expect("runtime log poisoned").clone()
    }

    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    /// `(entry point, object file, buffer sizes)` of every load.
    pub fn loads(&self) -> Vec<(String, Vec<u8>, Vec<u64>)> {
        self.loads.lock().expect("runtime log poisoned").clone()
    }

    fn executable(&self, entry_point: &str, obj_file: Vec<u8>) -> Arc<dyn RuntimeExecutable> {
        Arc::new(RecordingExecutable {
            entry_point: entry_point.to_string(),
            obj_file,
            fail_with: self.fail_with.clone(),
            invocations: Arc::clone(&self.invocations),
        })
    }
}

impl RuntimeCompiler for RecordingRuntime {
    fn compile(&self, program: &RuntimeProgram) -> ExecResult<Arc<dyn RuntimeExecutable>> {
        self.compilations.fetch_add(1, Ordering::SeqCst);
        Ok(self.executable(&program.entry_point, program.module.as_bytes().to_vec()))
    }
}

impl RuntimeLoader for RecordingRuntime {
    fn load(
        &self,
        entry_point: &str,
        obj_file: &[u8],
        buffer_sizes: &[u64],
    ) -> ExecResult<Arc<dyn RuntimeExecutable>> {
        self.loads.lock().expect("runtime log poisoned").push((
            entry_point.to_string(),
            obj_file.to_vec(),
            buffer_sizes.to_vec(),
        ));
        Ok(self.executable(entry_point, obj_file.to_vec()))
    }
}
