//! The compiled GPU program and the per-invocation orchestration around it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::allocation::{describe_allocations, AllocationKind, BufferAllocation};
use crate::arguments::{Arguments, ExecutionInput, ShapedBuffer};
use crate::buffer_allocations::BufferAllocations;
use crate::constants::{ConstantInfo, ConstantResolver};
use crate::device::{lock_device_shared, GpuVersion, PlatformKind, StreamExecutor};
use crate::dispatch::{Dispatch, ExecutableVariant};
use crate::env::DebugOptions;
use crate::error::{ExecError, ExecResult};
use crate::output::{ExecutionOutput, OutputAssembler, OutputInfo, ScopedShapedBuffer};
use crate::run_options::RunOptions;
use crate::runtime::{
    EntrySignature, ExecutableArtifacts, RuntimeArtifact, RuntimeGpuExecutable, RuntimeLoader,
    RuntimeProgram,
};
use crate::shape::{Shape, ShapeIndex};
use crate::thunk::ThunkSequence;

pub type BufferAssignmentDumper = Box<dyn Fn() -> String + Send + Sync>;

/// Compilation outputs an executable is built from.
pub struct GpuExecutableParams {
    pub module_name: String,
    pub asm_text: String,
    pub binary: Vec<u8>,
    pub gpu_version: GpuVersion,
    pub thunks: Option<ThunkSequence>,
    pub runtime: Option<RuntimeGpuExecutable>,
    pub constants: Vec<ConstantInfo>,
    pub output_shape: Shape,
    pub output_info: BTreeMap<ShapeIndex, OutputInfo>,
    pub allocations: Vec<BufferAllocation>,
    pub debug_options: DebugOptions,
    /// Produces the verbose description attached to allocation failures.
    pub buffer_assignment_dumper: Option<BufferAssignmentDumper>,
}

impl GpuExecutableParams {
    pub fn new(module_name: impl Into<String>, gpu_version: GpuVersion, output_shape: Shape) -> Self {
        Self {
            module_name: module_name.into(),
            asm_text: String::new(),
            binary: Vec::new(),
            gpu_version,
            thunks: None,
            runtime: None,
            constants: Vec::new(),
            output_shape,
            output_info: BTreeMap::new(),
            allocations: Vec::new(),
            debug_options: DebugOptions::default(),
            buffer_assignment_dumper: None,
        }
    }

    pub fn with_asm_text(mut self, asm_text: impl Into<String>) -> Self {
        self.asm_text = asm_text.into();
        self
    }

    pub fn with_binary(mut self, binary: Vec<u8>) -> Self {
        self.binary = binary;
        self
    }

    pub fn with_thunks(mut self, thunks: ThunkSequence) -> Self {
        self.thunks = Some(thunks);
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeGpuExecutable) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_constants(mut self, constants: Vec<ConstantInfo>) -> Self {
        self.constants = constants;
        self
    }

    pub fn with_allocations(mut self, allocations: Vec<BufferAllocation>) -> Self {
        self.allocations = allocations;
        self
    }

    pub fn with_output(mut self, index: impl Into<ShapeIndex>, info: OutputInfo) -> Self {
        self.output_info.insert(index.into(), info);
        self
    }

    pub fn with_output_info(mut self, output_info: BTreeMap<ShapeIndex, OutputInfo>) -> Self {
        self.output_info = output_info;
        self
    }

    pub fn with_debug_options(mut self, debug_options: DebugOptions) -> Self {
        self.debug_options = debug_options;
        self
    }

    pub fn with_buffer_assignment_dumper(
        mut self,
        dumper: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.buffer_assignment_dumper = Some(Box::new(dumper));
        self
    }
}

/// A compiled program that runs on one GPU architecture.
pub struct GpuExecutable {
    module_name: String,
    artifacts: ExecutableArtifacts,
    gpu_version: GpuVersion,
    variant: ExecutableVariant,
    constants: ConstantResolver,
    output_shape: Shape,
    output_info: BTreeMap<ShapeIndex, OutputInfo>,
    allocations: Vec<BufferAllocation>,
    debug_options: DebugOptions,
    buffer_assignment_dumper: Option<BufferAssignmentDumper>,
}

impl GpuExecutable {
    pub fn create(params: GpuExecutableParams) -> ExecResult<Self> {
        let GpuExecutableParams {
            module_name,
            asm_text,
            binary,
            gpu_version,
            thunks,
            runtime,
            constants,
            output_shape,
            output_info,
            allocations,
            debug_options,
            buffer_assignment_dumper,
        } = params;

        let variant = ExecutableVariant::select(thunks, runtime, &debug_options)?;
        validate_output_info(&output_shape, &output_info, &allocations)?;

        let artifacts = ExecutableArtifacts {
            text: Arc::from(asm_text),
            binary: Arc::from(binary),
        };
        let constants = ConstantResolver::new(
            Arc::clone(&artifacts.binary),
            Arc::clone(&artifacts.text),
            constants,
        );
        log::debug!(
            "created gpu executable {module_name} for {gpu_version} ({} mode, {} allocations)",
            variant.name(),
            allocations.len()
        );

        Ok(Self {
            module_name,
            artifacts,
            gpu_version,
            variant,
            constants,
            output_shape,
            output_info,
            allocations,
            debug_options,
            buffer_assignment_dumper,
        })
    }

    /// Rebuilds an executable from an ahead-of-time compiled runtime program.
    pub fn load_from_obj_file(
        artifact: RuntimeArtifact,
        loader: &dyn RuntimeLoader,
    ) -> ExecResult<Self> {
        let RuntimeArtifact {
            module_name,
            entry_point,
            obj_file,
            runtime_module,
            asm_text,
            binary,
            gpu_version,
            debug_options,
        } = artifact;

        let signature = EntrySignature::parse(&runtime_module)?;
        let layout = signature.layout()?;
        let executable = loader
            .load(&entry_point, &obj_file, &layout.buffer_sizes)
            .map_err(|err| {
                ExecError::internal(format!("failed to load runtime executable: {err}"))
            })?;

        let program = RuntimeProgram {
            entry_point,
            module: runtime_module,
            buffer_sizes: layout.buffer_sizes,
            debug_options: debug_options.clone(),
        };
        let runtime = RuntimeGpuExecutable::aot(program, executable, obj_file);

        Self::create(
            GpuExecutableParams::new(module_name, gpu_version, signature.result_shape)
                .with_asm_text(asm_text)
                .with_binary(binary)
                .with_runtime(runtime)
                .with_constants(layout.constants)
                .with_allocations(layout.allocations)
                .with_output_info(layout.output_info)
                .with_debug_options(debug_options),
        )
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn text(&self) -> &str {
        &self.artifacts.text
    }

    pub fn binary(&self) -> &[u8] {
        &self.artifacts.binary
    }

    pub fn gpu_version(&self) -> &GpuVersion {
        &self.gpu_version
    }

    pub fn variant(&self) -> &ExecutableVariant {
        &self.variant
    }

    pub fn thunks(&self) -> Option<&ThunkSequence> {
        self.variant.thunks()
    }

    pub fn constants(&self) -> &ConstantResolver {
        &self.constants
    }

    pub fn allocations(&self) -> &[BufferAllocation] {
        &self.allocations
    }

    pub fn output_shape(&self) -> &Shape {
        &self.output_shape
    }

    pub fn output_info(&self) -> &BTreeMap<ShapeIndex, OutputInfo> {
        &self.output_info
    }

    pub fn debug_options(&self) -> &DebugOptions {
        &self.debug_options
    }

    /// Binary size plus constant storage; `None` when text exists but no binary was produced.
    pub fn size_of_generated_code_in_bytes(&self) -> Option<u64> {
        if self.artifacts.binary.is_empty() && !self.artifacts.text.is_empty() {
            return None;
        }
        let constants: u64 = self
            .allocations
            .iter()
            .filter(|allocation| allocation.is_constant())
            .map(BufferAllocation::size)
            .sum();
        Some(self.artifacts.binary.len() as u64 + constants)
    }

    pub fn obj_file(&self) -> ExecResult<Vec<u8>> {
        self.runtime_executable()?.obj_file()
    }

    pub fn runtime_module(&self) -> ExecResult<String> {
        Ok(self.runtime_executable()?.program().module.clone())
    }

    fn runtime_executable(&self) -> ExecResult<&RuntimeGpuExecutable> {
        self.variant.runtime().ok_or_else(|| {
            ExecError::internal(format!(
                "{} runs a thunk sequence and has no runtime executable",
                self.module_name
            ))
        })
    }

    /// Drops compile-time bookkeeping held by the thunks.
    pub fn clear_compile_time_info(&mut self) {
        if let ExecutableVariant::Thunks(thunks) = &mut self.variant {
            thunks.clear_compile_time_info();
        }
    }

    pub fn buffer_assignment_dump(&self) -> String {
        if !self.debug_options.dump_buffer_assignment_on_oom {
            return "buffer assignment dump disabled".to_string();
        }
        match &self.buffer_assignment_dumper {
            Some(dumper) => dumper(),
            None => describe_allocations(&self.allocations),
        }
    }

    /// Runs the program with donatable inputs.
    ///
    /// Sub-buffers the caller still owns after the call are moved into the output's
    /// to-be-released list.
    pub fn execute_async_on_stream(
        &self,
        run_options: &RunOptions,
        arguments: &mut [ExecutionInput],
    ) -> ExecResult<ExecutionOutput> {
        self.execute_impl(run_options, Arguments::Donatable(arguments))
    }

    /// Runs the program with read-only caller buffers.
    pub fn execute_async_on_stream_unowned(
        &self,
        run_options: &RunOptions,
        arguments: &[&ShapedBuffer],
    ) -> ExecResult<ScopedShapedBuffer> {
        let output = self.execute_impl(run_options, Arguments::Unowned(arguments))?;
        Ok(output.commit())
    }

    fn execute_impl(
        &self,
        run_options: &RunOptions,
        mut arguments: Arguments<'_>,
    ) -> ExecResult<ExecutionOutput> {
        let stream = run_options.stream.as_ref();
        let executor = stream.executor();
        self.check_compatibility(executor.as_ref())?;

        let _device_lock = lock_device_shared(executor.as_ref())?;
        let globals = self.constants.resolve(stream)?;

        let device_ordinal = executor.device_ordinal();
        let allocator = &run_options.allocator;
        let dump = || self.buffer_assignment_dump();
        let mut buffer_allocations = BufferAllocations::generate(
            &self.allocations,
            &arguments,
            globals.globals(),
            allocator,
            device_ordinal,
            &dump,
        )?;
        log::trace!("{} {buffer_allocations}", self.module_name);

        let block_host_until_done =
            !allocator.allows_asynchronous_deallocation() || self.debug_options.force_synchronous;

        let assembler = OutputAssembler {
            output_shape: &self.output_shape,
            output_info: &self.output_info,
            allocations: &self.allocations,
            stream,
            allocator,
            device_ordinal,
            buffer_assignment_dump: &dump,
        };
        let (mut output, live) = assembler.assemble(&mut arguments, &mut buffer_allocations)?;

        log::debug!(
            "executing {} ({}) on device {device_ordinal}",
            self.module_name,
            self.variant.name()
        );
        let mut status = Dispatch {
            run_options,
            buffer_allocations: &buffer_allocations,
            allocations: &self.allocations,
            artifacts: &self.artifacts,
            block_host_until_done,
        }
        .run(&self.variant);
        if status.is_ok() {
            status = buffer_allocations.tear_down(&live);
        }
        if let Err(err) = status {
            output.return_donations(&mut arguments);
            return Err(err);
        }

        if let Arguments::Donatable(inputs) = &mut arguments {
            for input in inputs.iter_mut() {
                output.add_to_be_released(input.take_owned_buffers());
            }
        }
        Ok(output)
    }

    fn check_compatibility(&self, executor: &dyn StreamExecutor) -> ExecResult<()> {
        let platform = executor.platform_kind();
        if platform == PlatformKind::Host {
            return Err(ExecError::internal(format!("unknown platform: {platform:?}")));
        }
        let device_version = executor.gpu_version();
        match (&self.gpu_version, &device_version) {
            (GpuVersion::Cuda(expected), GpuVersion::Cuda(actual)) if expected == actual => Ok(()),
            (GpuVersion::Rocm(expected), GpuVersion::Rocm(actual)) if expected == actual => Ok(()),
            (GpuVersion::Cuda(_), _) => Err(ExecError::internal(format!(
                "compute capability mismatch; expected {{{}}}, but was {{{}}}",
                self.gpu_version, device_version
            ))),
            (GpuVersion::Rocm(_), _) => Err(ExecError::internal(format!(
                "AMDGPU GCN ISA version mismatch; expected {{{}}}, but was {{{}}}",
                self.gpu_version, device_version
            ))),
        }
    }
}

impl fmt::Debug for GpuExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuExecutable")
            .field("module_name", &self.module_name)
            .field("gpu_version", &self.gpu_version)
            .field("variant", &self.variant)
            .field("allocations", &self.allocations.len())
            .field("output_shape", &self.output_shape)
            .finish()
    }
}

/// Every output must name an existing allocation, and aliases must name the parameter
/// that allocation holds.
fn validate_output_info(
    output_shape: &Shape,
    output_info: &BTreeMap<ShapeIndex, OutputInfo>,
    allocations: &[BufferAllocation],
) -> ExecResult<()> {
    for (index, info) in output_info {
        if output_shape.subshape(index).is_none() {
            return Err(ExecError::internal(format!(
                "output info for {index} does not match output shape {output_shape}"
            )));
        }
        let allocation = allocations.get(info.allocation_index).ok_or_else(|| {
            ExecError::internal(format!(
                "output {index} refers to allocation {} but only {} exist",
                info.allocation_index,
                allocations.len()
            ))
        })?;
        let Some(alias) = &info.alias_config else {
            continue;
        };
        match allocation.kind() {
            AllocationKind::EntryParameter {
                parameter_number,
                parameter_shape_index,
                ..
            } if *parameter_number == alias.parameter_number
                && *parameter_shape_index == alias.parameter_index => {}
            _ => {
                return Err(ExecError::internal(format!(
                    "output {index} aliases parameter {} {} but is backed by {allocation}",
                    alias.parameter_number, alias.parameter_index
                )))
            }
        }
    }
    Ok(())
}
