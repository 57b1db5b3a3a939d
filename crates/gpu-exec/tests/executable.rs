use std::sync::Arc;

use gpu_exec::{
    AliasConfig, AliasKind, AllocationKind, BufferAllocation, ConstantInfo, DebugOptions,
    ErrorCode, ExecResult, ExecutionInput, ExecutionOutput, ExecutionProfile, GpuExecutable,
    GpuExecutableParams, GpuVersion, OutputInfo, PlatformKind, RunOptions, Shape, ShapeIndex,
    ThunkSequence,
};
use gpu_exec_backend_tests::{
    aliased_parameter_program, bytes_to_int32, fresh_output_program, host_gpu_version, int32_bytes,
    s32_vector, shaped_buffer, HostDevice, StreamOp,
};

fn donated_input(device: &HostDevice, values: &[i32]) -> ExecResult<ExecutionInput> {
    let buffer = device.upload(&int32_bytes(values))?;
    let mut input = ExecutionInput::new(s32_vector(4));
    input.set_buffer(&ShapeIndex::root(), buffer)?;
    Ok(input)
}

fn execute_donated(
    executable: &GpuExecutable,
    device: &HostDevice,
    options: &RunOptions,
) -> ExecResult<ExecutionOutput> {
    let mut inputs = vec![donated_input(device, &[1, 2, 3, 4])?];
    executable.execute_async_on_stream(options, &mut inputs)
}

fn root_address(input: &ExecutionInput) -> u64 {
    input
        .buffer(&ShapeIndex::root())
        .map(|buffer| buffer.as_device_memory().opaque())
        .unwrap_or_default()
}

#[test]
fn donated_must_alias_parameter_becomes_the_output() {
    let device = HostDevice::new();
    let executable = GpuExecutable::create(aliased_parameter_program(AliasKind::MustAlias))
        .expect("aliased program is valid");
    let mut inputs = vec![donated_input(&device, &[1, 2, 3, 4]).expect("upload")];
    let donated = root_address(&inputs[0]);

    let output = executable
        .execute_async_on_stream(&device.run_options(), &mut inputs)
        .expect("execute");

    assert_eq!(output.result().root_buffer().opaque(), donated);
    assert_eq!(output.aliased_indices(), [ShapeIndex::root()]);
    assert!(output.to_be_released().is_empty(), "the donation was consumed");
    assert!(!inputs[0].buffer(&ShapeIndex::root()).expect("root").has_ownership());

    let result = output.commit();
    let contents = device.download(result.root_buffer()).expect("download");
    assert_eq!(bytes_to_int32(&contents), [1, 2, 3, 4]);

    drop(result);
    drop(inputs);
    assert_eq!(device.allocator.live_count(), 0);
    assert_eq!(device.allocator.double_free_count(), 0);
}

#[test]
fn must_alias_without_donation_is_invalid_argument() {
    let device = HostDevice::new();
    let executable = GpuExecutable::create(aliased_parameter_program(AliasKind::MustAlias))
        .expect("aliased program is valid");
    let buffer = device.upload(&int32_bytes(&[1, 2, 3, 4])).expect("upload");
    let argument = shaped_buffer(s32_vector(4), buffer.as_device_memory());

    let err = executable
        .execute_async_on_stream_unowned(&device.run_options(), &[&argument])
        .expect_err("read-only arguments cannot be donated");
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(err.message().contains("must-alias"));

    let mut borrowed = vec![ExecutionInput::borrowed(&argument)];
    let err = executable
        .execute_async_on_stream(&device.run_options(), &mut borrowed)
        .expect_err("borrowed inputs are not donations");
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    drop(buffer);
    assert_eq!(device.allocator.live_count(), 0);
}

#[test]
fn may_alias_without_donation_copies_the_parameter() {
    let device = HostDevice::new();
    let executable = GpuExecutable::create(aliased_parameter_program(AliasKind::MayAlias))
        .expect("aliased program is valid");
    let buffer = device.upload(&int32_bytes(&[1, 2, 3, 4])).expect("upload");
    let argument = shaped_buffer(s32_vector(4), buffer.as_device_memory());

    let result = executable
        .execute_async_on_stream_unowned(&device.run_options(), &[&argument])
        .expect("execute");

    assert_ne!(result.root_buffer(), buffer.as_device_memory());
    assert!(result.is_owned(&ShapeIndex::root()));
    let contents = device.download(result.root_buffer()).expect("download");
    assert_eq!(bytes_to_int32(&contents), [1, 2, 3, 4]);
    assert_eq!(
        device
            .stream
            .count(|op| matches!(op, StreamOp::DeviceToDevice { size: 16, .. })),
        1
    );

    drop(result);
    assert_eq!(device.allocator.live_count(), 1, "only the caller's buffer is left");
    assert_eq!(device.allocator.double_free_count(), 0);
}

#[test]
fn may_alias_with_donation_reuses_the_parameter() {
    let device = HostDevice::new();
    let executable = GpuExecutable::create(aliased_parameter_program(AliasKind::MayAlias))
        .expect("aliased program is valid");
    let mut inputs = vec![donated_input(&device, &[5, 6, 7, 8]).expect("upload")];
    let donated = root_address(&inputs[0]);

    let result = executable
        .execute_async_on_stream(&device.run_options(), &mut inputs)
        .expect("execute")
        .commit();

    assert_eq!(result.root_buffer().opaque(), donated);
    assert_eq!(device.stream.count(|op| matches!(op, StreamOp::DeviceToDevice { .. })), 0);
    drop(result);
    assert_eq!(device.allocator.live_count(), 0);
}

#[test]
fn uncommitted_output_does_not_free_donated_storage() {
    let device = HostDevice::new();
    let executable = GpuExecutable::create(aliased_parameter_program(AliasKind::MustAlias))
        .expect("aliased program is valid");
    let mut inputs = vec![donated_input(&device, &[1, 2, 3, 4]).expect("upload")];
    let donated = root_address(&inputs[0]);

    let output = executable
        .execute_async_on_stream(&device.run_options(), &mut inputs)
        .expect("execute");
    drop(output);

    let memory = inputs[0]
        .buffer(&ShapeIndex::root())
        .expect("root")
        .as_device_memory();
    assert_eq!(memory.opaque(), donated);
    assert!(device.allocator.is_live(memory));
    assert_eq!(device.allocator.double_free_count(), 0);
}

/// Leaf {0} may alias parameter 0, leaf {1} must alias parameter 1.
fn two_parameter_tuple_program() -> GpuExecutableParams {
    GpuExecutableParams::new(
        "two_parameter_tuple",
        host_gpu_version(),
        Shape::tuple(vec![s32_vector(4), s32_vector(4)]),
    )
    .with_allocations(vec![
        BufferAllocation::entry_parameter(0, 16, 0, ShapeIndex::root(), true),
        BufferAllocation::entry_parameter(1, 16, 1, ShapeIndex::root(), true),
    ])
    .with_output(
        [0],
        OutputInfo::new(0).with_alias(AliasConfig::new(0, ShapeIndex::root(), AliasKind::MayAlias)),
    )
    .with_output(
        [1],
        OutputInfo::new(1).with_alias(AliasConfig::new(1, ShapeIndex::root(), AliasKind::MustAlias)),
    )
    .with_thunks(ThunkSequence::default())
}

#[test]
fn failed_alias_check_hands_earlier_donations_back() {
    let device = HostDevice::new();
    let executable =
        GpuExecutable::create(two_parameter_tuple_program()).expect("tuple program is valid");
    let kept = device.upload(&int32_bytes(&[5, 6, 7, 8])).expect("upload");
    let mut inputs = vec![
        donated_input(&device, &[1, 2, 3, 4]).expect("upload"),
        ExecutionInput::borrowed(&shaped_buffer(s32_vector(4), kept.as_device_memory())),
    ];
    let donated = root_address(&inputs[0]);

    let err = executable
        .execute_async_on_stream(&device.run_options(), &mut inputs)
        .expect_err("parameter 1 is not donated");

    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    let slot = inputs[0].buffer(&ShapeIndex::root()).expect("root");
    assert!(slot.has_ownership(), "the caller owns its donation again");
    assert_eq!(slot.as_device_memory().opaque(), donated);
    assert_eq!(device.allocator.live_count(), 2);

    drop(inputs);
    drop(kept);
    assert_eq!(device.allocator.live_count(), 0);
    assert_eq!(device.allocator.double_free_count(), 0);
}

#[test]
fn failed_run_hands_donations_back() {
    let device = HostDevice::build(|executor| executor, |allocator| allocator.synchronous());
    device.stream.fail_blocks();
    let executable = GpuExecutable::create(aliased_parameter_program(AliasKind::MustAlias))
        .expect("aliased program is valid");
    let mut inputs = vec![donated_input(&device, &[1, 2, 3, 4]).expect("upload")];
    let donated = root_address(&inputs[0]);

    let err = executable
        .execute_async_on_stream(&device.run_options(), &mut inputs)
        .expect_err("device failed");

    assert_eq!(err.code(), ErrorCode::Internal);
    let slot = inputs[0].buffer(&ShapeIndex::root()).expect("root");
    assert!(slot.has_ownership());
    assert_eq!(slot.as_device_memory().opaque(), donated);

    drop(inputs);
    assert_eq!(device.allocator.live_count(), 0);
    assert_eq!(device.allocator.double_free_count(), 0);
}

#[test]
fn passthrough_parameter_is_returned_without_a_copy() {
    let device = HostDevice::new();
    let executable = GpuExecutable::create(
        GpuExecutableParams::new("passthrough", host_gpu_version(), s32_vector(4))
            .with_allocations(vec![BufferAllocation::entry_parameter(
                0,
                16,
                0,
                ShapeIndex::root(),
                true,
            )])
            .with_output(
                ShapeIndex::root(),
                OutputInfo::new(0)
                    .with_alias(AliasConfig::new(0, ShapeIndex::root(), AliasKind::MayAlias))
                    .with_passthrough(true),
            )
            .with_thunks(ThunkSequence::default()),
    )
    .expect("passthrough program is valid");
    let buffer = device.upload(&int32_bytes(&[1, 2, 3, 4])).expect("upload");
    let argument = shaped_buffer(s32_vector(4), buffer.as_device_memory());

    let result = executable
        .execute_async_on_stream_unowned(&device.run_options(), &[&argument])
        .expect("execute");

    assert_eq!(result.root_buffer(), buffer.as_device_memory());
    assert!(!result.is_owned(&ShapeIndex::root()), "caller storage stays with the caller");
    drop(result);
    assert!(device.allocator.is_live(buffer.as_device_memory()));
}

#[test]
fn donated_inputs_that_are_not_outputs_are_released_with_the_output() {
    let device = HostDevice::new();
    let executable =
        GpuExecutable::create(fresh_output_program()).expect("fresh output program is valid");
    let mut inputs = vec![donated_input(&device, &[1, 2, 3, 4]).expect("upload")];
    let donated = root_address(&inputs[0]);

    let mut output = executable
        .execute_async_on_stream(&device.run_options(), &mut inputs)
        .expect("execute");

    assert_eq!(output.to_be_released().len(), 1);
    assert_eq!(output.to_be_released()[0].as_device_memory().opaque(), donated);
    assert!(output.aliased_indices().is_empty());
    assert!(output.is_owned(&ShapeIndex::root()));

    let released = output.take_to_be_released();
    assert!(output.to_be_released().is_empty());
    drop(released);
    drop(output);
    assert_eq!(device.allocator.live_count(), 0);
    assert_eq!(device.allocator.double_free_count(), 0);
}

#[test]
fn empty_binary_without_constants_loads_no_module() {
    let device = HostDevice::new();
    let executable =
        GpuExecutable::create(fresh_output_program()).expect("fresh output program is valid");

    let output = execute_donated(&executable, &device, &device.run_options()).expect("execute");

    assert_eq!(device.executor.load_count(), 0);
    assert_eq!(output.result().root_buffer().size(), 16);
}

#[test]
fn constants_are_bound_before_the_program_runs() {
    let device = HostDevice::build(|executor| executor.with_module_global("weights", 64), |a| a);
    let mut params = fresh_output_program()
        .with_binary(b"cubin".to_vec())
        .with_constants(vec![ConstantInfo::new("weights", vec![3u8; 64], Some(3))]);
    params
        .allocations
        .push(BufferAllocation::new(3, 64, AllocationKind::Constant));
    let executable = GpuExecutable::create(params).expect("program with constants is valid");

    execute_donated(&executable, &device, &device.run_options()).expect("first run");
    execute_donated(&executable, &device, &device.run_options()).expect("second run");

    assert_eq!(device.executor.load_count(), 1);
    assert_eq!(
        device
            .stream
            .count(|op| matches!(op, StreamOp::HostToDevice { len: 64, .. })),
        1,
        "constants are uploaded once per context"
    );
}

#[test]
fn compute_capability_mismatch_is_internal() {
    let device = HostDevice::build(
        |executor| executor.with_platform(PlatformKind::Cuda, GpuVersion::cuda(9, 0)),
        |a| a,
    );
    let executable =
        GpuExecutable::create(fresh_output_program()).expect("fresh output program is valid");

    let err = execute_donated(&executable, &device, &device.run_options())
        .expect_err("compiled for sm_80");

    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.message().contains("compute capability mismatch"));
    assert!(err.message().contains("sm_80"));
    assert!(err.message().contains("sm_90"));
    assert_eq!(device.allocator.allocation_count(), 1, "only the caller's upload");
}

#[test]
fn gcn_arch_mismatch_is_internal() {
    let device = HostDevice::build(
        |executor| executor.with_platform(PlatformKind::Rocm, GpuVersion::rocm("gfx908")),
        |a| a,
    );
    let mut params = fresh_output_program();
    params.gpu_version = GpuVersion::rocm("gfx90a");
    let executable = GpuExecutable::create(params).expect("rocm program is valid");

    let err = execute_donated(&executable, &device, &device.run_options())
        .expect_err("compiled for gfx90a");

    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.message().contains("AMDGPU GCN ISA version mismatch"));
    assert!(err.message().contains("gfx908"));
}

#[test]
fn host_platform_is_rejected() {
    let device = HostDevice::build(
        |executor| executor.with_platform(PlatformKind::Host, host_gpu_version()),
        |a| a,
    );
    let executable =
        GpuExecutable::create(fresh_output_program()).expect("fresh output program is valid");

    let err = execute_donated(&executable, &device, &device.run_options())
        .expect_err("host is not a gpu platform");

    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.message().contains("unknown platform"));
}

#[test]
fn profile_records_host_observed_time() {
    let device = HostDevice::new();
    let executable =
        GpuExecutable::create(fresh_output_program()).expect("fresh output program is valid");
    let profile = Arc::new(ExecutionProfile::new());
    let options = device.run_options().with_execution_profile(Arc::clone(&profile));

    execute_donated(&executable, &device, &options).expect("first run");
    execute_donated(&executable, &device, &options).expect("second run");

    assert!(profile.compute_time_ns() >= 1);
    assert_eq!(profile.executions(), 2);
}

fn block_count(device: &HostDevice) -> usize {
    device
        .stream
        .count(|op| matches!(op, StreamOp::BlockHostUntilDone))
}

#[test]
fn asynchronous_allocator_does_not_block() {
    let device = HostDevice::new();
    let executable =
        GpuExecutable::create(fresh_output_program()).expect("fresh output program is valid");

    execute_donated(&executable, &device, &device.run_options()).expect("execute");

    assert_eq!(block_count(&device), 0);
}

#[test]
fn synchronous_allocator_blocks_after_the_run() {
    let device = HostDevice::build(|executor| executor, |allocator| allocator.synchronous());
    let executable =
        GpuExecutable::create(fresh_output_program()).expect("fresh output program is valid");

    execute_donated(&executable, &device, &device.run_options()).expect("execute");

    assert_eq!(block_count(&device), 1);
}

#[test]
fn force_synchronous_blocks_after_the_run() {
    let device = HostDevice::new();
    let executable = GpuExecutable::create(fresh_output_program().with_debug_options(
        DebugOptions {
            force_synchronous: true,
            ..DebugOptions::default()
        },
    ))
    .expect("fresh output program is valid");

    execute_donated(&executable, &device, &device.run_options()).expect("execute");

    assert_eq!(block_count(&device), 1);
}

#[test]
fn failed_synchronization_is_internal() {
    let device = HostDevice::build(|executor| executor, |allocator| allocator.synchronous());
    device.stream.fail_blocks();
    let executable =
        GpuExecutable::create(fresh_output_program()).expect("fresh output program is valid");
    let profile = Arc::new(ExecutionProfile::new());
    let options = device.run_options().with_execution_profile(Arc::clone(&profile));

    let err = execute_donated(&executable, &device, &options).expect_err("device failed");

    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err
        .message()
        .contains("Failed to complete all kernels launched on stream"));
    assert!(err.message().contains("illegal address"));
    assert_eq!(profile.executions(), 0);
}

#[test]
fn allocation_failure_reports_the_buffer_assignment() {
    let device = HostDevice::new();
    device.allocator.fail_after(1);
    let executable = GpuExecutable::create(
        fresh_output_program().with_buffer_assignment_dumper(|| "temp 1 is 16 bytes".to_string()),
    )
    .expect("fresh output program is valid");

    let err = execute_donated(&executable, &device, &device.run_options())
        .expect_err("only the input fits");

    assert_eq!(err.code(), ErrorCode::ResourceExhausted);
    assert!(err.message().contains("out of memory allocating 16 bytes"));
    assert!(err.message().contains("temp 1 is 16 bytes"));
    assert_eq!(device.allocator.live_count(), 0);
}

#[test]
fn buffer_assignment_dump_can_be_disabled() {
    let disabled = GpuExecutable::create(fresh_output_program().with_debug_options(
        DebugOptions {
            dump_buffer_assignment_on_oom: false,
            ..DebugOptions::default()
        },
    ))
    .expect("fresh output program is valid");
    assert_eq!(disabled.buffer_assignment_dump(), "buffer assignment dump disabled");

    let described =
        GpuExecutable::create(fresh_output_program()).expect("fresh output program is valid");
    let dump = described.buffer_assignment_dump();
    assert!(dump.starts_with("buffer assignment: 3 allocations, 48 bytes"));
    assert!(dump.contains("allocation 2: size 16, maybe-live-out"));
}

#[test]
fn generated_code_size_counts_binary_and_constants() {
    let text_only = GpuExecutable::create(fresh_output_program().with_asm_text("// ptx"))
        .expect("fresh output program is valid");
    assert_eq!(text_only.size_of_generated_code_in_bytes(), None);

    let mut params = fresh_output_program()
        .with_asm_text("// ptx")
        .with_binary(vec![0u8; 100]);
    params
        .allocations
        .push(BufferAllocation::new(3, 64, AllocationKind::Constant));
    let compiled = GpuExecutable::create(params).expect("compiled program is valid");
    assert_eq!(compiled.size_of_generated_code_in_bytes(), Some(164));
    assert_eq!(compiled.text(), "// ptx");
    assert_eq!(compiled.binary().len(), 100);
}

#[test]
fn alias_must_name_the_parameter_behind_the_allocation() {
    let params = aliased_parameter_program(AliasKind::MayAlias).with_output(
        ShapeIndex::root(),
        OutputInfo::new(0).with_alias(AliasConfig::new(1, ShapeIndex::root(), AliasKind::MayAlias)),
    );

    let err = GpuExecutable::create(params).expect_err("allocation 0 holds parameter 0");

    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.message().contains("aliases parameter 1"));
}

#[test]
fn alias_on_a_fresh_allocation_is_rejected() {
    let params = fresh_output_program().with_output(
        ShapeIndex::root(),
        OutputInfo::new(2).with_alias(AliasConfig::new(0, ShapeIndex::root(), AliasKind::MayAlias)),
    );

    let err = GpuExecutable::create(params).expect_err("allocation 2 is not a parameter");
    assert_eq!(err.code(), ErrorCode::Internal);
}

#[test]
fn output_info_must_match_shape_and_allocations() {
    let outside_shape = fresh_output_program().with_output([0], OutputInfo::new(2));
    let err = GpuExecutable::create(outside_shape).expect_err("s32[4] has no index {0}");
    assert_eq!(err.code(), ErrorCode::Internal);

    let missing_allocation =
        fresh_output_program().with_output(ShapeIndex::root(), OutputInfo::new(9));
    let err = GpuExecutable::create(missing_allocation).expect_err("allocation 9 does not exist");
    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.message().contains("only 3 exist"));
}
