use std::sync::Arc;

use gpu_exec::device::LaunchDimensions;
use gpu_exec::thunk::{
    ConditionalThunk, DeviceToDeviceCopyThunk, ForThunk, KernelThunk, Memset32Thunk, MemzeroThunk,
    SequentialThunk, WhileThunk,
};
use gpu_exec::{
    DeviceMemoryBase, ErrorCode, ExecResult, GpuExecutable, Slice, StreamExecutor, Thunk,
    ThunkInfo, ThunkKind, ThunkSequence,
};
use gpu_exec_backend_tests::{
    bytes_to_int32, fresh_output_program, int32_bytes, logged, s32_vector, shaped_buffer,
    thunk_log, HostDevice, HostMemory, HostStreamBorrower, RecordingThunk, StreamOp, ThunkLog,
};

/// Scratch allocation 1 of the fresh-output program holds selectors and predicates.
const SELECTOR: Slice = Slice {
    index: 1,
    offset: 0,
    size: 4,
};
const PREDICATE: Slice = Slice {
    index: 1,
    offset: 8,
    size: 4,
};

fn recording(names: &[&str], log: &ThunkLog) -> ThunkSequence {
    names
        .iter()
        .map(|name| RecordingThunk::boxed(*name, log))
        .collect()
}

fn executable(thunks: ThunkSequence) -> GpuExecutable {
    GpuExecutable::create(fresh_output_program().with_thunks(thunks))
        .expect("fresh output program is valid")
}

fn run(executable: &GpuExecutable, device: &HostDevice) -> ExecResult<Vec<i32>> {
    let input = device.upload(&int32_bytes(&[1, 2, 3, 4]))?;
    let argument = shaped_buffer(s32_vector(4), input.as_device_memory());
    let result =
        executable.execute_async_on_stream_unowned(&device.run_options(), &[&argument])?;
    Ok(bytes_to_int32(&device.download(result.root_buffer())?))
}

#[test]
fn thunks_run_in_program_order() {
    let device = HostDevice::new();
    let log = thunk_log();
    let program = executable(recording(&["A", "B", "C"], &log));

    run(&program, &device).expect("execute");

    assert_eq!(logged(&log), ["A", "B", "C"]);
}

#[test]
fn concurrent_executables_keep_their_own_order() {
    let device = HostDevice::new();
    let first_log = thunk_log();
    let second_log = thunk_log();
    let first = executable(recording(&["A", "B", "C"], &first_log));
    let second = executable(recording(&["X", "Y"], &second_log));

    std::thread::scope(|scope| {
        let a = scope.spawn(|| run(&first, &device));
        let b = scope.spawn(|| run(&second, &device));
        a.join().expect("first thread panicked").expect("first run");
        b.join().expect("second thread panicked").expect("second run");
    });

    assert_eq!(logged(&first_log), ["A", "B", "C"]);
    assert_eq!(logged(&second_log), ["X", "Y"]);
    assert_eq!(device.allocator.live_count(), 0);
}

#[test]
fn out_of_range_selector_takes_the_last_branch() {
    let device = HostDevice::new();
    let log = thunk_log();
    let conditional = ConditionalThunk::new(
        ThunkInfo::new("select"),
        false,
        SELECTOR,
        vec![
            recording(&["branch0"], &log),
            recording(&["branch1"], &log),
            recording(&["branch2"], &log),
        ],
    )
    .expect("three s32 branches");
    let body = recording(&["loop"], &log);
    let thunks: ThunkSequence = vec![
        Box::new(Memset32Thunk::new(ThunkInfo::new("set"), 7, SELECTOR)) as Box<dyn Thunk>,
        Box::new(SequentialThunk::new(
            ThunkInfo::new("outer"),
            vec![
                Box::new(ForThunk::new(ThunkInfo::new("for"), 2, body)) as Box<dyn Thunk>,
                Box::new(conditional),
            ]
            .into_iter()
            .collect(),
        )),
    ]
    .into_iter()
    .collect();

    run(&executable(thunks), &device).expect("execute");

    assert_eq!(logged(&log), ["loop", "loop", "branch2"]);
}

#[test]
fn predicated_conditional_takes_the_first_branch_when_true() {
    let device = HostDevice::new();
    let log = thunk_log();
    let conditional = ConditionalThunk::new(
        ThunkInfo::new("if"),
        true,
        PREDICATE,
        vec![recording(&["then"], &log), recording(&["else"], &log)],
    )
    .expect("two predicated branches");
    let thunks: ThunkSequence = vec![
        Box::new(Memset32Thunk::new(ThunkInfo::new("true"), 1, PREDICATE)) as Box<dyn Thunk>,
        Box::new(conditional),
    ]
    .into_iter()
    .collect();

    run(&executable(thunks), &device).expect("execute");

    assert_eq!(logged(&log), ["then"]);
}

#[test]
fn predicated_conditional_rejects_three_branches() {
    let log = thunk_log();
    let result = ConditionalThunk::new(
        ThunkInfo::new("if"),
        true,
        PREDICATE,
        vec![
            recording(&["a"], &log),
            recording(&["b"], &log),
            recording(&["c"], &log),
        ],
    );
    let err = result.err().expect("bool selector needs two branches");
    assert_eq!(err.code(), ErrorCode::Internal);
}

#[test]
fn while_with_trip_count_skips_the_condition() {
    let device = HostDevice::new();
    let log = thunk_log();
    let while_thunk = WhileThunk::new(
        ThunkInfo::new("while"),
        PREDICATE,
        recording(&["cond"], &log),
        recording(&["body"], &log),
    )
    .with_trip_count(3);

    run(&executable(ThunkSequence::new(vec![Box::new(while_thunk)])), &device).expect("execute");

    assert_eq!(logged(&log), ["body", "body", "body"]);
}

#[test]
fn while_with_false_condition_never_runs_the_body() {
    let device = HostDevice::new();
    let log = thunk_log();
    let mut condition = recording(&["cond"], &log);
    condition.push(Box::new(MemzeroThunk::new(ThunkInfo::new("false"), PREDICATE)));
    let while_thunk = WhileThunk::new(
        ThunkInfo::new("while"),
        PREDICATE,
        condition,
        recording(&["body"], &log),
    );

    run(&executable(ThunkSequence::new(vec![Box::new(while_thunk)])), &device).expect("execute");

    assert_eq!(logged(&log), ["cond"]);
}

#[test]
fn flatten_lists_containers_before_their_contents() {
    let log = thunk_log();
    let body = recording(&["B"], &log);
    let outer = SequentialThunk::new(
        ThunkInfo::new("outer"),
        vec![
            RecordingThunk::boxed("A", &log),
            Box::new(ForThunk::new(ThunkInfo::new("loop"), 1, body)) as Box<dyn Thunk>,
        ]
        .into_iter()
        .collect(),
    );
    let sequence: ThunkSequence = vec![
        Box::new(outer) as Box<dyn Thunk>,
        RecordingThunk::boxed("C", &log),
    ]
    .into_iter()
    .collect();

    let annotations: Vec<_> = sequence
        .flatten()
        .iter()
        .map(|thunk| thunk.profile_annotation().to_string())
        .collect();

    assert_eq!(annotations, ["outer", "A", "loop", "B", "C"]);
    assert_eq!(sequence.len(), 2);
}

#[test]
fn clear_compile_time_info_reaches_nested_thunks() {
    let log = thunk_log();
    let inner: ThunkSequence = vec![
        Box::new(RecordingThunk::new("inner", &log).with_op_name("add.3")) as Box<dyn Thunk>,
    ]
    .into_iter()
    .collect();
    let thunks: ThunkSequence = vec![
        Box::new(SequentialThunk::new(
            ThunkInfo::new("outer").with_op_name("fusion.1"),
            inner,
        )) as Box<dyn Thunk>,
        Box::new(RecordingThunk::new("top", &log).with_op_name("copy.2")),
    ]
    .into_iter()
    .collect();
    let mut program = executable(thunks);

    program.clear_compile_time_info();

    let flattened = program.thunks().expect("thunk mode").flatten();
    assert_eq!(flattened.len(), 3);
    assert!(flattened.iter().all(|thunk| thunk.info().op_name.is_none()));
    assert_eq!(flattened[1].profile_annotation(), "inner");
}

fn async_collective(log: &ThunkLog) -> ThunkSequence {
    ThunkSequence::new(vec![Box::new(
        RecordingThunk::new("all-reduce-start", log).with_kind(ThunkKind::NcclAllReduceStart),
    )])
}

#[test]
fn async_collective_without_borrower_is_internal() {
    let device = HostDevice::new();
    let log = thunk_log();
    let program = executable(async_collective(&log));

    let err = run(&program, &device).expect_err("async collectives need a borrower");

    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.message().contains("stream borrower"));
    assert!(logged(&log).is_empty());
    assert_eq!(device.allocator.live_count(), 0, "failed runs release their buffers");
}

#[test]
fn async_collective_borrows_one_stream() -> anyhow::Result<()> {
    let device = HostDevice::new();
    let log = thunk_log();
    let program = executable(async_collective(&log));
    let borrower = Arc::new(HostStreamBorrower::new(Arc::clone(&device.executor)));
    let input = device.upload(&int32_bytes(&[1, 2, 3, 4]))?;
    let argument = shaped_buffer(s32_vector(4), input.as_device_memory());

    let options = device.run_options().with_stream_borrower(borrower.clone());
    program.execute_async_on_stream_unowned(&options, &[&argument])?;

    assert_eq!(logged(&log), ["all-reduce-start"]);
    assert_eq!(borrower.borrowed().len(), 1);
    Ok(())
}

#[test]
fn exhausted_borrower_fails_the_async_thunk() -> anyhow::Result<()> {
    let device = HostDevice::new();
    let log = thunk_log();
    let program = executable(async_collective(&log));
    let borrower = Arc::new(HostStreamBorrower::exhausted(Arc::clone(&device.executor)));
    let input = device.upload(&int32_bytes(&[1, 2, 3, 4]))?;
    let argument = shaped_buffer(s32_vector(4), input.as_device_memory());

    let options = device.run_options().with_stream_borrower(borrower);
    let err = program
        .execute_async_on_stream_unowned(&options, &[&argument])
        .expect_err("no stream could be borrowed");

    assert_eq!(err.code(), ErrorCode::Internal);
    Ok(())
}

#[test]
fn programs_without_async_collectives_borrow_nothing() -> anyhow::Result<()> {
    let device = HostDevice::new();
    let log = thunk_log();
    let program = executable(recording(&["A"], &log));
    let borrower = Arc::new(HostStreamBorrower::new(Arc::clone(&device.executor)));
    let input = device.upload(&int32_bytes(&[1, 2, 3, 4]))?;
    let argument = shaped_buffer(s32_vector(4), input.as_device_memory());

    let options = device.run_options().with_stream_borrower(borrower.clone());
    program.execute_async_on_stream_unowned(&options, &[&argument])?;

    assert!(borrower.borrowed().is_empty());
    Ok(())
}

fn add_one(memory: &HostMemory, args: &[DeviceMemoryBase]) -> ExecResult<()> {
    let input = bytes_to_int32(&memory.read(args[0], args[0].size() as usize)?);
    let output: Vec<i32> = input.iter().map(|value| value + 1).collect();
    memory.write(args[1], &int32_bytes(&output))
}

#[test]
fn kernel_thunk_loads_its_module_once_per_executor() {
    let device = HostDevice::build(|executor| executor.with_kernel("add_one", add_one), |a| a);
    let kernel = KernelThunk::new(
        ThunkInfo::new("add_one"),
        "add_one",
        vec![Slice::new(0, 0, 16), Slice::new(2, 0, 16)],
        LaunchDimensions::linear(1, 4),
    );
    let program = GpuExecutable::create(
        fresh_output_program()
            .with_binary(b"cubin".to_vec())
            .with_thunks(ThunkSequence::new(vec![Box::new(kernel)])),
    )
    .expect("kernel program is valid");

    assert_eq!(run(&program, &device).expect("first run"), [2, 3, 4, 5]);
    assert_eq!(run(&program, &device).expect("second run"), [2, 3, 4, 5]);

    // One module for the constants, one for the kernel thunk.
    assert_eq!(device.executor.load_count(), 2);
    assert_eq!(
        device
            .stream
            .count(|op| matches!(op, StreamOp::Launch { kernel, .. } if kernel == "add_one")),
        2
    );
}

#[test]
fn kernel_thunk_initializes_separately_on_each_executor() {
    let first = HostDevice::build(|executor| executor.with_kernel("add_one", add_one), |a| a);
    let second = HostDevice::build(
        |executor| executor.with_kernel("add_one", add_one),
        |a| a,
    );
    assert_ne!(first.executor.id(), second.executor.id());
    let kernel = KernelThunk::new(
        ThunkInfo::new("add_one"),
        "add_one",
        vec![Slice::new(0, 0, 16), Slice::new(2, 0, 16)],
        LaunchDimensions::linear(1, 4),
    );
    let program = GpuExecutable::create(
        fresh_output_program()
            .with_binary(b"cubin".to_vec())
            .with_thunks(ThunkSequence::new(vec![Box::new(kernel)])),
    )
    .expect("kernel program is valid");

    assert_eq!(run(&program, &first).expect("first device"), [2, 3, 4, 5]);
    assert_eq!(run(&program, &second).expect("second device"), [2, 3, 4, 5]);

    assert_eq!(first.executor.load_count(), 2);
    assert_eq!(second.executor.load_count(), 2);
}

#[test]
fn copy_thunk_moves_the_parameter_into_the_output() {
    let device = HostDevice::new();
    let copy = DeviceToDeviceCopyThunk::new(
        ThunkInfo::new("copy"),
        Slice::new(0, 0, 16),
        Slice::new(2, 0, 16),
        16,
    );
    let program = executable(ThunkSequence::new(vec![Box::new(copy)]));

    assert_eq!(run(&program, &device).expect("execute"), [1, 2, 3, 4]);
    assert_eq!(
        device
            .stream
            .count(|op| matches!(op, StreamOp::DeviceToDevice { size: 16, .. })),
        1
    );
}

#[test]
fn oversized_copy_is_internal() {
    let device = HostDevice::new();
    let copy = DeviceToDeviceCopyThunk::new(
        ThunkInfo::new("copy"),
        Slice::new(0, 0, 16),
        Slice::new(2, 0, 16),
        32,
    );
    let program = executable(ThunkSequence::new(vec![Box::new(copy)]));

    let err = run(&program, &device).expect_err("copy does not fit");
    assert_eq!(err.code(), ErrorCode::Internal);
}
