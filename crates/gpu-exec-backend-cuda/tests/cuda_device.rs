use gpu_exec::thunk::{DeviceToDeviceCopyThunk, Memset32Thunk};
use gpu_exec::{
    AllocationKind, BufferAllocation, DeviceMemoryAllocator, ErrorCode, GpuExecutable,
    GpuExecutableParams, GpuVersion, OutputInfo, ShapeIndex, Slice, Stream, StreamExecutor,
    ThunkInfo, ThunkSequence,
};
use gpu_exec_backend_cuda::CudaDevice;
use gpu_exec_backend_tests::{bytes_to_int32, int32_bytes, s32_vector, shaped_buffer};

fn device_or_skip() -> Option<CudaDevice> {
    if gpu_exec_backend_cuda::is_available() {
        Some(CudaDevice::new().expect("driver reported available"))
    } else {
        eprintln!("skipping CUDA backend test: CUDA driver unavailable");
        None
    }
}

#[test]
fn upload_then_download_returns_the_same_bytes() -> anyhow::Result<()> {
    let Some(device) = device_or_skip() else {
        return Ok(());
    };
    let memory = device.allocator.allocate_raw(0, 16)?;
    device
        .stream
        .memcpy_host_to_device(memory, &int32_bytes(&[1, 2, 3, 4]))?;
    let mut out = vec![0u8; 16];
    device.stream.memcpy_device_to_host(&mut out, memory)?;
    device.allocator.deallocate(0, memory)?;

    assert_eq!(bytes_to_int32(&out), [1, 2, 3, 4]);
    Ok(())
}

#[test]
fn memset32_fills_whole_words() -> anyhow::Result<()> {
    let Some(device) = device_or_skip() else {
        return Ok(());
    };
    let memory = device.allocator.allocate_raw(0, 16)?;
    device.stream.memset32(memory, 7, 16)?;
    let mut out = vec![0u8; 16];
    device.stream.memcpy_device_to_host(&mut out, memory)?;
    device.allocator.deallocate(0, memory)?;

    assert_eq!(bytes_to_int32(&out), [7, 7, 7, 7]);
    Ok(())
}

#[test]
fn oversized_copy_is_rejected_before_reaching_the_driver() {
    let Some(device) = device_or_skip() else {
        return;
    };
    let memory = device.allocator.allocate_raw(0, 8).expect("allocate");
    let err = device
        .stream
        .memcpy_host_to_device(memory, &[0u8; 16])
        .expect_err("destination is too small");
    device.allocator.deallocate(0, memory).expect("free");

    assert_eq!(err.code(), ErrorCode::Internal);
}

#[test]
fn allocator_rejects_other_devices() {
    let Some(device) = device_or_skip() else {
        return;
    };
    let err = device
        .allocator
        .allocate_raw(3, 16)
        .expect_err("only device 0 is served");
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(!device.allocator.allows_asynchronous_deallocation());
}

#[test]
fn executor_reports_a_cuda_version() {
    let Some(device) = device_or_skip() else {
        return;
    };
    assert!(matches!(device.executor.gpu_version(), GpuVersion::Cuda(_)));
    assert_eq!(device.executor.device_ordinal(), 0);
}

#[test]
fn thunk_program_runs_on_the_device() -> anyhow::Result<()> {
    let Some(device) = device_or_skip() else {
        return Ok(());
    };
    let params = GpuExecutableParams::new(
        "copy_then_fill",
        device.executor.gpu_version(),
        s32_vector(4),
    )
    .with_allocations(vec![
        BufferAllocation::entry_parameter(0, 16, 0, ShapeIndex::root(), false),
        BufferAllocation::new(1, 16, AllocationKind::MaybeLiveOut),
    ])
    .with_output(ShapeIndex::root(), OutputInfo::new(1))
    .with_thunks(ThunkSequence::new(vec![
        Box::new(DeviceToDeviceCopyThunk::new(
            ThunkInfo::new("copy"),
            Slice::new(0, 0, 16),
            Slice::new(1, 0, 16),
            16,
        )),
        Box::new(Memset32Thunk::new(
            ThunkInfo::new("fill"),
            9,
            Slice::new(1, 12, 4),
        )),
    ]));
    let executable = GpuExecutable::create(params)?;

    let input = device.allocator.allocate_raw(0, 16)?;
    device
        .stream
        .memcpy_host_to_device(input, &int32_bytes(&[1, 2, 3, 4]))?;
    let argument = shaped_buffer(s32_vector(4), input);
    let result = executable.execute_async_on_stream_unowned(&device.run_options(), &[&argument])?;

    let mut out = vec![0u8; 16];
    device
        .stream
        .memcpy_device_to_host(&mut out, result.root_buffer())?;
    drop(result);
    device.allocator.deallocate(0, input)?;

    assert_eq!(bytes_to_int32(&out), [1, 2, 3, 9]);
    Ok(())
}
