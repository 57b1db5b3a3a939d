use std::sync::Arc;
use std::time::Duration;

use gpu_exec::{ConstantInfo, ConstantResolver, ErrorCode, StreamExecutor};
use gpu_exec_backend_tests::{int32_bytes, HostDevice, HostExecutor, StreamOp};

fn resolver(binary: &[u8], constants: Vec<ConstantInfo>) -> ConstantResolver {
    ConstantResolver::new(Arc::from(binary), Arc::from("; ptx"), constants)
}

#[test]
fn concurrent_resolution_loads_once_and_shares_the_map() {
    let device = HostDevice::build(
        |executor| {
            executor
                .with_module_global("c0", 16)
                .with_load_delay(Duration::from_millis(20))
        },
        |allocator| allocator,
    );
    let resolver = resolver(
        b"cubin",
        vec![ConstantInfo::new("c0", int32_bytes(&[1, 2, 3, 4]), Some(0))],
    );

    let resolved: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| resolver.resolve(device.stream.as_ref())))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("resolver thread panicked"))
            .collect::<Result<Vec<_>, _>>()
            .expect("every caller resolves")
    });

    assert_eq!(device.executor.load_count(), 1);
    assert!(resolved.iter().all(|map| Arc::ptr_eq(map, &resolved[0])));
    assert_eq!(
        device
            .stream
            .count(|op| matches!(op, StreamOp::HostToDevice { .. })),
        1,
        "stripped initializer is uploaded exactly once"
    );
    let global = resolved[0].globals()[&0];
    assert_eq!(
        device.memory.read(global, 16).expect("read global"),
        int32_bytes(&[1, 2, 3, 4])
    );
}

#[test]
fn empty_binary_skips_module_load() {
    let device = HostDevice::new();
    let resolver = resolver(b"", Vec::new());

    let resolved = resolver.resolve(device.stream.as_ref()).expect("resolve");

    assert_eq!(device.executor.load_count(), 0);
    assert!(resolved.globals().is_empty());
    assert!(resolved.module().is_none());
}

#[test]
fn symbol_with_builtin_initializer_is_not_uploaded() {
    let device = HostDevice::build(|executor| executor.with_module_global("c0", 64), |a| a);
    let resolver = resolver(b"cubin", vec![ConstantInfo::new("c0", Vec::<u8>::new(), Some(3))]);

    let resolved = resolver.resolve(device.stream.as_ref()).expect("resolve");

    assert_eq!(resolved.globals().len(), 1);
    assert!(resolved.globals().contains_key(&3));
    assert!(device.stream.ops().is_empty());
}

#[test]
fn missing_symbols_fall_back_to_the_shared_constant_cache() {
    let device = HostDevice::new();
    let content = int32_bytes(&[7, 7, 7, 7]);
    let first = resolver(b"", vec![ConstantInfo::new("a", content.clone(), Some(0))]);
    let second = resolver(b"", vec![ConstantInfo::new("b", content, Some(1))]);

    let a = first.resolve(device.stream.as_ref()).expect("resolve first");
    let b = second.resolve(device.stream.as_ref()).expect("resolve second");

    assert_eq!(a.globals()[&0], b.globals()[&1], "same content shares one global");
    assert_eq!(device.executor.constant_cache().live_entries(), 1);

    drop((a, b, first, second));
    assert_eq!(device.executor.constant_cache().live_entries(), 0);
    assert_eq!(device.memory.live_blocks(), 0);
}

#[test]
fn unreferenced_constants_are_not_recorded() {
    let device = HostDevice::build(|executor| executor.with_module_global("folded", 8), |a| a);
    let resolver = resolver(b"cubin", vec![ConstantInfo::new("folded", vec![1u8; 8], None)]);

    let resolved = resolver.resolve(device.stream.as_ref()).expect("resolve");
    assert!(resolved.globals().is_empty());
}

#[test]
fn undefined_constant_without_content_is_internal() {
    let device = HostDevice::new();
    let resolver = resolver(b"cubin", vec![ConstantInfo::new("ghost", Vec::<u8>::new(), Some(0))]);

    let err = resolver
        .resolve(device.stream.as_ref())
        .err()
        .expect("nothing can back the constant");

    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(resolver.resolved_contexts().is_empty(), "failures are not cached");
}

#[test]
fn each_context_resolves_separately() {
    let first = HostDevice::new();
    let second = HostDevice::build(|_| HostExecutor::new(1), |a| a);
    let resolver = resolver(b"cubin", Vec::new());

    resolver.resolve(first.stream.as_ref()).expect("first context");
    resolver.resolve(second.stream.as_ref()).expect("second context");
    resolver.resolve(first.stream.as_ref()).expect("first context again");

    assert_eq!(first.executor.load_count(), 1);
    assert_eq!(second.executor.load_count(), 1);
    let mut contexts = resolver.resolved_contexts();
    contexts.sort();
    let mut expected = vec![first.executor.id(), second.executor.id()];
    expected.sort();
    assert_eq!(contexts, expected);
}

#[test]
fn dropping_the_resolver_synchronizes_then_unloads() {
    let device = HostDevice::new();
    let resolver = resolver(b"cubin", Vec::new());
    resolver.resolve(device.stream.as_ref()).expect("resolve");
    assert_eq!(device.executor.loaded_modules(), 1);

    drop(resolver);

    assert_eq!(device.executor.unload_count(), 1);
    assert_eq!(device.executor.loaded_modules(), 0);
    assert!(device.executor.synchronization_count() >= 1);
}
