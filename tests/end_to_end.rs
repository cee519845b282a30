//! End-to-end scenarios wiring capture, the registry, the ring buffer and
//! the resolver together against a fake managed runtime, covering the
//! concrete scenarios from spec.md §8 that don't require a live OS timer.

use vmsample_core::capture::capture_other_thread;
use vmsample_core::config::ProfilerConfig;
use vmsample_core::dynamic_loader::DynamicLoader;
use vmsample_core::registry::CodeRegistry;
use vmsample_core::resolver::{InterpreterModule, Resolver};
use vmsample_core::ringbuffer::{ReadResult, RingBuffer, WriteResult};
use vmsample_core::runtime::testing::{FakeFrame, FakeRuntime};
use vmsample_core::runtime::ThreadStateAddr;
use vmsample_core::sample::{CodeAddress, FrameKind, InstrAddress, RawSample};
use vmsample_core::stats::StatsHandle;

fn tstate(tid: u64) -> ThreadStateAddr {
    ThreadStateAddr((tid as usize) << 32)
}

fn py_frame(code: usize, name: &str) -> FakeFrame {
    FakeFrame {
        code: CodeAddress(code),
        instr: InstrAddress(code + 1),
        is_shim: false,
        name: name.to_string(),
        file: "worker.py".to_string(),
        line: 42,
    }
}

/// Scenario 2: deep recursion against a configured `max_depth` of 128.
/// Every sample is truncated at exactly 128 frames, and the innermost
/// (depth-0) frame, the recursive function itself, survives in every one.
#[test]
fn deep_recursion_truncates_at_configured_max_depth() {
    let config = ProfilerConfig {
        max_depth: 128,
        ..ProfilerConfig::default()
    };
    let runtime = FakeRuntime::new();
    let frames: Vec<_> = (0..200).map(|i| py_frame(i + 1, "recurse")).collect();
    runtime.set_thread_stack(1, frames);

    let mut raw = RawSample::empty();
    capture_other_thread(&runtime, tstate(1), config.max_depth, &mut raw).unwrap();

    assert_eq!(raw.managed_depth, 128);
    assert!(raw.truncated);
    assert_eq!(raw.managed_frames[0], CodeAddress(1));
}

/// Scenario 3 (simplified to a single-process in-memory run, without a
/// live OS timer): 8 worker threads each expose a distinct top-of-stack
/// function; every thread's capture preserves its own identity and its
/// own function at depth 0.
#[test]
fn multi_thread_fan_out_keeps_each_threads_identity_and_leaf_frame() {
    let runtime = FakeRuntime::new();
    for tid in 1..=8u64 {
        runtime.set_thread_stack(
            tid,
            vec![py_frame(tid as usize * 10, &format!("worker_{tid}"))],
        );
    }

    let registry = CodeRegistry::new();
    let mut thread_ids_seen = std::collections::HashSet::new();
    for tid in 1..=8u64 {
        let mut raw = RawSample::empty();
        raw.thread_id = tid;
        capture_other_thread(&runtime, tstate(tid), 128, &mut raw).unwrap();
        registry.add_refs_batch(&raw.managed_frames[..raw.managed_depth], 0);
        assert_eq!(raw.managed_depth, 1);
        assert_eq!(raw.managed_frames[0], CodeAddress(tid as usize * 10));
        thread_ids_seen.insert(raw.thread_id);
    }
    assert_eq!(thread_ids_seen.len(), 8);
}

/// Scenario 4: a native extension call that never releases the runtime
/// lock merges via trim-and-sandwich into native-then-managed-then-native
/// order.
#[test]
fn mixed_mode_native_call_merges_native_then_managed() {
    let runtime = FakeRuntime::new();
    runtime.set_thread_stack(1, vec![py_frame(1, "caller")]);
    let registry = CodeRegistry::new();
    registry.add_refs_batch(&[CodeAddress(1)], 0);
    let loader = DynamicLoader::new();
    let stats = StatsHandle::new();
    let mut resolver = Resolver::new(&runtime, &registry, &loader, stats);
    resolver.set_interpreter_module(InterpreterModule {
        base: 0x1000,
        size: 0x1000,
        path: "/usr/lib/libpython.so".to_string(),
    });

    let mut raw = RawSample::empty();
    raw.timestamp_ns = 1;
    raw.thread_id = 1;
    raw.managed_frames[0] = CodeAddress(1);
    raw.managed_instr_ptrs[0] = InstrAddress(2);
    raw.managed_depth = 1;
    // Innermost-first: native extension busy loop, then the interpreter's
    // own call frame.
    raw.native_pcs[0] = 0x9000;
    raw.native_pcs[1] = 0x1010;
    raw.native_depth = 2;

    let resolved = resolver.resolve(&raw).unwrap();
    assert_eq!(resolved.frames.len(), 2);
    assert_eq!(resolved.frames[0].kind, FrameKind::Native);
    assert_eq!(resolved.frames[1].function_name, "caller");
}

/// Boundary behaviour: the ring buffer reports `Dropped` once full, and
/// each dropped write corresponds to exactly one counter increment.
#[test]
fn ring_buffer_at_capacity_drops_and_counts_exactly_once_per_drop() {
    let rb = RingBuffer::with_capacity(4);
    let stats = StatsHandle::new();
    for i in 0..10u64 {
        let mut sample = RawSample::empty();
        sample.thread_id = i;
        match rb.write(sample) {
            WriteResult::Written => stats.record_capture(),
            WriteResult::Dropped => stats.record_drop(),
        }
    }
    let snap = stats.snapshot();
    assert_eq!(snap.samples_captured, 4);
    assert_eq!(snap.samples_dropped, 6);

    let mut drained = 0;
    while let ReadResult::Sample(_) = rb.read() {
        drained += 1;
    }
    assert_eq!(drained, 4);
}

/// Scenario near the "workload too short" boundary: fewer than 2 samples
/// captured and no fallback clock in play yields `WorkloadTooShort`.
#[test]
fn short_workload_near_boundary_yields_workload_too_short_diagnostic() {
    let stats = StatsHandle::new();
    stats.record_capture();
    let snapshot = stats.snapshot();
    assert_eq!(
        vmsample_core::diagnose(&snapshot),
        vmsample_core::Diagnostic::WorkloadTooShort
    );
}

/// Round-trip law (spec.md §8): two independent start/stop cycles each
/// leave the registry empty.
#[test]
fn registry_round_trip_empties_twice() {
    let registry = CodeRegistry::new();
    for _ in 0..2 {
        registry.add_refs_batch(&[CodeAddress(0x10), CodeAddress(0x20)], 0);
        assert!(!registry.is_empty());
        registry.clear();
        assert!(registry.is_empty());
    }
}

/// Resolving the same `(code_address, instr_address)` pair twice in one
/// session yields byte-identical output (spec.md §8 invariant).
#[test]
fn repeated_resolution_of_same_pair_is_byte_identical() {
    let runtime = FakeRuntime::new();
    runtime.set_thread_stack(1, vec![py_frame(7, "stable")]);
    let registry = CodeRegistry::new();
    let loader = DynamicLoader::new();
    let stats = StatsHandle::new();
    let mut resolver = Resolver::new(&runtime, &registry, &loader, stats);

    let mut raw = RawSample::empty();
    raw.timestamp_ns = 1;
    raw.thread_id = 1;
    raw.managed_frames[0] = CodeAddress(7);
    raw.managed_instr_ptrs[0] = InstrAddress(8);
    raw.managed_depth = 1;

    registry.add_refs_batch(&[CodeAddress(7)], 0);
    let first = resolver.resolve(&raw).unwrap();
    registry.add_refs_batch(&[CodeAddress(7)], 0);
    let second = resolver.resolve(&raw).unwrap();

    assert_eq!(first.frames, second.frames);
}

/// Trim-and-sandwich is idempotent on a sample with no managed frames and
/// no interpreter-classified native frames: output equals the native
/// stack (spec.md §8 invariant).
#[test]
fn trim_and_sandwich_is_a_no_op_with_no_managed_frames() {
    let runtime = FakeRuntime::new();
    let registry = CodeRegistry::new();
    let loader = DynamicLoader::new();
    let stats = StatsHandle::new();
    let mut resolver = Resolver::new(&runtime, &registry, &loader, stats);

    let mut raw = RawSample::empty();
    raw.timestamp_ns = 1;
    raw.thread_id = 1;
    raw.native_pcs[0] = 0x1111;
    raw.native_pcs[1] = 0x2222;
    raw.native_depth = 2;

    let resolved = resolver.resolve(&raw).unwrap();
    assert_eq!(resolved.frames.len(), 2);
    assert!(resolved.frames.iter().all(|f| f.kind == FrameKind::Native));
}
