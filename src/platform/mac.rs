//! Thread suspension + walk + resume (spec.md §4.A.2), grounded on the
//! suspend/read/resume shape of `samply-in-process`'s
//! `ThreadProfilerInProcess` (`mac/thread_profiler_in_process.rs`) and its
//! `RunningProfiler` sampler-thread pattern (`mac/profiler.rs`), generalized
//! from "unwind this process's native frames" to "walk every managed
//! thread's frame chain while it is frozen, optionally preceded by a cheap
//! frame-pointer walk of its native stack."
//!
//! A dedicated sampler thread (spawned the way `RunningProfiler` spawns its
//! own, via `std::thread::spawn` with a `crossbeam_channel` control
//! connection) owns the suspend/walk/resume loop; the runtime lock is held
//! for the loop's entire duration (spec.md §4.A.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::thread_act_t;
use mach2::port::mach_port_t;
use mach2::thread_act::{thread_resume, thread_suspend};

use crate::capture::capture_other_thread;
use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use crate::mac::time::get_monotonic_timestamp;
use crate::platform::{PlatformSampler, SamplerContext};
use crate::registry::CodeRegistry;
use crate::ringbuffer::{RingBuffer, WriteResult};
use crate::runtime::{RuntimeAccessors, ThreadStateAddr};
use crate::sample::RawSample;
use crate::stats::{Stats, StatsHandle};

/// Cheap frame-pointer native-stack walk, the fallback this crate uses in
/// place of a full CFI unwinder (out of scope: spec.md §1 excludes a
/// general-purpose native unwinder). macOS's ABI keeps a frame-pointer
/// chain by default, so following `[fp] -> return address` and
/// `[fp] -> saved fp` is reliable for non-leaf, non-hand-optimized code.
fn walk_native_frame_pointers(mut fp: usize, pc: usize, max_depth: usize, out: &mut RawSample) {
    out.native_depth = 0;
    if max_depth == 0 {
        return;
    }
    out.native_pcs[0] = pc as u64;
    out.native_depth = 1;

    while out.native_depth < max_depth && out.native_depth < out.native_pcs.len() {
        if fp == 0 || fp % std::mem::align_of::<usize>() != 0 {
            break;
        }
        // SAFETY: this function only runs while the target thread is
        // suspended (caller's obligation) and `fp` has passed the
        // alignment check above; a wild frame pointer simply produces
        // garbage we stop at via the next iteration's checks, not memory
        // corruption, since we only ever read.
        let (return_addr, saved_fp) = unsafe {
            let ra = *((fp + std::mem::size_of::<usize>()) as *const usize);
            let sfp = *(fp as *const usize);
            (ra, sfp)
        };
        if return_addr == 0 {
            break;
        }
        out.native_pcs[out.native_depth] = return_addr as u64;
        out.native_depth += 1;
        if saved_fp <= fp {
            // Frame pointers must increase monotonically up the stack; a
            // non-increasing link means a corrupted or already-visited
            // frame.
            break;
        }
        fp = saved_fp;
    }
}

enum ControlMessage {
    Shutdown,
}

struct WorkerConfig {
    accessors: Arc<dyn RuntimeAccessors>,
    registry: Arc<CodeRegistry>,
    ring_buffer: Arc<RingBuffer>,
    stats: StatsHandle,
    interval_ns: u64,
    max_depth: usize,
    native_unwinding: bool,
}

fn sampler_loop(config: WorkerConfig, control: Receiver<ControlMessage>, paused: Arc<AtomicBool>) {
    let period = Duration::from_nanos(config.interval_ns);
    loop {
        match control.recv_timeout(period) {
            Ok(ControlMessage::Shutdown) => return,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }

        if paused.load(Ordering::Acquire) {
            continue;
        }

        config.stats.record_timer_tick();
        config.accessors.acquire_runtime_lock();

        for tstate in config.accessors.thread_list() {
            sample_one_thread(&config, tstate);
        }

        config.accessors.release_runtime_lock();
    }
}

fn sample_one_thread(config: &WorkerConfig, tstate: ThreadStateAddr) {
    let thread_port = (tstate.0 & 0xffff_ffff) as mach_port_t;

    let suspend_start = get_monotonic_timestamp();
    // SAFETY: `thread_port` names a thread obtained from the runtime's own
    // thread list under the runtime lock, and is resumed unconditionally
    // below before this function returns.
    let suspend_rc = unsafe { thread_suspend(thread_port as thread_act_t) };
    if suspend_rc != KERN_SUCCESS {
        config.stats.record_thread_skipped();
        return;
    }

    let mut raw = RawSample::empty();
    raw.timestamp_ns = get_monotonic_timestamp();
    raw.thread_id = tstate.0 as u64;

    if config.native_unwinding {
        if let Some((pc, fp)) = read_native_registers(thread_port) {
            walk_native_frame_pointers(fp, pc, config.max_depth, &mut raw);
        }
    }

    let walk_result = capture_other_thread(&*config.accessors, tstate, config.max_depth, &mut raw);

    if let Ok(()) = walk_result {
        let addrs: Vec<_> = raw.managed_pairs().map(|(c, _)| c).collect();
        let epoch = config.registry.get_gc_epoch();
        raw.gc_epoch = epoch;
        // Reference counts are incremented before resume (spec.md §4.A.2
        // step 4.f): once the thread runs again a collection could free an
        // object this sample still points to.
        config.registry.add_refs_batch(&addrs, epoch);
    } else {
        config.stats.record_walk_error();
    }

    // SAFETY: `thread_port` was suspended by this function above and has
    // not been resumed yet.
    unsafe {
        thread_resume(thread_port as thread_act_t);
    }

    let suspend_end = get_monotonic_timestamp();
    config
        .stats
        .record_suspend_duration(suspend_end.saturating_sub(suspend_start));
    config.stats.record_thread_sampled();

    if walk_result.is_ok() {
        config.stats.record_capture();
        if !matches!(config.ring_buffer.write(raw), WriteResult::Written) {
            config.stats.record_drop();
        }
    }
}

/// Reads the suspended thread's program counter and frame pointer via
/// `thread_get_state`. Returns `None` on a kernel error (e.g. the thread
/// exited between being listed and being suspended).
#[cfg(target_arch = "x86_64")]
fn read_native_registers(thread_port: mach_port_t) -> Option<(usize, usize)> {
    use mach2::structs::x86_thread_state64_t;
    use mach2::thread_status::x86_THREAD_STATE64;

    let mut state = x86_thread_state64_t::default();
    let mut count = (std::mem::size_of::<x86_thread_state64_t>() / std::mem::size_of::<u32>()) as u32;
    // SAFETY: `state`/`count` describe a correctly sized buffer for the
    // `x86_THREAD_STATE64` flavor on a suspended thread.
    let rc = unsafe {
        mach2::thread_act::thread_get_state(
            thread_port as thread_act_t,
            x86_THREAD_STATE64,
            &mut state as *mut _ as *mut u32,
            &mut count,
        )
    };
    if rc != KERN_SUCCESS {
        return None;
    }
    Some((state.__rip as usize, state.__rbp as usize))
}

#[cfg(target_arch = "aarch64")]
fn read_native_registers(thread_port: mach_port_t) -> Option<(usize, usize)> {
    use mach2::structs::arm_thread_state64_t;
    use mach2::thread_status::ARM_THREAD_STATE64;

    let mut state = arm_thread_state64_t::default();
    let mut count = (std::mem::size_of::<arm_thread_state64_t>() / std::mem::size_of::<u32>()) as u32;
    // SAFETY: see the x86_64 variant above.
    let rc = unsafe {
        mach2::thread_act::thread_get_state(
            thread_port as thread_act_t,
            ARM_THREAD_STATE64,
            &mut state as *mut _ as *mut u32,
            &mut count,
        )
    };
    if rc != KERN_SUCCESS {
        return None;
    }
    Some((state.__pc as usize, state.__fp as usize))
}

/// Suspension-based sampler for Mach-like platforms (spec.md §4.A.2).
pub struct MacSampler {
    accessors: Arc<dyn RuntimeAccessors>,
    registry: Arc<CodeRegistry>,
    stats: StatsHandle,
    config: ProfilerConfig,
    control_sender: Option<Sender<ControlMessage>>,
    paused: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MacSampler {
    pub fn new(accessors: Arc<dyn RuntimeAccessors>, registry: Arc<CodeRegistry>) -> Self {
        Self {
            accessors,
            registry,
            stats: StatsHandle::new(),
            config: ProfilerConfig::default(),
            control_sender: None,
            paused: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl PlatformSampler for MacSampler {
    fn init(&mut self, config: &ProfilerConfig) -> Result<(), ProfilerError> {
        if self.worker.is_some() {
            return Err(ProfilerError::AlreadyInitialised);
        }
        self.config = *config;
        Ok(())
    }

    fn start(&mut self, ring_buffer: Arc<RingBuffer>) -> Result<(), ProfilerError> {
        if self.worker.is_some() {
            return Err(ProfilerError::AlreadyRunning);
        }

        let (tx, rx) = bounded(1);
        let worker_config = WorkerConfig {
            accessors: self.accessors.clone(),
            registry: self.registry.clone(),
            ring_buffer,
            stats: self.stats.clone(),
            interval_ns: self.config.interval_ns,
            max_depth: self.config.max_depth,
            native_unwinding: self.config.native_unwinding,
        };
        let paused = self.paused.clone();
        self.worker = Some(
            std::thread::Builder::new()
                .name("vmsample-sampler".to_string())
                .spawn(move || sampler_loop(worker_config, rx, paused))
                .map_err(|_| ProfilerError::ResourceExhausted("spawning sampler thread"))?,
        );
        self.control_sender = Some(tx);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ProfilerError> {
        let sender = self.control_sender.take().ok_or(ProfilerError::NotRunning)?;
        let _ = sender.send(ControlMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), ProfilerError> {
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), ProfilerError> {
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    fn get_stats(&self) -> Stats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_frame_pointer_walk_follows_a_synthetic_chain() {
        #[repr(C)]
        struct Frame {
            saved_fp: usize,
            return_addr: usize,
        }
        let root = Frame {
            saved_fp: 0,
            return_addr: 0xAAA,
        };
        let leaf = Frame {
            saved_fp: &root as *const _ as usize,
            return_addr: 0xBBB,
        };

        let mut out = RawSample::empty();
        walk_native_frame_pointers(&leaf as *const _ as usize, 0x1, 16, &mut out);
        assert_eq!(out.native_depth, 3);
        assert_eq!(out.native_pcs[0], 0x1);
        assert_eq!(out.native_pcs[1], 0xBBB);
        assert_eq!(out.native_pcs[2], 0xAAA);
    }

    #[test]
    fn native_walk_stops_on_non_increasing_frame_pointer() {
        #[repr(C)]
        struct Frame {
            saved_fp: usize,
            return_addr: usize,
        }
        let cyclic = Frame {
            saved_fp: 0,
            return_addr: 0xCCC,
        };
        let addr = &cyclic as *const _ as usize;
        // A frame pointer pointing at itself must not loop forever.
        let mut out = RawSample::empty();
        walk_native_frame_pointers(addr, 0x1, 16, &mut out);
        assert!(out.native_depth <= 2);
    }

    #[test]
    fn zero_max_depth_yields_empty_native_stack() {
        let mut out = RawSample::empty();
        walk_native_frame_pointers(0x1000, 0x1, 0, &mut out);
        assert_eq!(out.native_depth, 0);
    }
}
