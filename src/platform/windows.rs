//! Timer-queue callback under the runtime lock (spec.md §4.A.3). A
//! `CreateTimerQueueTimer` callback runs on a pool thread, acquires the
//! runtime lock, walks every thread via the runtime's *public* accessors
//! (no suspension — `SuspendThread` can deadlock when the target holds a
//! non-recursive critical section), and writes a small batch of samples.
//!
//! Native-stack capture (spec.md §4.A.3 step 3) is not implemented on this
//! platform: the callback runs on a pool thread, not the sampled thread, and
//! the OS back-trace primitive can only capture the calling thread's own
//! stack. Getting another thread's native frames would require either
//! suspending it (the deadlock risk this whole variant exists to avoid) or a
//! full `StackWalk64`/unwind-info walker, which is out of scope here.
//! `ProfilerConfig::native_unwinding` is therefore a no-op on Windows.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Threading::{
    CreateTimerQueue, CreateTimerQueueTimer, DeleteTimerQueueEx, DeleteTimerQueueTimer,
    WT_EXECUTEDEFAULT,
};

use crate::capture::capture_other_thread;
use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use crate::platform::{PlatformSampler, SamplerContext};
use crate::ringbuffer::{RingBuffer, WriteResult};
use crate::sample::RawSample;
use crate::stats::{Stats, StatsHandle};

/// Upper bound on how many threads a single callback invocation samples
/// before yielding the runtime lock, bounding worst-case hold time even on
/// a process with an unusually large thread count (spec.md §4.A.3 step 4:
/// "Writes samples in a small per-callback batch").
const MAX_THREADS_PER_CALLBACK: usize = 64;

struct SharedState {
    ring_buffer: Arc<RingBuffer>,
    context: SamplerContext,
    max_depth: usize,
}

static SHARED: AtomicPtr<SharedState> = AtomicPtr::new(std::ptr::null_mut());
static TIMER_ACTIVE: AtomicBool = AtomicBool::new(false);

unsafe extern "system" fn on_timer_tick(_param: *mut std::ffi::c_void, _fired: bool) {
    let ptr = SHARED.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `ptr` is only replaced in `start`/`stop`, which never run
    // concurrently with a live timer callback (the timer is deleted and
    // `DeleteTimerQueueTimer` waited on before `stop` tears down state).
    let shared = unsafe { &*ptr };

    shared.context.stats.record_timer_tick();
    shared.context.accessors.acquire_runtime_lock();

    let mut sampled = 0usize;
    for tstate in shared.context.accessors.thread_list() {
        if sampled >= MAX_THREADS_PER_CALLBACK {
            shared.context.stats.record_thread_skipped();
            continue;
        }
        sampled += 1;

        let mut raw = RawSample::empty();
        raw.timestamp_ns = monotonic_now_ns();
        raw.thread_id = tstate.0 as u64;

        match capture_other_thread(&*shared.context.accessors, tstate, shared.max_depth, &mut raw) {
            Ok(()) => {
                shared.context.stats.record_capture();
                shared.context.stats.record_thread_sampled();
                if !matches!(shared.ring_buffer.write(raw), WriteResult::Written) {
                    shared.context.stats.record_drop();
                }
            }
            Err(_) => {
                shared.context.stats.record_walk_error();
            }
        }
    }

    shared.context.accessors.release_runtime_lock();
}

fn monotonic_now_ns() -> u64 {
    use windows::Win32::System::Performance::{QueryPerformanceCounter, QueryPerformanceFrequency};
    let mut freq = 0i64;
    let mut counter = 0i64;
    // SAFETY: both out-parameters are valid stack locations; these calls
    // cannot fail on any Windows version this crate targets.
    unsafe {
        QueryPerformanceFrequency(&mut freq).ok();
        QueryPerformanceCounter(&mut counter).ok();
    }
    if freq <= 0 {
        return 0;
    }
    (counter as u128 * 1_000_000_000u128 / freq as u128) as u64
}

/// Timer-queue sampler for Windows-like platforms (spec.md §4.A.3).
pub struct WindowsSampler {
    accessors: Arc<dyn crate::runtime::RuntimeAccessors>,
    stats: StatsHandle,
    config: ProfilerConfig,
    queue: Option<HANDLE>,
    timer: Option<HANDLE>,
}

impl WindowsSampler {
    pub fn new(accessors: Arc<dyn crate::runtime::RuntimeAccessors>) -> Self {
        Self {
            accessors,
            stats: StatsHandle::new(),
            config: ProfilerConfig::default(),
            queue: None,
            timer: None,
        }
    }
}

impl PlatformSampler for WindowsSampler {
    fn init(&mut self, config: &ProfilerConfig) -> Result<(), ProfilerError> {
        if self.queue.is_some() {
            return Err(ProfilerError::AlreadyInitialised);
        }
        self.config = *config;
        // SAFETY: no arguments; returns a handle or null on failure.
        let queue = unsafe { CreateTimerQueue() }
            .map_err(|_| ProfilerError::ResourceExhausted("CreateTimerQueue failed"))?;
        self.queue = Some(queue);
        Ok(())
    }

    fn start(&mut self, ring_buffer: Arc<RingBuffer>) -> Result<(), ProfilerError> {
        if TIMER_ACTIVE.swap(true, Ordering::AcqRel) {
            return Err(ProfilerError::AlreadyRunning);
        }
        let queue = self.queue.ok_or(ProfilerError::NotRunning)?;

        let state = Box::new(SharedState {
            ring_buffer,
            context: SamplerContext {
                accessors: self.accessors.clone(),
                stats: self.stats.clone(),
            },
            max_depth: self.config.max_depth,
        });
        SHARED.store(Box::into_raw(state), Ordering::Release);

        let interval_ms = (self.config.interval_ns / 1_000_000).max(1) as u32;
        let mut timer = HANDLE::default();
        // SAFETY: `on_timer_tick` matches the `WAITORTIMERCALLBACK`
        // signature; the queue handle is valid and owned by `self`.
        let rc = unsafe {
            CreateTimerQueueTimer(
                &mut timer,
                queue,
                Some(on_timer_tick),
                None,
                interval_ms,
                interval_ms,
                WT_EXECUTEDEFAULT,
            )
        };
        if rc.is_err() {
            TIMER_ACTIVE.store(false, Ordering::Release);
            return Err(ProfilerError::ResourceExhausted("CreateTimerQueueTimer failed"));
        }
        self.timer = Some(timer);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ProfilerError> {
        if !TIMER_ACTIVE.swap(false, Ordering::AcqRel) {
            return Err(ProfilerError::NotRunning);
        }
        if let (Some(queue), Some(timer)) = (self.queue, self.timer.take()) {
            // SAFETY: both handles are valid and owned by `self`. Passing
            // `HANDLE(-1)` as the completion event means "wait for any
            // in-flight callback to finish" rather than racing it. This
            // deletes only `timer`, leaving `queue` (and any other timer on
            // it) alive.
            unsafe {
                let _ = DeleteTimerQueueTimer(queue, timer, HANDLE(-1isize as _));
            }
        }
        let old = SHARED.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: `DeleteTimerQueueTimer` above blocked until any
            // in-flight callback finished, so nothing still reads `old`.
            unsafe {
                drop(Box::from_raw(old));
            }
        }
        Ok(())
    }

    fn get_stats(&self) -> Stats {
        self.stats.snapshot()
    }
}

impl Drop for WindowsSampler {
    fn drop(&mut self) {
        if self.timer.is_some() || TIMER_ACTIVE.load(Ordering::Acquire) {
            let _ = self.stop();
        }
        if let Some(queue) = self.queue.take() {
            // SAFETY: `stop()` above only ever deletes the timer, never the
            // queue, so `queue` is still live here whenever `self.queue` is
            // `Some` — deleted at most once.
            unsafe {
                let _ = DeleteTimerQueueEx(queue, HANDLE(-1isize as _));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_is_nondecreasing() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(b >= a);
    }
}
