//! Per-thread interval timers with asynchronous notification (spec.md
//! §4.A.1). Each registered thread gets a CPU-time `timer_create`, falling
//! back to a monotonic clock when the CPU-time clock can't be created (a
//! restricted container), and a realtime-style signal delivered to that
//! thread so the capture routine runs on the sampled thread itself
//! (`SIGEV_THREAD_ID`, a glibc/Linux extension — the sampled thread is the
//! one that runs the handler, not whichever thread the kernel picks).
//!
//! The signal handler only ever does direct memory reads and atomic
//! operations; it never allocates, locks, or calls into the managed
//! runtime, the same discipline `samply`'s own Linux profiler
//! (`samply/src/linux/profiler.rs`) keeps around `signal_hook`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use crate::platform::speculative::{FrameLayout, SeenFrames};
use crate::platform::{PlatformSampler, SamplerContext};
use crate::ringbuffer::{RingBuffer, WriteResult};
use crate::runtime::RuntimeAccessors;
use crate::sample::RawSample;
use crate::stats::{Stats, StatsHandle};

const SAMPLING_SIGNAL: libc::c_int = libc::SIGPROF;

struct ThreadEntry {
    timer_id: libc::timer_t,
}

// SAFETY: `libc::timer_t` is an opaque handle the kernel manages; this
// crate never dereferences it.
unsafe impl Send for ThreadEntry {}
unsafe impl Sync for ThreadEntry {}

struct SharedState {
    ring_buffer: Arc<RingBuffer>,
    context: SamplerContext,
    max_depth: usize,
    speculative: bool,
    layout: Option<FrameLayout>,
}

static SHARED: AtomicPtr<SharedState> = AtomicPtr::new(std::ptr::null_mut());
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
static RUNNING: AtomicBool = AtomicBool::new(false);

thread_local! {
    static SCRATCH: std::cell::RefCell<(RawSample, SeenFrames)> =
        std::cell::RefCell::new((RawSample::empty(), SeenFrames::new()));
}

fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `clock_gettime` with a stack-allocated `timespec` and a
    // well-known clock id is async-signal-safe and cannot fail in practice
    // for `CLOCK_MONOTONIC`.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn current_thread_id() -> u64 {
    // SAFETY: `gettid` takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Signal handler invoked on the sampled thread itself. Async-signal-safe:
/// no allocation, no locks, no managed-runtime calls.
extern "C" fn on_sample_signal(_sig: libc::c_int) {
    let ptr = SHARED.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `ptr` is only ever replaced (in `start`/`stop`) while the
    // handler is not installed, so no concurrent write races this read.
    let shared = unsafe { &*ptr };

    shared.context.stats.record_timer_tick();

    SCRATCH.with(|cell| {
        let mut scratch = cell.borrow_mut();
        let (raw, seen) = &mut *scratch;

        raw.timestamp_ns = monotonic_now_ns();
        raw.thread_id = current_thread_id();

        let result = if shared.speculative {
            let layout = match &shared.layout {
                Some(l) => l,
                None => return,
            };
            let first = shared
                .context
                .accessors
                .current_thread_state()
                .map(|t| t.0)
                .unwrap_or(0);
            // SAFETY: `first` is either 0 (treated as an empty stack) or a
            // value the embedding runtime's own thread-local slot
            // produced for the calling thread.
            unsafe {
                crate::platform::speculative::walk_speculative(
                    first, layout, shared.max_depth, seen, raw,
                )
            }
        } else {
            crate::capture::capture_self_thread(&*shared.context.accessors, shared.max_depth, raw)
        };

        match result {
            Ok(()) => {
                shared.context.stats.record_capture();
                if !matches!(shared.ring_buffer.write(raw.clone()), WriteResult::Written) {
                    shared.context.stats.record_drop();
                }
            }
            Err(_) => {
                shared.context.stats.record_walk_error();
                if raw.managed_depth > 0 {
                    // Partial publication policy (spec.md §4.A.4 step 5).
                    shared.context.stats.record_validation_drop();
                    let _ = shared.ring_buffer.write(raw.clone());
                }
            }
        }
    });
}

/// Builds a `sigevent` requesting delivery of `signal` to thread `tid`
/// specifically (`SIGEV_THREAD_ID`). The thread-id field lives at the same
/// offset as `sigev_notify_function` in glibc's `sigevent`, a documented
/// but not struct-exposed extension; we write it through a raw pointer the
/// way libc itself expects callers needing this notification mode to.
fn sigevent_for_thread(signal: libc::c_int, tid: libc::pid_t) -> libc::sigevent {
    // SAFETY: a zeroed `sigevent` is a valid bit pattern for this POD type.
    let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
    sev.sigev_signo = signal;
    sev.sigev_notify = libc::SIGEV_THREAD_ID;
    // SAFETY: within bounds of `sev`; the field this aliases
    // (`sigev_notify_function`) is never read once `sigev_notify` is
    // `SIGEV_THREAD_ID`.
    unsafe {
        let tid_field = (&mut sev as *mut libc::sigevent as *mut u8)
            .add(std::mem::offset_of!(libc::sigevent, sigev_notify_function))
            as *mut libc::pid_t;
        tid_field.write(tid);
    }
    sev
}

/// Signal-driven sampler for Linux-like platforms (spec.md §4.A.1).
pub struct LinuxSampler {
    threads: RwLock<HashMap<u64, ThreadEntry>>,
    overruns: AtomicU64,
    accessors: Arc<dyn RuntimeAccessors>,
    speculative_layout: Option<FrameLayout>,
    config: ProfilerConfig,
    stats: StatsHandle,
}

impl LinuxSampler {
    pub fn new(accessors: Arc<dyn RuntimeAccessors>, speculative_layout: Option<FrameLayout>) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            overruns: AtomicU64::new(0),
            accessors,
            speculative_layout,
            config: ProfilerConfig::default(),
            stats: StatsHandle::new(),
        }
    }

    /// Called by the profiled thread itself before it can be sampled
    /// (spec.md §4.A.1: "Thread registration is dynamic").
    fn create_timer_for_current_thread(&self) -> Result<ThreadEntry, ProfilerError> {
        let (clock_id, uses_cpu_time) = match cpu_clock_id_for_current_thread() {
            Some(id) => (id, true),
            None => (libc::CLOCK_MONOTONIC, false),
        };
        if !uses_cpu_time {
            self.stats.set_fallback_wallclock();
        }

        let tid = current_thread_id() as libc::pid_t;
        let sev = sigevent_for_thread(SAMPLING_SIGNAL, tid);
        let mut timer_id: libc::timer_t = std::ptr::null_mut();
        // SAFETY: `sev` and `timer_id` are valid, correctly sized
        // arguments for `timer_create`.
        let rc = unsafe { libc::timer_create(clock_id, &sev as *const _ as *mut libc::sigevent, &mut timer_id) };
        if rc != 0 {
            return Err(ProfilerError::ResourceExhausted("timer_create failed"));
        }

        Ok(ThreadEntry { timer_id })
    }

    fn arm_timer(&self, timer_id: libc::timer_t, interval_ns: u64) -> Result<(), ProfilerError> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: (interval_ns / 1_000_000_000) as i64,
                tv_nsec: (interval_ns % 1_000_000_000) as i64,
            },
            it_value: libc::timespec {
                tv_sec: (interval_ns / 1_000_000_000) as i64,
                tv_nsec: (interval_ns % 1_000_000_000) as i64,
            },
        };
        // SAFETY: `timer_id` was produced by a prior `timer_create` call
        // that has not since been deleted.
        let rc = unsafe { libc::timer_settime(timer_id, 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(ProfilerError::Transient("timer_settime"));
        }
        Ok(())
    }
}

/// Returns a CPU-time clock id bound to the calling thread, or `None` if
/// the kernel can't give us one (spec.md §4.A.1: "falling back to a
/// monotonic wall clock when the CPU-time clock cannot be created").
fn cpu_clock_id_for_current_thread() -> Option<libc::clockid_t> {
    // SAFETY: `pthread_self` takes no arguments and cannot fail.
    let self_thread = unsafe { libc::pthread_self() };
    let mut clock_id: libc::clockid_t = 0;
    // SAFETY: `self_thread` is a valid handle for the calling thread, and
    // `clock_id` is a valid out-parameter.
    let rc = unsafe { libc::pthread_getcpuclockid(self_thread, &mut clock_id) };
    if rc == 0 {
        Some(clock_id)
    } else {
        None
    }
}

impl PlatformSampler for LinuxSampler {
    fn init(&mut self, config: &ProfilerConfig) -> Result<(), ProfilerError> {
        if HANDLER_INSTALLED.load(Ordering::Acquire) {
            return Err(ProfilerError::AlreadyInitialised);
        }
        self.config = *config;
        Ok(())
    }

    fn start(&mut self, ring_buffer: Arc<RingBuffer>) -> Result<(), ProfilerError> {
        if RUNNING.swap(true, Ordering::AcqRel) {
            return Err(ProfilerError::AlreadyRunning);
        }

        let state = Box::new(SharedState {
            ring_buffer,
            context: SamplerContext {
                accessors: self.accessors.clone(),
                stats: self.stats.clone(),
            },
            max_depth: self.config.max_depth,
            speculative: self.speculative_layout.is_some(),
            layout: self.speculative_layout,
        });
        SHARED.store(Box::into_raw(state), Ordering::Release);

        // SAFETY: installing a handler for a signal this crate owns
        // exclusively while the sampler runs (spec.md §4.A.1).
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_sample_signal as usize;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(SAMPLING_SIGNAL, &action, std::ptr::null_mut()) != 0 {
                return Err(ProfilerError::Unsupported("installing SIGPROF handler"));
            }
        }
        HANDLER_INSTALLED.store(true, Ordering::Release);

        let interval_ns = self.config.interval_ns;
        let threads = self.threads.read();
        for entry in threads.values() {
            self.arm_timer(entry.timer_id, interval_ns)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ProfilerError> {
        if !RUNNING.swap(false, Ordering::AcqRel) {
            return Err(ProfilerError::NotRunning);
        }

        // Step 1: block the notification signal on the control thread.
        // SAFETY: a valid signal number and null old-set pointer.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, SAMPLING_SIGNAL);
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        }

        // Step 2: destroy each timer, accumulating overruns.
        let mut threads = self.threads.write();
        for entry in threads.values() {
            // SAFETY: `timer_id` is still valid; it's only deleted here or
            // in `unregister_thread`, both under `self.threads`'s lock.
            let overrun = unsafe { libc::timer_getoverrun(entry.timer_id) };
            if overrun > 0 {
                self.overruns.fetch_add(overrun as u64, Ordering::Relaxed);
                self.stats.record_timer_overruns(overrun as u64);
            }
            unsafe {
                libc::timer_delete(entry.timer_id);
            }
        }
        threads.clear();

        // Step 3: drain any pending signals with a zero-timeout wait so
        // this never blocks.
        // SAFETY: valid arguments; `sigtimedwait` with a zeroed timeout
        // returns immediately whether or not a signal was pending.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, SAMPLING_SIGNAL);
            let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            while libc::sigtimedwait(&set, std::ptr::null_mut(), &zero) >= 0 {}
        }

        // Step 4: ignore the signal rather than restoring SIG_DFL. Each
        // timer was SIGEV_THREAD_ID, delivered straight to the thread that
        // owned it, not to this (control) thread, so step 3's
        // `sigtimedwait` only ever drains signals already pending for the
        // caller — one can still be in flight for another thread here.
        // SIGPROF's default disposition is process termination, so
        // SIG_DFL would turn a late, already-queued signal into a crash;
        // SIG_IGN discards it harmlessly instead.
        // SAFETY: same as the install in `start`.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = libc::SIG_IGN;
            libc::sigaction(SAMPLING_SIGNAL, &action, std::ptr::null_mut());
        }
        HANDLER_INSTALLED.store(false, Ordering::Release);

        // SAFETY: the handler is uninstalled and no signal can be in
        // flight, so reclaiming the state this pointer owns is sound.
        let old = SHARED.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            unsafe {
                drop(Box::from_raw(old));
            }
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), ProfilerError> {
        let threads = self.threads.read();
        for entry in threads.values() {
            self.arm_timer(entry.timer_id, 0)?;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<(), ProfilerError> {
        let threads = self.threads.read();
        let interval_ns = self.config.interval_ns;
        for entry in threads.values() {
            self.arm_timer(entry.timer_id, interval_ns)?;
        }
        Ok(())
    }

    fn register_thread(&self) -> Result<(), ProfilerError> {
        let entry = self.create_timer_for_current_thread()?;
        if RUNNING.load(Ordering::Acquire) {
            self.arm_timer(entry.timer_id, self.config.interval_ns)?;
        }
        self.threads.write().insert(current_thread_id(), entry);
        Ok(())
    }

    fn unregister_thread(&self) {
        if let Some(entry) = self.threads.write().remove(&current_thread_id()) {
            unsafe {
                libc::timer_delete(entry.timer_id);
            }
        }
    }

    fn get_stats(&self) -> Stats {
        self.stats.snapshot()
    }
}
