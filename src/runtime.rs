//! The managed-runtime accessor boundary (spec.md §4.B design note, §9
//! "Dynamic dispatch on managed-runtime frame layout").
//!
//! Everything capture/resolution needs from the embedding interpreter is
//! expressed as a trait rather than an inheritance hierarchy: a fixed set
//! of small accessor functions, the way spec.md §9 asks for ("model as a
//! compile-time-selected set of accessor functions ... avoids inheritance
//! hierarchies and cuts indirection cost"). A real embedding selects one
//! concrete implementation at compile time (a Cargo feature per supported
//! runtime version); no concrete implementation ships with this crate,
//! since no managed runtime is part of this corpus. [`testing::FakeRuntime`]
//! is the stand-in used by this crate's own tests.

use crate::sample::{CodeAddress, InstrAddress};

/// Opaque address of a managed thread-state object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadStateAddr(pub usize);

/// Opaque address of a managed frame object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameAddr(pub usize);

/// Read-only (plus the two explicitly-mutating exceptions below) accessors
/// into the embedding managed runtime (spec.md §6, "Inputs from external
/// collaborators").
///
/// Implementations must be safe to call from the thread that owns the
/// `ThreadStateAddr` being walked (self-thread capture) as well as, for the
/// suspension-based sampler, from a dedicated sampler thread once the
/// target thread is suspended and the runtime lock is held (other-thread
/// capture). They must *not* be called from an async-signal-safe context;
/// that context uses the separate raw/speculative path in
/// [`crate::platform::speculative`] instead.
pub trait RuntimeAccessors: Send + Sync {
    /// Reads the calling thread's thread-state pointer out of the
    /// runtime's thread-local storage. Only valid when called on the
    /// thread being profiled (self-thread capture).
    fn current_thread_state(&self) -> Option<ThreadStateAddr>;

    fn current_frame(&self, tstate: ThreadStateAddr) -> Option<FrameAddr>;
    fn previous(&self, frame: FrameAddr) -> Option<FrameAddr>;
    fn code(&self, frame: FrameAddr) -> CodeAddress;
    fn instr_ptr(&self, frame: FrameAddr) -> InstrAddress;
    fn owner(&self, frame: FrameAddr) -> ThreadStateAddr;

    /// An internal frame the runtime inserts to mark a native/managed
    /// boundary; the walker skips it (spec.md glossary, "Shim frame").
    fn is_shim(&self, frame: FrameAddr) -> bool;

    fn code_to_name_file(&self, code: CodeAddress) -> Option<(String, String)>;
    fn code_to_line_from_instruction(&self, code: CodeAddress, instr: InstrAddress) -> Option<u32>;

    /// Iterates every thread known to the runtime (suspension/timer-queue
    /// variants; spec.md §4.A.2, §4.A.3).
    fn thread_list(&self) -> Vec<ThreadStateAddr>;

    /// Acquires the runtime's global execution lock. Required before any
    /// other method on this trait may be called from a thread other than
    /// the one owning the `ThreadStateAddr`.
    fn acquire_runtime_lock(&self);
    fn release_runtime_lock(&self);

    /// Raw pinning hook some runtimes expose directly on the managed
    /// object's own reference count, distinct from this crate's internal
    /// [`crate::registry::CodeRegistry`] bookkeeping (spec.md §6 lists
    /// "reference-count increment/decrement" as an accessor in its own
    /// right). Most embeddings have no use for this and can leave the
    /// default no-op.
    fn increment_refcount(&self, _code: CodeAddress) {}
    fn decrement_refcount(&self, _code: CodeAddress) {}
}

pub mod testing {
    //! An in-memory fake runtime used by this crate's own test suite
    //! (spec.md's ambient test-tooling expansion, SPEC_FULL.md §2.4).
    //! Not part of the public contract an embedder relies on.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    pub struct FakeFrame {
        pub code: CodeAddress,
        pub instr: InstrAddress,
        pub is_shim: bool,
        pub name: String,
        pub file: String,
        pub line: u32,
    }

    /// A fake managed runtime: each thread has a fixed, caller-supplied
    /// stack of frames (innermost first) and an optional cyclic tail to
    /// exercise the hard iteration limit.
    pub struct FakeRuntime {
        threads: Mutex<HashMap<u64, Vec<FakeFrame>>>,
        cyclic_tail: Mutex<Option<u64>>,
        lock_held: std::sync::atomic::AtomicBool,
        current_tid: Mutex<Option<u64>>,
    }

    impl Default for FakeRuntime {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            Self {
                threads: Mutex::new(HashMap::new()),
                cyclic_tail: Mutex::new(None),
                lock_held: std::sync::atomic::AtomicBool::new(false),
                current_tid: Mutex::new(None),
            }
        }

        pub fn set_thread_stack(&self, tid: u64, frames: Vec<FakeFrame>) {
            self.threads.lock().insert(tid, frames);
        }

        /// Makes the named thread's innermost frame loop back to itself,
        /// to exercise cycle detection / the hard iteration limit.
        pub fn make_cyclic(&self, tid: u64) {
            *self.cyclic_tail.lock() = Some(tid);
        }

        pub fn set_current_thread(&self, tid: u64) {
            *self.current_tid.lock() = Some(tid);
        }

        pub fn thread_ids(&self) -> Vec<u64> {
            self.threads.lock().keys().copied().collect()
        }

        fn frame_at(&self, tid: u64, index: usize) -> Option<(FakeFrame, usize)> {
            let threads = self.threads.lock();
            let frames = threads.get(&tid)?;
            if frames.is_empty() {
                return None;
            }
            if index < frames.len() {
                Some((frames[index].clone(), index))
            } else if *self.cyclic_tail.lock() == Some(tid) {
                // Loop back to the last frame forever.
                Some((frames[frames.len() - 1].clone(), frames.len() - 1))
            } else {
                None
            }
        }
    }

    // Encodes a (tid, index) pair into a FrameAddr/ThreadStateAddr so the
    // trait methods can recover position without extra bookkeeping.
    fn encode(tid: u64, index: usize) -> usize {
        ((tid as usize) << 32) | index
    }

    fn decode(addr: usize) -> (u64, usize) {
        ((addr >> 32) as u64, addr & 0xFFFF_FFFF)
    }

    impl RuntimeAccessors for FakeRuntime {
        fn current_thread_state(&self) -> Option<ThreadStateAddr> {
            self.current_tid
                .lock()
                .map(|tid| ThreadStateAddr(encode(tid, 0)))
        }

        fn current_frame(&self, tstate: ThreadStateAddr) -> Option<FrameAddr> {
            let (tid, _) = decode(tstate.0);
            self.frame_at(tid, 0).map(|_| FrameAddr(encode(tid, 0)))
        }

        fn previous(&self, frame: FrameAddr) -> Option<FrameAddr> {
            let (tid, index) = decode(frame.0);
            self.frame_at(tid, index + 1)
                .map(|(_, real_index)| FrameAddr(encode(tid, real_index + 1)))
        }

        fn code(&self, frame: FrameAddr) -> CodeAddress {
            let (tid, index) = decode(frame.0);
            self.frame_at(tid, index).map(|(f, _)| f.code).unwrap_or(CodeAddress(0))
        }

        fn instr_ptr(&self, frame: FrameAddr) -> InstrAddress {
            let (tid, index) = decode(frame.0);
            self.frame_at(tid, index).map(|(f, _)| f.instr).unwrap_or(InstrAddress(0))
        }

        fn owner(&self, frame: FrameAddr) -> ThreadStateAddr {
            let (tid, _) = decode(frame.0);
            ThreadStateAddr(encode(tid, 0))
        }

        fn is_shim(&self, frame: FrameAddr) -> bool {
            let (tid, index) = decode(frame.0);
            self.frame_at(tid, index).map(|(f, _)| f.is_shim).unwrap_or(false)
        }

        fn code_to_name_file(&self, code: CodeAddress) -> Option<(String, String)> {
            for frames in self.threads.lock().values() {
                for frame in frames {
                    if frame.code == code {
                        return Some((frame.name.clone(), frame.file.clone()));
                    }
                }
            }
            None
        }

        fn code_to_line_from_instruction(
            &self,
            code: CodeAddress,
            _instr: InstrAddress,
        ) -> Option<u32> {
            for frames in self.threads.lock().values() {
                for frame in frames {
                    if frame.code == code {
                        return Some(frame.line);
                    }
                }
            }
            None
        }

        fn thread_list(&self) -> Vec<ThreadStateAddr> {
            self.thread_ids()
                .into_iter()
                .map(|tid| ThreadStateAddr(encode(tid, 0)))
                .collect()
        }

        fn acquire_runtime_lock(&self) {
            self.lock_held.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        fn release_runtime_lock(&self) {
            self.lock_held.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }
}
