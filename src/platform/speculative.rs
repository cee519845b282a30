//! Speculative frame-chain walk (spec.md §4.A.4), used by the signal-driven
//! sampler ([`super::linux`]) when the embedding runtime has no global
//! execution lock and so frame-chain stability cannot be assumed.
//!
//! Unlike [`crate::capture`], which walks through the safe
//! [`crate::runtime::RuntimeAccessors`] trait, this module reads raw memory
//! directly at caller-supplied struct offsets (a [`FrameLayout`]) and
//! validates every step, because the accessor trait's own safety
//! obligations ("owning thread or held lock") don't hold here.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_derive::{Deserialize, Serialize};

use crate::error::CaptureFault;
use crate::sample::{CodeAddress, InstrAddress, RawSample};

/// Compile-time-selected description of where fields live inside a raw
/// managed frame struct (spec.md §9: "Dynamic dispatch on managed-runtime
/// frame layout ... model as a compile-time-selected set of accessor
/// functions"). An embedder builds one instance per supported runtime
/// ABI/version and feeds it in; this crate ships no concrete instance.
///
/// Carried as a field of [`crate::config::ProfilerConfig`] so the embedder
/// supplies it alongside `assume_removable_runtime_lock`, hence the same
/// derive set as that struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub previous_offset: usize,
    pub code_offset: usize,
    pub instr_ptr_offset: usize,
    pub type_tag_offset: usize,
    /// The type tag value a genuine code object carries, recorded once at
    /// start-up (spec.md §4.A.4 step 3).
    pub expected_type_tag: usize,
}

/// Reads a `usize`-sized field with acquire semantics on weakly ordered
/// architectures and a plain load on strongly ordered ones (spec.md §9,
/// "Memory ordering on speculative walk" / "Encode this as a single
/// abstraction `ordered_load(addr)`").
///
/// # Safety
/// `addr` must point to a valid, naturally aligned `usize` for the
/// duration of the read. Callers validate this with [`validate_pointer`]
/// before calling.
#[inline]
unsafe fn ordered_load(addr: *const usize) -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64"))] {
            unsafe { (*(addr as *const AtomicUsize)).load(Ordering::Acquire) }
        } else {
            unsafe { addr.read() }
        }
    }
}

/// Bounds/alignment check for a candidate frame address (spec.md §4.A.4
/// step 1, and §3's invariant that every address written to a raw sample
/// is non-null, in user space, and correctly aligned).
///
/// The user/kernel split is architecture- and OS-specific; we use a
/// conservative canonical-address heuristic rather than querying the OS
/// (which would not be async-signal-safe).
pub fn validate_pointer(addr: usize) -> bool {
    const USER_SPACE_CEILING: usize = 0x0000_7fff_ffff_ffff;
    addr != 0 && addr <= USER_SPACE_CEILING && addr % std::mem::align_of::<usize>() == 0
}

/// Fixed-capacity cycle-detection set over frame addresses (spec.md
/// §4.A.4 step 2: "a small thread-local seen-frames set"). Caller owns
/// the instance and is expected to reuse one per thread across samples,
/// clearing it between walks, so capture never allocates.
pub struct SeenFrames {
    seen: [usize; HARD_SEEN_CAPACITY],
    len: usize,
}

const HARD_SEEN_CAPACITY: usize = super::super::capture::HARD_ITERATION_LIMIT;

impl Default for SeenFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl SeenFrames {
    pub const fn new() -> Self {
        Self {
            seen: [0; HARD_SEEN_CAPACITY],
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Returns `true` (cycle detected) if `addr` was already present;
    /// otherwise inserts it and returns `false`.
    pub fn contains_or_insert(&mut self, addr: usize) -> bool {
        if self.seen[..self.len].contains(&addr) {
            return true;
        }
        if self.len < self.seen.len() {
            self.seen[self.len] = addr;
            self.len += 1;
        }
        false
    }
}

/// Walks a managed frame chain speculatively, validating every step, and
/// publishing a partial sample (with `out.truncated` set) on the first
/// failed validation rather than discarding the whole sample (spec.md
/// §4.A.4 step 5, resolving the open question in spec.md §9 in favor of
/// partial publication).
///
/// # Safety
/// `first_frame` must either be null (empty stack) or a value that, once
/// validated by [`validate_pointer`], is safe to read as a frame struct
/// laid out per `layout`.
pub unsafe fn walk_speculative(
    first_frame: usize,
    layout: &FrameLayout,
    max_depth: usize,
    seen: &mut SeenFrames,
    out: &mut RawSample,
) -> Result<(), CaptureFault> {
    out.managed_depth = 0;
    out.truncated = false;
    seen.clear();

    let mut frame = first_frame;
    let mut iterations = 0usize;

    while frame != 0 {
        iterations += 1;
        if iterations > HARD_ITERATION_LIMIT {
            out.truncated = true;
            return Err(CaptureFault::IterationLimitReached);
        }

        if !validate_pointer(frame) {
            out.truncated = true;
            return Err(CaptureFault::InvalidPointer);
        }

        if seen.contains_or_insert(frame) {
            out.truncated = true;
            return Err(CaptureFault::CycleDetected);
        }

        // SAFETY: `frame` passed `validate_pointer` above, and `layout`
        // describes the embedding runtime's frame struct.
        let type_tag = unsafe { ordered_load((frame + layout.type_tag_offset) as *const usize) };
        if type_tag != layout.expected_type_tag {
            out.truncated = true;
            return Err(CaptureFault::TypeTagMismatch);
        }

        if out.managed_depth < max_depth {
            // SAFETY: see above.
            let code = unsafe { ordered_load((frame + layout.code_offset) as *const usize) };
            let instr = unsafe { ordered_load((frame + layout.instr_ptr_offset) as *const usize) };
            out.managed_frames[out.managed_depth] = CodeAddress(code);
            out.managed_instr_ptrs[out.managed_depth] = InstrAddress(instr);
            out.managed_depth += 1;
        } else {
            out.truncated = true;
        }

        // SAFETY: see above; acquire semantics on weakly ordered arches
        // guarantee we see a fully-published `previous` link.
        frame = unsafe { ordered_load((frame + layout.previous_offset) as *const usize) };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct RawFrame {
        previous: usize,
        code: usize,
        instr_ptr: usize,
        type_tag: usize,
    }

    const TAG: usize = 0xC0DE;

    fn layout() -> FrameLayout {
        FrameLayout {
            previous_offset: std::mem::offset_of!(RawFrame, previous),
            code_offset: std::mem::offset_of!(RawFrame, code),
            instr_ptr_offset: std::mem::offset_of!(RawFrame, instr_ptr),
            type_tag_offset: std::mem::offset_of!(RawFrame, type_tag),
            expected_type_tag: TAG,
        }
    }

    #[test]
    fn validate_pointer_rejects_null_and_misaligned() {
        assert!(!validate_pointer(0));
        assert!(!validate_pointer(1));
        assert!(validate_pointer(std::mem::align_of::<usize>()));
    }

    #[test]
    fn walks_a_real_frame_chain() {
        let leaf = RawFrame {
            previous: 0,
            code: 0xAAA,
            instr_ptr: 0xAAB,
            type_tag: TAG,
        };
        let root = RawFrame {
            previous: &leaf as *const _ as usize,
            code: 0xBBB,
            instr_ptr: 0xBBC,
            type_tag: TAG,
        };
        let mut out = RawSample::empty();
        let mut seen = SeenFrames::new();
        let layout = layout();
        unsafe {
            walk_speculative(&root as *const _ as usize, &layout, 128, &mut seen, &mut out)
                .unwrap();
        }
        assert_eq!(out.managed_depth, 2);
        assert_eq!(out.managed_frames[0].0, 0xBBB);
        assert_eq!(out.managed_frames[1].0, 0xAAA);
        assert!(!out.truncated);
    }

    #[test]
    fn type_tag_mismatch_truncates_with_partial_publication() {
        let corrupt = RawFrame {
            previous: 0,
            code: 0xAAA,
            instr_ptr: 0xAAB,
            type_tag: 0xBAD,
        };
        let root = RawFrame {
            previous: &corrupt as *const _ as usize,
            code: 0xBBB,
            instr_ptr: 0xBBC,
            type_tag: TAG,
        };
        let mut out = RawSample::empty();
        let mut seen = SeenFrames::new();
        let layout = layout();
        let result = unsafe {
            walk_speculative(&root as *const _ as usize, &layout, 128, &mut seen, &mut out)
        };
        assert_eq!(result, Err(CaptureFault::TypeTagMismatch));
        // The root frame was still published before the failure.
        assert_eq!(out.managed_depth, 1);
        assert!(out.truncated);
    }

    #[test]
    fn self_referential_frame_is_caught_by_cycle_detection() {
        use std::cell::UnsafeCell;
        #[repr(C)]
        struct SelfRef {
            previous: UnsafeCell<usize>,
            code: usize,
            instr_ptr: usize,
            type_tag: usize,
        }
        let frame = SelfRef {
            previous: UnsafeCell::new(0),
            code: 0xCCC,
            instr_ptr: 0xCCD,
            type_tag: TAG,
        };
        let addr = &frame as *const _ as usize;
        unsafe {
            *frame.previous.get() = addr;
        }
        let layout = FrameLayout {
            previous_offset: std::mem::offset_of!(SelfRef, previous),
            code_offset: std::mem::offset_of!(SelfRef, code),
            instr_ptr_offset: std::mem::offset_of!(SelfRef, instr_ptr),
            type_tag_offset: std::mem::offset_of!(SelfRef, type_tag),
            expected_type_tag: TAG,
        };
        let mut out = RawSample::empty();
        let mut seen = SeenFrames::new();
        let result = unsafe { walk_speculative(addr, &layout, 128, &mut seen, &mut out) };
        assert_eq!(result, Err(CaptureFault::CycleDetected));
        assert_eq!(out.managed_depth, 1);
    }
}
