//! Frame capture (spec.md §4.B).
//!
//! Walks the managed frame chain from a given thread state, skipping shim
//! frames, bounded by `max_depth` and a hard iteration limit so a corrupted
//! chain can't spin forever. Two entry points mirror spec.md §4.B exactly:
//! [`capture_self_thread`] (async-signal-safe, reads the thread state from
//! the runtime's own thread-local storage) and [`capture_other_thread`]
//! (not signal-safe; used by the suspension-based sampler with an explicit
//! thread-state pointer it already obtained while the target was frozen).

use crate::error::CaptureFault;
use crate::runtime::{RuntimeAccessors, ThreadStateAddr};
use crate::sample::RawSample;

/// Hard ceiling on walk iterations regardless of `max_depth`, to bound the
/// cost of a corrupted chain (spec.md §4.B: "a hard iteration limit (e.g.
/// 500)").
pub const HARD_ITERATION_LIMIT: usize = 500;

/// Self-thread capture: reads the thread state from OS thread-local
/// storage via the runtime accessor, then walks it. Async-signal-safe as
/// long as `accessors.current_thread_state()` and the walk itself only
/// perform direct memory reads (no allocation, no locks) — which is the
/// accessor implementation's obligation, not this function's.
pub fn capture_self_thread(
    accessors: &dyn RuntimeAccessors,
    max_depth: usize,
    out: &mut RawSample,
) -> Result<(), CaptureFault> {
    let tstate = accessors
        .current_thread_state()
        .ok_or(CaptureFault::InvalidPointer)?;
    capture_other_thread(accessors, tstate, max_depth, out)
}

/// Other-thread capture: the caller has already obtained a stable
/// thread-state pointer (typically because the target thread is
/// suspended). Not signal-safe.
pub fn capture_other_thread(
    accessors: &dyn RuntimeAccessors,
    tstate: ThreadStateAddr,
    max_depth: usize,
    out: &mut RawSample,
) -> Result<(), CaptureFault> {
    out.managed_depth = 0;
    out.truncated = false;

    let mut frame = accessors.current_frame(tstate);
    let mut iterations = 0usize;

    while let Some(f) = frame {
        iterations += 1;
        if iterations > HARD_ITERATION_LIMIT {
            out.truncated = true;
            return Err(CaptureFault::IterationLimitReached);
        }

        if accessors.is_shim(f) {
            frame = accessors.previous(f);
            continue;
        }

        if out.managed_depth >= max_depth {
            out.truncated = true;
            break;
        }

        out.managed_frames[out.managed_depth] = accessors.code(f);
        out.managed_instr_ptrs[out.managed_depth] = accessors.instr_ptr(f);
        out.managed_depth += 1;

        frame = accessors.previous(f);
    }

    Ok(())
}
