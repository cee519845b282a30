//! Error taxonomy for the profiler core (spec.md §7).
//!
//! Two enums, mirroring the two execution contexts described by the spec:
//! [`ProfilerError`] crosses the `start`/`stop`/`init` contract boundary and
//! may be returned to the embedder synchronously. [`CaptureFault`] never
//! leaves the async-signal-safe capture routine as a thrown error — it is
//! always absorbed and counted (spec.md §7, "Propagation policy").

use thiserror::Error;

/// Errors surfaced synchronously through the sampler's public contract
/// (spec.md §4.A.5, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfilerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("sampler is already running")]
    AlreadyRunning,

    #[error("sampler is not running")]
    NotRunning,

    #[error("sampler is already initialised")]
    AlreadyInitialised,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    /// A setup operation failed with a retryable OS error. Retried once
    /// with a short backoff before being surfaced (spec.md §7).
    #[error("transient failure in {0}, retried and still failing")]
    Transient(&'static str),
}

/// A fault detected inside the capture routine (spec.md §4.B, §4.A.4, §7).
///
/// `Corrupted` faults are handled by discarding the offending frame or
/// sample; they are never propagated as a thrown error out of capture.
/// This type exists so that the capture routine has something to *return*
/// (an explicit result, per spec.md §9's "exception-driven control flow is
/// forbidden") without ever unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFault {
    /// A candidate frame address failed pointer/alignment validation.
    InvalidPointer,
    /// The thread-local cycle-detection set already contains this address.
    CycleDetected,
    /// The type tag read from the candidate code object didn't match the
    /// cached tag recorded at start-up.
    TypeTagMismatch,
    /// The hard iteration limit (spec.md §4.B) was reached before the walk
    /// terminated naturally.
    IterationLimitReached,
}
