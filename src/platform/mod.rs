//! Platform samplers (spec.md §4.A): the public contract is the same on
//! every OS ([`PlatformSampler`]); the driving mechanism differs.

use std::sync::Arc;

use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use crate::ringbuffer::RingBuffer;
use crate::runtime::RuntimeAccessors;
use crate::stats::Stats;

pub mod speculative;

#[cfg(any(target_os = "android", target_os = "linux"))]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(windows)]
pub mod windows;

/// Operations exposed to the façade (spec.md §4.A.5). Every platform
/// variant implements the same contract so the layer above never branches
/// on OS.
pub trait PlatformSampler: Send + Sync {
    /// Allocates timers/threads. Idempotent; calling twice without an
    /// intervening `stop` fails with `AlreadyInitialised`.
    fn init(&mut self, config: &ProfilerConfig) -> Result<(), ProfilerError>;

    /// Validates `1ms <= interval <= 1s` (already enforced by
    /// [`ProfilerConfig::validate`]) and begins driving capture into
    /// `ring_buffer`.
    fn start(&mut self, ring_buffer: Arc<RingBuffer>) -> Result<(), ProfilerError>;

    /// Drains pending ticks before returning.
    fn stop(&mut self) -> Result<(), ProfilerError>;

    /// No-op on platforms without disarmable timers.
    fn pause(&mut self) -> Result<(), ProfilerError> {
        Ok(())
    }

    fn resume(&mut self) -> Result<(), ProfilerError> {
        Ok(())
    }

    /// Required on the per-thread-timer platform; no-op elsewhere.
    fn register_thread(&self) -> Result<(), ProfilerError> {
        Ok(())
    }

    fn unregister_thread(&self) {}

    fn get_stats(&self) -> Stats;
}

/// Shared plumbing every variant needs: the runtime accessor trait object
/// capture delegates to once a thread state pointer is known, and the
/// shared stats handle.
pub(crate) struct SamplerContext {
    pub accessors: Arc<dyn RuntimeAccessors>,
    pub stats: crate::stats::StatsHandle,
}
