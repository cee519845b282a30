//! Core of an in-process sampling profiler for a managed runtime: platform
//! samplers, an SPSC ring buffer, a code-object reference registry, and a
//! resolver that merges native and managed frames.
//!
//! This crate has no opinion on the managed-language-facing façade
//! (`start`/`stop`, a context manager, a decorator), on output encoding
//! (flamegraph text, interactive JSON), or on a separate allocation
//! profiler — those are built on top of what's exposed here.

pub mod capture;
pub mod config;
pub mod dynamic_loader;
pub mod error;
pub mod platform;
pub mod registry;
pub mod resolver;
pub mod ringbuffer;
pub mod runtime;
pub mod sample;
pub mod stats;
pub mod symbol_cache;

#[cfg(target_os = "macos")]
mod mac;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::ProfilerConfig;
use crate::error::ProfilerError;
use crate::platform::PlatformSampler;
use crate::registry::CodeRegistry;
use crate::ringbuffer::RingBuffer;
use crate::runtime::RuntimeAccessors;
use crate::stats::Stats;

pub use crate::dynamic_loader::{DynamicLoader, LoadedModule};
pub use crate::resolver::{InterpreterModule, Resolver};
pub use crate::sample::{FrameKind, RawSample, ResolvedFrame, ResolvedSample};
pub use crate::stats::{diagnose, Diagnostic};

/// The profiler's top-level handle (spec.md §4.A.5's public contract,
/// lifted above the per-platform sampler). Owns the platform sampler, the
/// ring buffer, and the code registry; the resolver is constructed
/// separately by the caller since it borrows the registry and accessors
/// for as long as it drains samples.
pub struct Profiler {
    sampler: Box<dyn PlatformSampler>,
    ring_buffer: Arc<RingBuffer>,
    registry: Arc<CodeRegistry>,
    config: ProfilerConfig,
    running: AtomicBool,
}

impl Profiler {
    /// Builds the appropriate platform sampler for the current target and
    /// validates `config`. Does not yet allocate OS resources; call
    /// [`Profiler::init`] for that.
    pub fn new(
        config: ProfilerConfig,
        accessors: Arc<dyn RuntimeAccessors>,
    ) -> Result<Self, ProfilerError> {
        config.validate()?;
        let registry = Arc::new(CodeRegistry::new());
        registry.set_safe_mode(config.safe_mode);
        let ring_buffer = Arc::new(RingBuffer::for_memory_budget(config.memory_limit_bytes));

        let sampler: Box<dyn PlatformSampler> = build_platform_sampler(&config, accessors, registry.clone())?;

        Ok(Self {
            sampler,
            ring_buffer,
            registry,
            config,
            running: AtomicBool::new(false),
        })
    }

    pub fn init(&mut self) -> Result<(), ProfilerError> {
        debug!("initialising profiler sampler");
        self.sampler.init(&self.config)
    }

    pub fn start(&mut self) -> Result<(), ProfilerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ProfilerError::AlreadyRunning);
        }
        info!(
            "starting sampler: interval_ns={} max_depth={}",
            self.config.interval_ns, self.config.max_depth
        );
        match self.sampler.start(self.ring_buffer.clone()) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    pub fn stop(&mut self) -> Result<(), ProfilerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(ProfilerError::NotRunning);
        }
        let result = self.sampler.stop();
        self.registry.clear();
        if let Err(err) = &result {
            warn!("sampler stop reported an error: {err}");
        }
        result
    }

    pub fn pause(&mut self) -> Result<(), ProfilerError> {
        self.sampler.pause()
    }

    pub fn resume(&mut self) -> Result<(), ProfilerError> {
        self.sampler.resume()
    }

    pub fn register_thread(&self) -> Result<(), ProfilerError> {
        self.sampler.register_thread()
    }

    pub fn unregister_thread(&self) {
        self.sampler.unregister_thread();
    }

    pub fn get_stats(&self) -> Stats {
        self.sampler.get_stats()
    }

    /// Exposes the ring buffer so a caller can build a [`Resolver`] that
    /// drains it. Kept separate from `Profiler` itself because the
    /// resolver also needs the embedder's `RuntimeAccessors` and dynamic
    /// loader, neither of which this crate constructs.
    pub fn ring_buffer(&self) -> Arc<RingBuffer> {
        self.ring_buffer.clone()
    }

    pub fn registry(&self) -> Arc<CodeRegistry> {
        self.registry.clone()
    }
}

fn build_platform_sampler(
    config: &ProfilerConfig,
    accessors: Arc<dyn RuntimeAccessors>,
    registry: Arc<CodeRegistry>,
) -> Result<Box<dyn PlatformSampler>, ProfilerError> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            let _ = config;
            Ok(Box::new(platform::mac::MacSampler::new(accessors, registry)))
        } else if #[cfg(any(target_os = "android", target_os = "linux"))] {
            let _ = registry;
            let layout = if config.assume_removable_runtime_lock {
                config.speculative_frame_layout
            } else {
                None
            };
            Ok(Box::new(platform::linux::LinuxSampler::new(accessors, layout)))
        } else if #[cfg(windows)] {
            let _ = registry;
            Ok(Box::new(platform::windows::WindowsSampler::new(accessors)))
        } else {
            let _ = (config, accessors, registry);
            Err(ProfilerError::Unsupported("no sampler implementation for this target"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::FakeRuntime;

    #[test]
    fn new_profiler_rejects_invalid_config() {
        let config = ProfilerConfig {
            interval_ns: 1,
            ..ProfilerConfig::default()
        };
        let accessors = Arc::new(FakeRuntime::new());
        assert!(Profiler::new(config, accessors).is_err());
    }

    #[test]
    fn double_start_is_rejected() {
        let accessors = Arc::new(FakeRuntime::new());
        let mut profiler = Profiler::new(ProfilerConfig::default(), accessors).unwrap();
        profiler.init().unwrap();
        profiler.start().unwrap();
        assert_eq!(profiler.start(), Err(ProfilerError::AlreadyRunning));
        profiler.stop().unwrap();
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let accessors = Arc::new(FakeRuntime::new());
        let mut profiler = Profiler::new(ProfilerConfig::default(), accessors).unwrap();
        profiler.init().unwrap();
        assert_eq!(profiler.stop(), Err(ProfilerError::NotRunning));
    }

    #[test]
    fn start_stop_twice_leaves_registry_empty_both_times() {
        // spec.md §8 round-trip law, exercised through the top-level handle.
        let accessors = Arc::new(FakeRuntime::new());
        let mut profiler = Profiler::new(ProfilerConfig::default(), accessors).unwrap();
        for _ in 0..2 {
            profiler.init().ok();
            profiler.start().unwrap();
            profiler.stop().unwrap();
            assert!(profiler.registry().is_empty());
        }
    }
}
