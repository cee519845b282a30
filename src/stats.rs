//! Stats counters (spec.md §6, "Outputs produced" — stats structure).
//!
//! Counters live as atomics behind a shared handle so the capture path
//! (which must never take a lock) and the resolver can both update them,
//! and `get_stats()` can be a non-blocking snapshot (spec.md §4.A.5).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_derive::Serialize;

#[derive(Debug, Default)]
struct Counters {
    samples_captured: AtomicU64,
    samples_dropped: AtomicU64,
    validation_drops: AtomicU64,
    timer_overruns: AtomicU64,
    threads_sampled: AtomicU64,
    threads_skipped: AtomicU64,
    suspend_time_ns_total: AtomicU64,
    suspend_time_ns_max: AtomicU64,
    walk_errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    interpreter_frame_mismatches: AtomicU64,
    invalid_frame_count: AtomicU64,
    total_timer_ticks: AtomicU64,
    fallback_wallclock: AtomicBool,
}

/// A cheaply-cloneable shared handle to the profiler's counters.
#[derive(Debug, Default, Clone)]
pub struct StatsHandle(Arc<Counters>);

impl StatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_capture(&self) {
        self.0.samples_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.0.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_drop(&self) {
        self.0.validation_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_overruns(&self, n: u64) {
        self.0.timer_overruns.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_thread_sampled(&self) {
        self.0.threads_sampled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_thread_skipped(&self) {
        self.0.threads_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspend_duration(&self, ns: u64) {
        self.0
            .suspend_time_ns_total
            .fetch_add(ns, Ordering::Relaxed);
        self.0.suspend_time_ns_max.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn record_walk_error(&self) {
        self.0.walk_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.0.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.0.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interpreter_frame_mismatch(&self) {
        self.0
            .interpreter_frame_mismatches
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_frame(&self) {
        self.0.invalid_frame_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_tick(&self) {
        self.0.total_timer_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_fallback_wallclock(&self) {
        self.0.fallback_wallclock.store(true, Ordering::Relaxed);
    }

    /// Non-blocking snapshot (spec.md §4.A.5).
    pub fn snapshot(&self) -> Stats {
        let c = &self.0;
        Stats {
            samples_captured: c.samples_captured.load(Ordering::Relaxed),
            samples_dropped: c.samples_dropped.load(Ordering::Relaxed),
            validation_drops: c.validation_drops.load(Ordering::Relaxed),
            timer_overruns: c.timer_overruns.load(Ordering::Relaxed),
            threads_sampled: c.threads_sampled.load(Ordering::Relaxed),
            threads_skipped: c.threads_skipped.load(Ordering::Relaxed),
            suspend_time_ns_total: c.suspend_time_ns_total.load(Ordering::Relaxed),
            suspend_time_ns_max: c.suspend_time_ns_max.load(Ordering::Relaxed),
            walk_errors: c.walk_errors.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            interpreter_frame_mismatches: c.interpreter_frame_mismatches.load(Ordering::Relaxed),
            invalid_frame_count: c.invalid_frame_count.load(Ordering::Relaxed),
            total_timer_ticks: c.total_timer_ticks.load(Ordering::Relaxed),
            fallback_wallclock: c.fallback_wallclock.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of the counters (spec.md §6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub samples_captured: u64,
    pub samples_dropped: u64,
    pub validation_drops: u64,
    pub timer_overruns: u64,
    pub threads_sampled: u64,
    pub threads_skipped: u64,
    pub suspend_time_ns_total: u64,
    pub suspend_time_ns_max: u64,
    pub walk_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub interpreter_frame_mismatches: u64,
    pub invalid_frame_count: u64,
    pub total_timer_ticks: u64,
    /// Set when the per-thread CPU-time clock was unavailable and the
    /// sampler fell back to a monotonic wall clock (spec.md §4.A.1,
    /// scenario 6).
    pub fallback_wallclock: bool,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "captured={} dropped={} validation_drops={} cache_hits={} cache_misses={} \
             invalid_frames={} walk_errors={} threads_sampled={} threads_skipped={}",
            self.samples_captured,
            self.samples_dropped,
            self.validation_drops,
            self.cache_hits,
            self.cache_misses,
            self.invalid_frame_count,
            self.walk_errors,
            self.threads_sampled,
            self.threads_skipped,
        )
    }
}

/// A diagnostic hint for a workload that produced too few samples
/// (spec.md §7, "User-visible behaviour"). Pure function over a `Stats`
/// snapshot so the façade can print it without owning the decision logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    Ok,
    WorkloadTooShort,
    SamplingTooAggressive,
    ContainerRestricted,
}

pub fn diagnose(stats: &Stats) -> Diagnostic {
    if stats.samples_captured >= 2 {
        return Diagnostic::Ok;
    }
    if stats.fallback_wallclock {
        return Diagnostic::ContainerRestricted;
    }
    if stats.total_timer_ticks > stats.samples_captured * 10 {
        return Diagnostic::SamplingTooAggressive;
    }
    Diagnostic::WorkloadTooShort
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnose_ok_when_enough_samples() {
        let stats = Stats {
            samples_captured: 50,
            ..Stats::default()
        };
        assert_eq!(diagnose(&stats), Diagnostic::Ok);
    }

    #[test]
    fn diagnose_container_restricted_when_fallback_and_few_samples() {
        let stats = Stats {
            samples_captured: 1,
            fallback_wallclock: true,
            ..Stats::default()
        };
        assert_eq!(diagnose(&stats), Diagnostic::ContainerRestricted);
    }

    #[test]
    fn diagnose_workload_too_short_by_default() {
        let stats = Stats {
            samples_captured: 0,
            ..Stats::default()
        };
        assert_eq!(diagnose(&stats), Diagnostic::WorkloadTooShort);
    }

    #[test]
    fn display_includes_captured_and_dropped_counts() {
        let stats = Stats {
            samples_captured: 3,
            samples_dropped: 1,
            ..Stats::default()
        };
        let rendered = stats.to_string();
        assert!(rendered.contains("captured=3"));
        assert!(rendered.contains("dropped=1"));
    }

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let handle = StatsHandle::new();
        handle.record_capture();
        handle.record_capture();
        handle.record_drop();
        let snap = handle.snapshot();
        assert_eq!(snap.samples_captured, 2);
        assert_eq!(snap.samples_dropped, 1);
    }
}
