//! Profiler configuration (spec.md §6's option table).
//!
//! Modeled after `samply-in-process`'s `RecordingProps` /
//! `ProfileCreationProps` (`shared/prop_types.rs`): a plain struct, cheap to
//! clone, serializable so an embedder can load it from JSON, validated by an
//! explicit method rather than at construction time.

use serde_derive::{Deserialize, Serialize};

use crate::error::ProfilerError;
use crate::platform::speculative::FrameLayout;

/// Default upper bound on captured stack depth (spec.md §3).
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Hard ceiling on `max_depth`; also used to size fixed raw-sample arrays.
pub const MAX_DEPTH_CEILING: usize = 1024;

const MIN_INTERVAL_NS: u64 = 1_000_000;
const MAX_INTERVAL_NS: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Sampling period in nanoseconds. Valid range `[1ms, 1s]`.
    pub interval_ns: u64,
    /// Upper bound for ring-buffer byte capacity.
    pub memory_limit_bytes: usize,
    /// Enable native-frame capture and trim-and-sandwich merging.
    pub native_unwinding: bool,
    /// Upper bound for captured stack depth, `<= MAX_DEPTH_CEILING`.
    pub max_depth: usize,
    /// Registry rejects addresses it doesn't currently hold, even if the
    /// address looks otherwise valid (spec.md §4.C).
    pub safe_mode: bool,
    /// Set when the embedding runtime has no global execution lock, so the
    /// signal-driven sampler must use the speculative walk (spec.md §4.A.4)
    /// instead of assuming frame-chain stability.
    pub assume_removable_runtime_lock: bool,
    /// The managed frame's struct layout, required when
    /// `assume_removable_runtime_lock` is set so the speculative walker
    /// knows where to find `previous`/`code`/`instr_ptr`/the type tag.
    /// Unused (and may be left `None`) when the flag is clear.
    pub speculative_frame_layout: Option<FrameLayout>,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            interval_ns: 1_000_000,
            memory_limit_bytes: 4 * 1024 * 1024,
            native_unwinding: true,
            max_depth: DEFAULT_MAX_DEPTH,
            safe_mode: false,
            assume_removable_runtime_lock: false,
            speculative_frame_layout: None,
        }
    }
}

impl ProfilerConfig {
    pub fn validate(&self) -> Result<(), ProfilerError> {
        if !(MIN_INTERVAL_NS..=MAX_INTERVAL_NS).contains(&self.interval_ns) {
            return Err(ProfilerError::InvalidArgument(
                "interval_ns must be within [1_000_000, 1_000_000_000]",
            ));
        }
        if self.max_depth == 0 || self.max_depth > MAX_DEPTH_CEILING {
            return Err(ProfilerError::InvalidArgument(
                "max_depth must be within (0, MAX_DEPTH_CEILING]",
            ));
        }
        if self.memory_limit_bytes == 0 {
            return Err(ProfilerError::InvalidArgument(
                "memory_limit_bytes must be nonzero",
            ));
        }
        if self.assume_removable_runtime_lock && self.speculative_frame_layout.is_none() {
            return Err(ProfilerError::InvalidArgument(
                "speculative_frame_layout must be set when assume_removable_runtime_lock is true",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ProfilerConfig::default().validate().unwrap();
    }

    #[test]
    fn interval_boundary_1ms_is_accepted() {
        let cfg = ProfilerConfig {
            interval_ns: 1_000_000,
            ..ProfilerConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn interval_just_under_1ms_is_rejected() {
        let cfg = ProfilerConfig {
            interval_ns: 999_000,
            ..ProfilerConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ProfilerError::InvalidArgument(
                "interval_ns must be within [1_000_000, 1_000_000_000]"
            ))
        );
    }

    #[test]
    fn interval_boundary_1s_is_accepted() {
        let cfg = ProfilerConfig {
            interval_ns: 1_000_000_000,
            ..ProfilerConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_max_depth_is_rejected() {
        let cfg = ProfilerConfig {
            max_depth: 0,
            ..ProfilerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn removable_runtime_lock_without_frame_layout_is_rejected() {
        let cfg = ProfilerConfig {
            assume_removable_runtime_lock: true,
            ..ProfilerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn removable_runtime_lock_with_frame_layout_is_accepted() {
        let cfg = ProfilerConfig {
            assume_removable_runtime_lock: true,
            speculative_frame_layout: Some(crate::platform::speculative::FrameLayout {
                previous_offset: 0,
                code_offset: 8,
                instr_ptr_offset: 16,
                type_tag_offset: 24,
                expected_type_tag: 0xABCD,
            }),
            ..ProfilerConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
