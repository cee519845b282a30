//! Code-object reference registry (spec.md §4.C).
//!
//! Holds strong references to captured managed-code addresses across the
//! producer/consumer boundary, so the resolver can safely dereference a
//! pointer that was valid at capture time even if a collection has since
//! run. Reads (the resolver's `validate` calls) dominate, so the map sits
//! behind a `parking_lot::RwLock` rather than a global mutex.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sample::{CodeAddress, FrameKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// The address is live; carries the kind recorded for it at
    /// `add_refs_batch` time (spec.md §3's `validated_kind`).
    Valid(FrameKind),
    InvalidFreed,
    InvalidNotHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    strong_ref_count: u32,
    /// The epoch supplied by the caller that most recently added a
    /// reference to this address (spec.md §4.C `add_refs_batch`). Compared
    /// against the epoch a resolver passes to `validate` for the specific
    /// sample it captured this address under, not against the registry's
    /// own current epoch.
    gc_epoch: u64,
    /// The kind this address was classified as when last referenced. The
    /// registry only ever holds references to managed code objects (spec.md
    /// §3's invariant for component C), so this is always `Managed` today;
    /// kept as a real field because the data model names it, and because a
    /// future caller that also registers native-code trampolines would set
    /// it per-batch instead of assuming.
    validated_kind: FrameKind,
}

/// Concurrent address -> strong-reference map (spec.md §4.C, §9 "Reference-
/// counted cyclic object graphs").
pub struct CodeRegistry {
    entries: RwLock<FxHashMap<CodeAddress, Entry>>,
    gc_epoch: AtomicU64,
    safe_mode: std::sync::atomic::AtomicBool,
}

impl Default for CodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            gc_epoch: AtomicU64::new(0),
            safe_mode: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Called while the runtime lock is held and the target thread is
    /// either the caller itself or suspended (spec.md §4.C). `gc_epoch` is
    /// the epoch in effect when the caller captured these addresses
    /// (typically read via [`Self::get_gc_epoch`] just before this call),
    /// not necessarily the registry's current epoch by the time this runs.
    pub fn add_refs_batch(&self, addresses: &[CodeAddress], gc_epoch: u64) {
        if addresses.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        for addr in addresses {
            let entry = entries.entry(*addr).or_insert(Entry {
                strong_ref_count: 0,
                gc_epoch,
                validated_kind: FrameKind::Managed,
            });
            entry.strong_ref_count += 1;
            entry.gc_epoch = gc_epoch;
            entry.validated_kind = FrameKind::Managed;
        }
    }

    /// Called after the resolver has produced a resolved sample for these
    /// addresses.
    pub fn release_refs_batch(&self, addresses: &[CodeAddress]) {
        if addresses.is_empty() {
            return;
        }
        let mut entries = self.entries.write();
        for addr in addresses {
            if let Some(entry) = entries.get_mut(addr) {
                entry.strong_ref_count = entry.strong_ref_count.saturating_sub(1);
                if entry.strong_ref_count == 0 {
                    entries.remove(addr);
                }
            }
        }
    }

    /// Classifies an address the resolver is about to dereference
    /// (spec.md §4.C). `epoch` is the epoch that was current when the
    /// resolver's caller captured this particular address (carried on the
    /// raw sample), not the registry's own latest epoch — a held reference
    /// is always live regardless of how many collections have run since,
    /// so only a mismatch between the two identifies an address whose slot
    /// was freed and reused since this specific sample was captured.
    pub fn validate(&self, address: CodeAddress, epoch: u64) -> ValidationResult {
        let entries = self.entries.read();
        match entries.get(&address) {
            Some(entry) if entry.strong_ref_count > 0 => {
                if self.safe_mode.load(Ordering::Relaxed) && entry.gc_epoch != epoch {
                    ValidationResult::InvalidFreed
                } else {
                    ValidationResult::Valid(entry.validated_kind)
                }
            }
            Some(_) => ValidationResult::InvalidFreed,
            None => {
                if self.safe_mode.load(Ordering::Relaxed) {
                    ValidationResult::InvalidNotHeld
                } else {
                    // Outside safe mode we trust addresses the capture
                    // path validated as pointers even if the registry
                    // never held a reference for them (platforms that
                    // guarantee liveness by construction, spec.md §8
                    // invariant 4).
                    ValidationResult::Valid(FrameKind::Managed)
                }
            }
        }
    }

    /// When enabled, [`validate`] returns `InvalidNotHeld` for any address
    /// not currently held, even if it looks otherwise valid (spec.md §4.C).
    pub fn set_safe_mode(&self, enabled: bool) {
        self.safe_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Relaxed)
    }

    /// Monotonically increasing counter, incremented on each observed
    /// collection boundary.
    pub fn bump_gc_epoch(&self) -> u64 {
        self.gc_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The epoch a caller should read before capturing addresses it will
    /// hand to [`Self::add_refs_batch`] (spec.md §4.C).
    pub fn get_gc_epoch(&self) -> u64 {
        self.gc_epoch.load(Ordering::Acquire)
    }

    /// Cleared on profiler shutdown (spec.md §3, "Lifecycles").
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unheld_address_is_trusted_outside_safe_mode() {
        let registry = CodeRegistry::new();
        assert_eq!(
            registry.validate(CodeAddress(0x1000), 0),
            ValidationResult::Valid(FrameKind::Managed)
        );
    }

    #[test]
    fn unheld_address_is_invalid_not_held_in_safe_mode() {
        let registry = CodeRegistry::new();
        registry.set_safe_mode(true);
        assert_eq!(
            registry.validate(CodeAddress(0x1000), 0),
            ValidationResult::InvalidNotHeld
        );
    }

    #[test]
    fn held_address_validates() {
        let registry = CodeRegistry::new();
        registry.add_refs_batch(&[CodeAddress(0x1000)], 0);
        assert_eq!(
            registry.validate(CodeAddress(0x1000), 0),
            ValidationResult::Valid(FrameKind::Managed)
        );
    }

    #[test]
    fn release_drops_refcount_to_zero_and_removes_entry() {
        let registry = CodeRegistry::new();
        registry.set_safe_mode(true);
        registry.add_refs_batch(&[CodeAddress(0x1000)], 0);
        registry.add_refs_batch(&[CodeAddress(0x1000)], 0);
        registry.release_refs_batch(&[CodeAddress(0x1000)]);
        assert_eq!(
            registry.validate(CodeAddress(0x1000), 0),
            ValidationResult::Valid(FrameKind::Managed)
        );
        registry.release_refs_batch(&[CodeAddress(0x1000)]);
        assert_eq!(
            registry.validate(CodeAddress(0x1000), 0),
            ValidationResult::InvalidNotHeld
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn safe_mode_rejects_unheld_addresses() {
        let registry = CodeRegistry::new();
        registry.set_safe_mode(true);
        assert_eq!(
            registry.validate(CodeAddress(0x2000), 0),
            ValidationResult::InvalidNotHeld
        );
    }

    #[test]
    fn safe_mode_still_validates_a_held_address_after_an_unrelated_epoch_bump() {
        // A genuinely held reference must stay valid across collections it
        // didn't participate in (spec.md §3's core liveness guarantee);
        // only a caller presenting a stale epoch for *this* address should
        // be rejected.
        let registry = CodeRegistry::new();
        registry.set_safe_mode(true);
        let epoch = registry.get_gc_epoch();
        registry.add_refs_batch(&[CodeAddress(0x1000)], epoch);
        registry.bump_gc_epoch();
        assert_eq!(
            registry.validate(CodeAddress(0x1000), epoch),
            ValidationResult::Valid(FrameKind::Managed)
        );
    }

    #[test]
    fn safe_mode_flags_an_address_reused_since_this_capture_as_invalid_freed() {
        let registry = CodeRegistry::new();
        registry.set_safe_mode(true);
        let stale_epoch = registry.get_gc_epoch();
        registry.bump_gc_epoch();
        let current_epoch = registry.get_gc_epoch();
        // A later capture re-adds the same address under a newer epoch,
        // simulating the slot being freed and reused.
        registry.add_refs_batch(&[CodeAddress(0x1000)], current_epoch);
        assert_eq!(
            registry.validate(CodeAddress(0x1000), stale_epoch),
            ValidationResult::InvalidFreed
        );
    }

    #[test]
    fn shutdown_clears_all_entries() {
        let registry = CodeRegistry::new();
        registry.add_refs_batch(&[CodeAddress(0x1), CodeAddress(0x2)], 0);
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn start_stop_twice_leaves_registry_empty_both_times() {
        // spec.md §8 round-trip law.
        let registry = CodeRegistry::new();
        for _ in 0..2 {
            registry.add_refs_batch(&[CodeAddress(0x10)], 0);
            assert!(!registry.is_empty());
            registry.clear();
            assert!(registry.is_empty());
        }
    }
}
