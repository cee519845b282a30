//! Symbol cache (spec.md §4.E): an N-way set-associative cache keyed by
//! `(code_address, instr_address)`, with pseudo-LRU eviction within a set.
//! Owned solely by the resolver, so no locking.

use crate::sample::{CodeAddress, InstrAddress, ResolvedFrame};

const WAYS: usize = 4;
const DEFAULT_SETS: usize = 256;

type Key = (CodeAddress, InstrAddress);

#[derive(Clone)]
struct Slot {
    key: Key,
    value: ResolvedFrame,
    occupied: bool,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            key: (CodeAddress(0), InstrAddress(0)),
            value: ResolvedFrame {
                kind: crate::sample::FrameKind::Native,
                function_name: String::new(),
                file_name: String::new(),
                line_number: 0,
            },
            occupied: false,
        }
    }
}

struct Set {
    slots: [Slot; WAYS],
    /// One bit per way; set when that way was the most-recently-used one
    /// in the set (spec.md §4.E "pseudo-LRU within a set").
    recently_used: [bool; WAYS],
}

impl Set {
    fn new() -> Self {
        Self {
            slots: [Slot::empty(), Slot::empty(), Slot::empty(), Slot::empty()],
            recently_used: [false; WAYS],
        }
    }

    fn touch(&mut self, way: usize) {
        self.recently_used[way] = true;
        if self.recently_used.iter().all(|&b| b) {
            self.recently_used = [false; WAYS];
            self.recently_used[way] = true;
        }
    }

    fn victim_way(&self) -> usize {
        self.recently_used
            .iter()
            .position(|&used| !used)
            .unwrap_or(0)
    }
}

/// A fixed-size symbol cache mapping resolved `(code, instr)` pairs to their
/// [`ResolvedFrame`]. Capacity is `DEFAULT_SETS * WAYS` entries.
pub struct SymbolCache {
    sets: Vec<Set>,
    mask: usize,
}

impl Default for SymbolCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::with_sets(DEFAULT_SETS)
    }

    pub fn with_sets(requested_sets: usize) -> Self {
        let num_sets = requested_sets.max(1).next_power_of_two();
        Self {
            sets: (0..num_sets).map(|_| Set::new()).collect(),
            mask: num_sets - 1,
        }
    }

    fn set_index(&self, key: Key) -> usize {
        // A cheap, well-distributed mix of the two addresses; this cache is
        // not exposed to adversarial input, so no need for anything fancier.
        let mixed = key.0 .0 ^ key.1 .0.rotate_left(17);
        mixed & self.mask
    }

    pub fn get(&mut self, key: Key) -> Option<ResolvedFrame> {
        let idx = self.set_index(key);
        let set = &mut self.sets[idx];
        for way in 0..WAYS {
            if set.slots[way].occupied && set.slots[way].key == key {
                set.touch(way);
                return Some(set.slots[way].value.clone());
            }
        }
        None
    }

    pub fn insert(&mut self, key: Key, value: ResolvedFrame) {
        let idx = self.set_index(key);
        let set = &mut self.sets[idx];

        for way in 0..WAYS {
            if set.slots[way].occupied && set.slots[way].key == key {
                set.slots[way].value = value;
                set.touch(way);
                return;
            }
        }

        let way = set
            .slots
            .iter()
            .position(|s| !s.occupied)
            .unwrap_or_else(|| set.victim_way());

        set.slots[way] = Slot {
            key,
            value,
            occupied: true,
        };
        set.touch(way);
    }

    pub fn len(&self) -> usize {
        self.sets
            .iter()
            .map(|s| s.slots.iter().filter(|slot| slot.occupied).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::FrameKind;

    fn key(code: usize, instr: usize) -> Key {
        (CodeAddress(code), InstrAddress(instr))
    }

    fn frame(name: &str) -> ResolvedFrame {
        ResolvedFrame::new(FrameKind::Managed, name, "f.py", 1)
    }

    #[test]
    fn miss_then_insert_then_hit() {
        let mut cache = SymbolCache::with_sets(4);
        assert!(cache.get(key(1, 2)).is_none());
        cache.insert(key(1, 2), frame("f"));
        assert_eq!(cache.get(key(1, 2)).unwrap().function_name, "f");
    }

    #[test]
    fn overwrite_updates_value_in_place() {
        let mut cache = SymbolCache::with_sets(4);
        cache.insert(key(1, 2), frame("old"));
        cache.insert(key(1, 2), frame("new"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(key(1, 2)).unwrap().function_name, "new");
    }

    #[test]
    fn fifth_insert_into_full_set_evicts_one_entry() {
        // With one set, all four ways collide; a fifth distinct key must
        // evict something rather than growing unboundedly.
        let mut cache = SymbolCache::with_sets(1);
        for i in 0..4u64 {
            cache.insert(key(i as usize, 0), frame("f"));
        }
        assert_eq!(cache.len(), 4);
        cache.insert(key(100, 0), frame("new"));
        assert_eq!(cache.len(), 4);
        assert!(cache.get(key(100, 0)).is_some());
    }

    #[test]
    fn recently_touched_entry_survives_eviction_pressure() {
        let mut cache = SymbolCache::with_sets(1);
        for i in 0..4u64 {
            cache.insert(key(i as usize, 0), frame("f"));
        }
        // Touch key 0 so it's marked most-recently-used, then force three
        // more evictions; key 0 should be the last one standing if the
        // pseudo-LRU policy gives it priority over untouched entries.
        cache.get(key(0, 0));
        cache.insert(key(200, 0), frame("f"));
        assert!(cache.get(key(0, 0)).is_some());
    }
}
