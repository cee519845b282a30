//! Native-frame symbolization (spec.md §4.E, "native PC resolution"):
//! mapping a raw program counter to the loaded module that contains it and
//! the nearest exported symbol, via the `object` crate (the same dependency
//! `samply-in-process` and `samply` use for reading unwind/symbol data out
//! of ELF/Mach-O/PE images).
//!
//! This module only resolves `module + symbol`; file/line information for
//! native frames is out of scope (spec.md Non-goals: no DWARF line-table
//! walking).

use std::collections::BTreeMap;
use std::fs::File;

use memmap2::Mmap;
use object::{Object, ObjectSymbol};

/// A loaded module's address range and the symbols found in it, sorted by
/// address so lookup is a single binary search (spec.md §4.E).
pub struct LoadedModule {
    pub path: String,
    pub base: u64,
    pub size: u64,
    symbols: BTreeMap<u64, String>,
}

impl LoadedModule {
    /// Reads and parses `path` at `base` load address. Returns `None` if
    /// the file can't be read or isn't an object format `object` supports;
    /// callers treat that the same as "no symbols for this module". The
    /// file is memory-mapped rather than read into a `Vec`, since a large
    /// shared object's symbol table is a small fraction of its bytes.
    pub fn load(path: &str, base: u64, size: u64) -> Option<Self> {
        let file = File::open(path).ok()?;
        // SAFETY: the mapping is read-only and only used for the duration
        // of this call; truncation of the backing file by another process
        // during symbol parsing is the caller's risk, same as for any
        // other profiler reading `/proc/*/maps`-listed modules.
        let mmap = unsafe { Mmap::map(&file).ok()? };
        let object_file = object::File::parse(&*mmap).ok()?;
        let mut symbols = BTreeMap::new();
        for sym in object_file.symbols() {
            if sym.address() == 0 {
                continue;
            }
            if let Ok(name) = sym.name() {
                symbols.insert(sym.address(), name.to_string());
            }
        }
        Some(Self {
            path: path.to_string(),
            base,
            size,
            symbols,
        })
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.base && pc < self.base + self.size
    }

    /// Nearest symbol at or before `pc`, relative to this module's base.
    fn symbol_for(&self, pc: u64) -> Option<(&str, u64)> {
        let offset = pc.checked_sub(self.base)?;
        self.symbols
            .range(..=offset)
            .next_back()
            .map(|(&addr, name)| (name.as_str(), offset - addr))
    }
}

/// A resolved native symbol: the owning module's path, the symbol name, and
/// the byte offset from the symbol's start.
pub struct NativeSymbol {
    pub module_path: String,
    pub symbol_name: String,
    pub offset: u64,
}

/// The loaded-module list for the profiled process, queried by raw PC
/// (spec.md §4.E). Populated by the platform sampler from the OS's module
/// list (`/proc/self/maps` on Linux, `dyld` APIs on macOS, `ToolHelp` on
/// Windows); this type itself is platform-agnostic.
#[derive(Default)]
pub struct DynamicLoader {
    modules: Vec<LoadedModule>,
}

impl DynamicLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&mut self, module: LoadedModule) {
        self.modules.push(module);
    }

    pub fn clear(&mut self) {
        self.modules.clear();
    }

    /// Resolves a raw program counter to a module + nearest symbol. Returns
    /// `None` if `pc` falls outside every known module, or inside a module
    /// whose symbol table has no entry at or before `pc` (spec.md §4.E
    /// failure semantics: the caller falls back to
    /// [`crate::sample::ResolvedFrame::unknown_native`]).
    pub fn resolve(&self, pc: u64) -> Option<NativeSymbol> {
        let module = self.modules.iter().find(|m| m.contains(pc))?;
        let (name, offset) = module.symbol_for(pc)?;
        Some(NativeSymbol {
            module_path: module.path.clone(),
            symbol_name: name.to_string(),
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_with_symbols(base: u64, size: u64, symbols: &[(u64, &str)]) -> LoadedModule {
        LoadedModule {
            path: "/fake/module.so".to_string(),
            base,
            size,
            symbols: symbols.iter().map(|&(a, n)| (a, n.to_string())).collect(),
        }
    }

    #[test]
    fn resolves_pc_within_module_to_nearest_preceding_symbol() {
        let mut loader = DynamicLoader::new();
        loader.add_module(module_with_symbols(
            0x1000,
            0x1000,
            &[(0x10, "foo"), (0x100, "bar")],
        ));
        // base 0x1000, pc 0x1050 -> offset 0x50, nearest symbol is bar@0x100? no, 0x50 < 0x100
        let resolved = loader.resolve(0x1000 + 0x50).unwrap();
        assert_eq!(resolved.symbol_name, "foo");
        assert_eq!(resolved.offset, 0x50 - 0x10);
    }

    #[test]
    fn pc_outside_every_module_resolves_to_none() {
        let mut loader = DynamicLoader::new();
        loader.add_module(module_with_symbols(0x1000, 0x1000, &[(0x10, "foo")]));
        assert!(loader.resolve(0x5000).is_none());
    }

    #[test]
    fn pc_before_first_symbol_resolves_to_none() {
        let mut loader = DynamicLoader::new();
        loader.add_module(module_with_symbols(0x1000, 0x1000, &[(0x100, "foo")]));
        assert!(loader.resolve(0x1000 + 0x10).is_none());
    }

    #[test]
    fn clear_removes_all_modules() {
        let mut loader = DynamicLoader::new();
        loader.add_module(module_with_symbols(0x1000, 0x1000, &[(0x10, "foo")]));
        loader.clear();
        assert!(loader.resolve(0x1010).is_none());
    }
}
