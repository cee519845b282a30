//! The resolver (spec.md §4.E): drains the ring buffer, resolves raw
//! pointers to symbols, merges native and managed frames with the
//! trim-and-sandwich algorithm, and produces resolved samples.
//!
//! Runs in a normal execution context, never a signal handler: it may
//! allocate, take locks, and call the dynamic loader.

use crate::dynamic_loader::DynamicLoader;
use crate::registry::{CodeRegistry, ValidationResult};
use crate::runtime::RuntimeAccessors;
use crate::sample::{CodeAddress, FrameKind, RawSample, ResolvedFrame, ResolvedSample};
use crate::stats::StatsHandle;
use crate::symbol_cache::SymbolCache;

/// Where the managed runtime's own shared object is loaded, recorded once
/// at resolver start-up (spec.md §4.E, "Interpreter-frame classification").
#[derive(Debug, Clone)]
pub struct InterpreterModule {
    pub base: u64,
    pub size: u64,
    pub path: String,
}

impl InterpreterModule {
    fn contains(&self, pc: u64) -> bool {
        pc >= self.base && pc < self.base + self.size
    }

    /// Fallback classification for unusual builds where the base-address
    /// test doesn't apply, e.g. a statically linked interpreter (spec.md
    /// §4.E: "Fallback: substring match on the module path").
    fn path_looks_like_interpreter(&self, candidate_path: &str) -> bool {
        candidate_path.contains(&self.path)
    }
}

/// A classified native frame, produced in step 3 of the pipeline before the
/// merge step consumes it.
struct ClassifiedNative {
    pc: u64,
    is_interpreter: bool,
    symbol: Option<ResolvedFrame>,
}

/// Resolves raw samples drained from a [`crate::ringbuffer::RingBuffer`]
/// into [`ResolvedSample`]s.
pub struct Resolver<'a> {
    accessors: &'a dyn RuntimeAccessors,
    registry: &'a CodeRegistry,
    loader: &'a DynamicLoader,
    cache: SymbolCache,
    stats: StatsHandle,
    interpreter_module: Option<InterpreterModule>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        accessors: &'a dyn RuntimeAccessors,
        registry: &'a CodeRegistry,
        loader: &'a DynamicLoader,
        stats: StatsHandle,
    ) -> Self {
        Self {
            accessors,
            registry,
            loader,
            cache: SymbolCache::new(),
            stats,
            interpreter_module: None,
        }
    }

    /// Recorded once at start-up (spec.md §4.E, "Interpreter-frame
    /// classification" — "cached base of the managed-runtime shared object
    /// recorded once at resolver start-up").
    pub fn set_interpreter_module(&mut self, module: InterpreterModule) {
        self.interpreter_module = Some(module);
    }

    /// Runs the full per-sample pipeline (spec.md §4.E steps 1-6).
    pub fn resolve(&mut self, raw: &RawSample) -> Option<ResolvedSample> {
        if raw.timestamp_ns == 0 {
            // Structural sanity (step 1); a zero timestamp never occurs on
            // a genuine capture, since the monotonic clock is read before
            // anything else in the platform sampler.
            return None;
        }

        let managed_addrs: Vec<CodeAddress> = raw.managed_pairs().map(|(c, _)| c).collect();
        let managed_frames = self.resolve_managed_frames(raw);
        let native_frames = self.classify_native_frames(raw);

        let frames = self.merge_trim_and_sandwich(native_frames, managed_frames);

        self.registry.release_refs_batch(&managed_addrs);

        Some(ResolvedSample {
            timestamp_ns: raw.timestamp_ns,
            thread_id: raw.thread_id,
            truncated: raw.truncated,
            frames,
        })
    }

    fn resolve_managed_frames(&mut self, raw: &RawSample) -> Vec<ResolvedFrame> {
        let mut out = Vec::with_capacity(raw.managed_depth);
        for (code, instr) in raw.managed_pairs() {
            // Validate before consulting the cache: a cache hit only proves
            // this (code, instr) pair resolved to a name once before, not
            // that `code` still refers to the same code object under this
            // sample's gc_epoch (spec.md §4.C address reuse).
            let kind = match self.registry.validate(code, raw.gc_epoch) {
                ValidationResult::Valid(kind) => kind,
                ValidationResult::InvalidFreed | ValidationResult::InvalidNotHeld => {
                    self.stats.record_invalid_frame();
                    continue;
                }
            };

            if let Some(cached) = self.cache.get((code, instr)) {
                self.stats.record_cache_hit();
                out.push(cached);
                continue;
            }
            self.stats.record_cache_miss();

            self.accessors.acquire_runtime_lock();
            let resolved = self.accessors.code_to_name_file(code);
            let line = self
                .accessors
                .code_to_line_from_instruction(code, instr)
                .unwrap_or(0);
            self.accessors.release_runtime_lock();

            let frame = match resolved {
                Some((name, file)) => ResolvedFrame::new(kind, &name, &file, line),
                // The runtime refused to hand out name/file for a held,
                // valid address (spec.md §4.E failure semantics): a
                // synthetic placeholder, not a dropped frame.
                None => ResolvedFrame::new(kind, "<unresolved>", "", 0),
            };
            self.cache.insert((code, instr), frame.clone());
            out.push(frame);
        }
        out
    }

    fn classify_native_frames(&self, raw: &RawSample) -> Vec<ClassifiedNative> {
        raw.native_frames()
            .iter()
            .map(|&pc| {
                let symbol = self.loader.resolve(pc);
                let is_interpreter = match &self.interpreter_module {
                    Some(module) => {
                        module.contains(pc)
                            || symbol
                                .as_ref()
                                .map(|s| module.path_looks_like_interpreter(&s.module_path))
                                .unwrap_or(false)
                    }
                    None => false,
                };
                let resolved = symbol.map(|s| {
                    ResolvedFrame::new(
                        FrameKind::Native,
                        &format!("{}+{:#x}", s.symbol_name, s.offset),
                        &s.module_path,
                        0,
                    )
                });
                ClassifiedNative {
                    pc,
                    is_interpreter,
                    symbol: resolved,
                }
            })
            .collect()
    }

    /// The trim-and-sandwich merge (spec.md §4.E step 4): native frames
    /// from innermost to outermost, but the first contiguous run of
    /// interpreter-native frames is replaced wholesale by the managed
    /// frame list.
    fn merge_trim_and_sandwich(
        &self,
        native: Vec<ClassifiedNative>,
        managed: Vec<ResolvedFrame>,
    ) -> Vec<ResolvedFrame> {
        let mut out = Vec::with_capacity(native.len() + managed.len());
        let mut inserted_managed = false;

        for frame in native {
            if frame.is_interpreter {
                if !inserted_managed {
                    out.extend(managed.iter().cloned());
                    inserted_managed = true;
                }
                continue;
            }
            out.push(
                frame
                    .symbol
                    .unwrap_or_else(|| ResolvedFrame::unknown_native(frame.pc)),
            );
        }

        if !inserted_managed && !managed.is_empty() {
            // No interpreter frame was found in the native stack at all.
            // This is a classification failure (spec.md §4.E step 4,
            // "fallback; indicates classification failure"), not a
            // legitimate code path, so it's counted separately from a
            // cache miss or an invalid frame.
            self.stats.record_interpreter_frame_mismatch();
            out.extend(managed);
        }

        out
    }
}
