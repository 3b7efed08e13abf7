//! Generational cycle collector
//!
//! Refcounting frees everything except garbage cycles. Tracked (container)
//! objects are kept in three generation buckets, and a pass over
//! generations `0..=N` finds the members that are only kept alive by each
//! other, using trial deletion:
//!
//! 1. `gc_refs = refcount` for every member of the scan set
//! 2. every owned reference from one member to another does `gc_refs -= 1`
//! 3. members left with `gc_refs != 0` are referenced from outside the set;
//!    they and everything reachable from them through owned references
//!    are live
//! 4. live members are promoted, the rest are torn down as a group
//!
//! The real refcounts are never touched while working out reachability.
//!
//! The buckets are intrusive doubly-linked lists threaded through the
//! object headers, so tracking and untracking are O(1) and a bucket
//! keeps track (allocation) order.
//!
//! A pass cannot be interrupted. Hooks run during teardown (weak
//! callbacks, finalizers) may allocate and mutate refcounts, but they
//! cannot start another pass, and any attempt to take a new reference to
//! a doomed object is rejected by [MemoryManager::incref].

use std::{cell::Cell, ptr, time::Instant};

use tracing::Level;

use crate::{
    config::Thresholds,
    error::{MemError, MemResult},
    object::{gc_flags, ObjectHeader, GEN_UNTRACKED},
    MemoryManager,
};

/// Number of generations
pub const NUM_GENERATIONS: usize = 3;

/// Which generation(s) a manual collection covers
///
/// Collecting a generation always sweeps every younger one too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Gen0,
    Gen1,
    Gen2,
    /// Same as [Generation::Gen2]
    All,
}

impl Generation {
    pub fn index(self) -> usize {
        match self {
            Generation::Gen0 => 0,
            Generation::Gen1 => 1,
            Generation::Gen2 | Generation::All => 2,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(Generation::Gen0),
            1 => Some(Generation::Gen1),
            2 => Some(Generation::Gen2),
            _ => None,
        }
    }
}

/// Where the collector is in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    /// Computing trial refcounts and reachability
    Counting,
    /// Promoting survivors and tearing down the unreachable set
    Collecting(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Tracked objects currently in each generation
    pub objects: [usize; NUM_GENERATIONS],
    /// Passes run with each generation as the oldest scanned
    pub collections: [u64; NUM_GENERATIONS],
    /// Unreachable objects reclaimed by those passes
    pub collected: [u64; NUM_GENERATIONS],
}

/// Intrusive list of tracked object headers
pub(crate) struct GenList {
    head: Cell<*const ObjectHeader>,
    tail: Cell<*const ObjectHeader>,
    len: Cell<usize>,
}

impl GenList {
    fn new() -> Self {
        Self {
            head: Cell::new(ptr::null()),
            tail: Cell::new(ptr::null()),
            len: Cell::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.get()
    }

    fn push_back(&self, hdr: &ObjectHeader) {
        let tail = self.tail.get();
        hdr.gc_prev.set(tail);
        hdr.gc_next.set(ptr::null());
        if tail.is_null() {
            self.head.set(hdr);
        } else {
            unsafe { (*tail).gc_next.set(hdr) };
        }
        self.tail.set(hdr);
        self.len.set(self.len.get() + 1);
    }

    fn remove(&self, hdr: &ObjectHeader) {
        let prev = hdr.gc_prev.get();
        let next = hdr.gc_next.get();
        if prev.is_null() {
            debug_assert!(self.head.get() == hdr as *const _);
            self.head.set(next);
        } else {
            unsafe { (*prev).gc_next.set(next) };
        }
        if next.is_null() {
            debug_assert!(self.tail.get() == hdr as *const _);
            self.tail.set(prev);
        } else {
            unsafe { (*next).gc_prev.set(prev) };
        }
        hdr.gc_prev.set(ptr::null());
        hdr.gc_next.set(ptr::null());
        self.len.set(self.len.get() - 1);
    }

    /// Headers in list order
    pub(crate) fn to_vec(&self) -> Vec<*const ObjectHeader> {
        let mut out = Vec::with_capacity(self.len.get());
        let mut cur = self.head.get();
        while !cur.is_null() {
            out.push(cur);
            cur = unsafe { (*cur).gc_next.get() };
        }
        out
    }

    /// Empty the list, returning its old contents in order
    ///
    /// The links inside the headers are left stale; every returned
    /// header must be pushed somewhere or have its links cleared.
    fn take_all(&self) -> Vec<*const ObjectHeader> {
        let out = self.to_vec();
        self.head.set(ptr::null());
        self.tail.set(ptr::null());
        self.len.set(0);
        out
    }
}

pub(crate) struct Collector {
    gens: [GenList; NUM_GENERATIONS],
    /// Trigger counters (see [MemoryManager::count])
    counts: [Cell<usize>; NUM_GENERATIONS],
    thresholds: [Cell<usize>; NUM_GENERATIONS],
    enabled: Cell<bool>,
    state: Cell<CollectorState>,
    collections: [Cell<u64>; NUM_GENERATIONS],
    collected: [Cell<u64>; NUM_GENERATIONS],
}

impl Collector {
    pub(crate) fn new(thresholds: Thresholds, enabled: bool) -> Self {
        let t = thresholds.as_array();
        Self {
            gens: std::array::from_fn(|_| GenList::new()),
            counts: std::array::from_fn(|_| Cell::new(0)),
            thresholds: std::array::from_fn(|i| Cell::new(t[i])),
            enabled: Cell::new(enabled),
            state: Cell::new(CollectorState::Idle),
            collections: std::array::from_fn(|_| Cell::new(0)),
            collected: std::array::from_fn(|_| Cell::new(0)),
        }
    }

    /// Put an untracked object into generation 0
    pub(crate) fn track(&self, hdr: &ObjectHeader) {
        debug_assert!(!hdr.has_flag(gc_flags::TRACKED));
        hdr.set_flag(gc_flags::TRACKED);
        hdr.gc_generation.set(0);
        self.gens[0].push_back(hdr);
        self.counts[0].set(self.counts[0].get() + 1);
    }

    /// Take an object out of its generation
    ///
    /// `dealloc` is set when the object is going away, which is what
    /// counts against the generation 0 allocation delta.
    pub(crate) fn untrack(&self, hdr: &ObjectHeader, dealloc: bool) {
        if !hdr.has_flag(gc_flags::TRACKED) {
            return;
        }
        let gen = hdr.gc_generation.get() as usize;
        self.gens[gen].remove(hdr);
        hdr.clear_flag(gc_flags::TRACKED);
        hdr.gc_generation.set(GEN_UNTRACKED);
        if dealloc && self.counts[0].get() > 0 {
            self.counts[0].set(self.counts[0].get() - 1);
        }
    }

    pub(crate) fn enable(&self) {
        self.enabled.set(true);
    }

    pub(crate) fn disable(&self) {
        self.enabled.set(false);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub(crate) fn set_thresholds(&self, thresholds: Thresholds) {
        for (cell, t) in self.thresholds.iter().zip(thresholds.as_array()) {
            cell.set(t);
        }
    }

    pub(crate) fn thresholds(&self) -> Thresholds {
        Thresholds::new(
            self.thresholds[0].get(),
            self.thresholds[1].get(),
            self.thresholds[2].get(),
        )
    }

    pub(crate) fn counts(&self) -> [usize; NUM_GENERATIONS] {
        std::array::from_fn(|i| self.counts[i].get())
    }

    pub(crate) fn state(&self) -> CollectorState {
        self.state.get()
    }

    pub(crate) fn generation(&self, i: usize) -> &GenList {
        &self.gens[i]
    }

    pub(crate) fn stats(&self) -> GcStats {
        GcStats {
            objects: std::array::from_fn(|i| self.gens[i].len()),
            collections: std::array::from_fn(|i| self.collections[i].get()),
            collected: std::array::from_fn(|i| self.collected[i].get()),
        }
    }

    /// Automatic trigger, checked before a tracked allocation returns
    ///
    /// Collects the oldest generation whose counter reached its threshold.
    /// Deferred (i.e. skipped) while a pass is already running.
    pub(crate) fn maybe_collect(&self, mm: &MemoryManager) {
        if !self.enabled.get() || self.state.get() != CollectorState::Idle {
            return;
        }
        let t0 = self.thresholds[0].get();
        if t0 == 0 || self.counts[0].get() < t0 {
            return;
        }
        let mut gen = 0;
        for g in (1..NUM_GENERATIONS).rev() {
            if self.counts[g].get() >= self.thresholds[g].get() {
                gen = g;
                break;
            }
        }
        if let Err(e) = self.collect_generation(mm, gen) {
            tracing::warn!(error = %e, gen, "automatic collection reported an error");
        }
    }

    /// Manual collection
    pub(crate) fn collect(&self, mm: &MemoryManager, gen: Generation) -> MemResult<usize> {
        if self.state.get() != CollectorState::Idle {
            return Err(MemError::CollectionReentrancy);
        }
        self.collect_generation(mm, gen.index())
    }

    fn collect_generation(&self, mm: &MemoryManager, gen: usize) -> MemResult<usize> {
        let trace_span = tracing::span!(Level::DEBUG, "gc::collect", gen);
        let _span_enter = trace_span.enter();
        let start = Instant::now();

        self.state.set(CollectorState::Counting);

        // scan set: generations 0..=gen, oldest first
        let mut members: Vec<&ObjectHeader> = Vec::new();
        for g in (0..=gen).rev() {
            for hdr in self.gens[g].take_all() {
                // safety: tracked objects are live
                members.push(unsafe { &*hdr });
            }
        }
        let scanned = members.len();

        for m in &members {
            m.gc_refs.set(m.refcount.get() as isize);
            m.set_flag(gc_flags::COLLECTING);
        }

        // subtract references internal to the scan set
        let mut owned = Vec::new();
        for m in &members {
            owned.clear();
            mm.enumerate_owned(m, &mut owned);
            for r in &owned {
                if let Some(target) = mm.validate(*r) {
                    if target.has_flag(gc_flags::COLLECTING) {
                        target.gc_refs.set(target.gc_refs.get() - 1);
                    }
                }
            }
        }

        // anything still referenced from outside is a root, and so is
        // everything it reaches. negative counts mean a type over-reported
        // its references; keep those alive too
        let mut work: Vec<&ObjectHeader> = members
            .iter()
            .copied()
            .filter(|m| m.gc_refs.get() != 0)
            .collect();
        for m in &work {
            if m.gc_refs.get() < 0 {
                tracing::warn!(obj = ?m.handle(), "negative trial refcount");
            }
            m.set_flag(gc_flags::REACHABLE);
        }
        while let Some(m) = work.pop() {
            owned.clear();
            mm.enumerate_owned(m, &mut owned);
            for r in &owned {
                if let Some(target) = mm.validate(*r) {
                    if target.has_flag(gc_flags::COLLECTING)
                        && !target.has_flag(gc_flags::REACHABLE)
                    {
                        target.set_flag(gc_flags::REACHABLE);
                        work.push(target);
                    }
                }
            }
        }

        self.state.set(CollectorState::Collecting(gen));

        let promote_to = (gen + 1).min(NUM_GENERATIONS - 1);
        let mut doomed = Vec::new();
        for m in members {
            if m.has_flag(gc_flags::REACHABLE) {
                m.clear_flag(gc_flags::COLLECTING | gc_flags::REACHABLE);
                m.gc_generation.set(promote_to as u8);
                self.gens[promote_to].push_back(m);
            } else {
                // COLLECTING stays set: it marks membership of the doomed set
                m.clear_flag(gc_flags::TRACKED);
                m.set_flag(gc_flags::DOOMED);
                m.gc_generation.set(GEN_UNTRACKED);
                m.gc_prev.set(ptr::null());
                m.gc_next.set(ptr::null());
                doomed.push(m);
            }
        }

        for g in 0..=gen {
            self.counts[g].set(0);
        }
        if gen + 1 < NUM_GENERATIONS {
            self.counts[gen + 1].set(self.counts[gen + 1].get() + 1);
        }
        self.collections[gen].set(self.collections[gen].get() + 1);

        let n = doomed.len();
        let result = self.finalize_doomed(mm, &doomed);
        self.collected[gen].set(self.collected[gen].get() + n as u64);
        self.state.set(CollectorState::Idle);

        tracing::debug!(
            gen,
            scanned,
            unreachable = n,
            elapsed = ?start.elapsed(),
            "collection pass done"
        );
        result.map(|_| n)
    }

    /// Tear down an unreachable set
    ///
    /// Each step walks the whole set in scan order (oldest generation
    /// first, track order within a generation):
    /// clear weak refs, run weak callbacks, run finalizers, drop references
    /// that leave the set, release the blocks. References between members
    /// are never decremented since all of them are going away together.
    fn finalize_doomed(&self, mm: &MemoryManager, doomed: &[&ObjectHeader]) -> MemResult<()> {
        let mut first_err = None;

        let mut callbacks = Vec::new();
        for d in doomed {
            if d.has_flag(gc_flags::HAS_WEAK) {
                callbacks.extend(mm.weak.clear_target(d.handle()));
            }
        }
        for (weak, callback) in callbacks {
            callback(mm, weak);
        }

        for d in doomed {
            if let Ok(ty) = mm.types.get(d.type_tag) {
                ty.finalize(mm, d.handle());
            }
        }

        let mut owned = Vec::new();
        for d in doomed {
            owned.clear();
            mm.enumerate_owned(d, &mut owned);
            for r in &owned {
                let Some(target) = mm.validate(*r) else {
                    continue;
                };
                if target.has_flag(gc_flags::COLLECTING) && target.has_flag(gc_flags::DOOMED) {
                    continue;
                }
                if let Err(e) = mm.release_owned(*r) {
                    first_err.get_or_insert(e);
                }
            }
        }

        for d in doomed {
            d.clear_flag(gc_flags::COLLECTING);
            // safety: unreachable, so nothing refers to it any more
            unsafe { mm.free_object(d) };
        }

        if let Err(e) = mm.drain_destroy_queue() {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }
}
