//! The embedding API
//!
//! [MemoryManager] owns the heap, the type registry, the cycle collector,
//! the weak reference registry, and the interning cache. There is no
//! global state; every operation goes through one manager.
//!
//! # Refcounting
//!
//! Every live object has `refcount >= 1`. When [MemoryManager::decref]
//! takes it to zero the object is marked doomed and pushed onto the
//! destruction work-list, which is then drained iteratively:
//!
//! 1. remove it from its generation
//! 2. clear weak references, then run their callbacks
//! 3. run the type's finalize hook
//! 4. drop each owned reference (queueing whatever reaches zero)
//! 5. release the block
//!
//! A decref that happens from inside a hook while the list is draining
//! only queues; the outermost call does the draining. Long chains are
//! therefore torn down without recursion, and when the outermost `decref`
//! returns everything it cascaded to has been released.

use std::{
    cell::{Cell, RefCell},
    ptr::{self, NonNull},
    rc::Rc,
};

use crate::{
    allocator::{AllocConfig, Heap, HeapStats},
    config::{Config, Thresholds},
    error::{MemError, MemResult, Violation},
    gc::{Collector, CollectorState, GcStats, Generation, NUM_GENERATIONS},
    intern::{InternCache, InternPolicy, InternValue, PolicyKey},
    object::{
        gc_flags, ObjectHandle, ObjectHeader, ObjectType, ObjectView, TypeRegistry, TypeTag,
        GEN_UNTRACKED, HDR_SERIAL_MASK, HDR_VALID_BIT, HEADER_SZ, REF_SLOT_SZ,
    },
    types,
    weak::{WeakCallback, WeakHandle, WeakRegistry},
};

/// What was left when a manager was shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Objects reclaimed by the final full collection
    pub collected: usize,
    /// Objects still alive afterwards (leaked by the host)
    pub live_objects: usize,
    pub heap: HeapStats,
}

/// Hybrid refcounting + cycle collecting memory manager
///
/// Single-mutator: methods take `&self` and the manager is neither `Send`
/// nor `Sync`. Hooks (finalizers, weak callbacks) get the same `&self`
/// and may call back into it.
pub struct MemoryManager {
    config: Config,
    pub(crate) types: TypeRegistry,
    pub(crate) gc: Collector,
    pub(crate) weak: WeakRegistry,
    pub(crate) intern: InternCache,
    next_serial: Cell<u64>,
    destroy_queue: RefCell<Vec<ObjectHandle>>,
    draining: Cell<bool>,
    live_objects: Cell<usize>,
    // must be dropped last
    heap: Heap,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("@addr", &(self as *const _))
            .field("types", &self.types.len())
            .field("live_objects", &self.live_objects.get())
            .field("weak_refs", &self.weak.live())
            .field("interned", &self.intern.len())
            .field("collector", &self.gc.state())
            .field("heap", &self.heap)
            .finish()
    }
}

impl MemoryManager {
    pub fn new(config: Config) -> Self {
        let heap = Heap::new(AllocConfig {
            retained_empty_arenas: config.retained_empty_arenas,
            memory_limit: config.memory_limit,
        });
        let mm = Self {
            types: TypeRegistry::new(),
            gc: Collector::new(config.thresholds, config.gc_enabled),
            weak: WeakRegistry::new(),
            intern: InternCache::new(),
            next_serial: Cell::new(1),
            destroy_queue: RefCell::new(Vec::new()),
            draining: Cell::new(false),
            live_objects: Cell::new(0),
            heap,
            config,
        };

        let opaque = mm.types.register(Rc::new(types::Opaque));
        let slots = mm.types.register(Rc::new(types::Slots));
        debug_assert_eq!(opaque, TypeTag::OPAQUE);
        debug_assert_eq!(slots, TypeTag::SLOTS);
        for policy in mm.config.intern_policies.iter().cloned() {
            mm.intern.register(policy);
        }
        mm
    }

    pub fn with_defaults() -> Self {
        Self::new(Config::default())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn register_type(&self, ty: Box<dyn ObjectType>) -> TypeTag {
        self.types.register(Rc::from(ty))
    }

    pub fn register_intern_policy(&self, policy: InternPolicy) -> PolicyKey {
        self.intern.register(policy)
    }

    // -------------------------------------------------------------------
    // allocation and refcounting

    /// Allocate an object with a zeroed payload of `size` bytes
    ///
    /// The returned handle carries the one initial reference. Container
    /// types start out tracked in generation 0, and their allocation may
    /// run an automatic collection first.
    pub fn alloc(&self, type_tag: TypeTag, size: usize) -> MemResult<ObjectHandle> {
        let ty = self.types.get(type_tag)?;
        let container = ty.is_container();
        if container {
            self.gc.maybe_collect(self);
        }

        let payload_len = u32::try_from(size).map_err(|_| MemError::AllocationFailure { size })?;
        let total = HEADER_SZ
            .checked_add(size)
            .ok_or(MemError::AllocationFailure { size })?;
        let block = self.heap.allocate(total).map_err(|e| match e {
            MemError::AllocationFailure { .. } => MemError::AllocationFailure { size },
            e => e,
        })?;

        let serial = self.next_serial.get();
        self.next_serial.set((serial + 1) & HDR_SERIAL_MASK);

        let hdr_ptr = block.ptr.cast::<ObjectHeader>();
        let hdr = unsafe {
            // safety: fresh block, big enough and aligned for a header
            ptr::write(
                hdr_ptr.as_ptr(),
                ObjectHeader {
                    state: Cell::new(HDR_VALID_BIT | serial),
                    refcount: Cell::new(1),
                    gc_refs: Cell::new(0),
                    gc_prev: Cell::new(ptr::null()),
                    gc_next: Cell::new(ptr::null()),
                    pool: block.pool,
                    type_tag,
                    payload_len,
                    gc_generation: Cell::new(GEN_UNTRACKED),
                    gc_flags: Cell::new(0),
                },
            );
            hdr_ptr.as_ref()
        };
        self.live_objects.set(self.live_objects.get() + 1);
        if container {
            self.gc.track(hdr);
        }

        let obj = hdr.handle();
        tracing::trace!(?obj, type_tag = type_tag.0, size, "alloc");
        Ok(obj)
    }

    /// Allocate a [TypeTag::SLOTS] container with `n` empty slots
    pub fn alloc_slots(&self, n: usize) -> MemResult<ObjectHandle> {
        let size = n
            .checked_mul(REF_SLOT_SZ)
            .ok_or(MemError::AllocationFailure { size: usize::MAX })?;
        self.alloc(TypeTag::SLOTS, size)
    }

    /// Header of a live object, if the handle still names one
    ///
    /// Objects that are being destroyed are still returned.
    pub(crate) fn validate(&self, obj: ObjectHandle) -> Option<&ObjectHeader> {
        if !self.heap.contains_block(obj.addr(), HEADER_SZ) {
            return None;
        }
        // safety: the heap owns a block starting here, whose first word is
        // either a free-list link (valid bit clear) or a header
        let hdr = unsafe { obj.ptr.as_ref() };
        (hdr.state.get() == HDR_VALID_BIT | obj.serial).then_some(hdr)
    }

    pub(crate) fn header(&self, obj: ObjectHandle) -> MemResult<&ObjectHeader> {
        self.validate(obj)
            .ok_or(MemError::InvariantViolation(Violation::StaleHandle))
    }

    pub fn incref(&self, obj: ObjectHandle) -> MemResult<()> {
        let hdr = self.header(obj)?;
        if hdr.has_flag(gc_flags::DOOMED) || hdr.refcount.get() == 0 {
            return Err(Violation::Resurrection.into());
        }
        hdr.refcount.set(hdr.refcount.get() + 1);
        Ok(())
    }

    /// Drop one reference, destroying the object (and whatever only it kept
    /// alive) when it was the last one
    pub fn decref(&self, obj: ObjectHandle) -> MemResult<()> {
        self.release_owned(obj)?;
        self.drain_destroy_queue()
    }

    /// Decrement, queueing the object for destruction at zero without
    /// draining the queue
    pub(crate) fn release_owned(&self, obj: ObjectHandle) -> MemResult<()> {
        let hdr = self.header(obj)?;
        let rc = hdr.refcount.get();
        if rc == 0 {
            return Err(Violation::Underflow.into());
        }
        if rc == 1 && hdr.has_flag(gc_flags::PERMANENT) {
            return Err(Violation::PermanentRelease.into());
        }
        hdr.refcount.set(rc - 1);

        // objects already doomed by the collector are torn down by it
        if rc == 1 && !hdr.has_flag(gc_flags::DOOMED) {
            hdr.set_flag(gc_flags::DOOMED);
            // out of the collector's reach while waiting in the queue
            self.gc.untrack(hdr, true);
            self.destroy_queue.borrow_mut().push(obj);
        }
        Ok(())
    }

    /// Destroy everything on the work-list
    ///
    /// Only the outermost call does anything. Keeps going after a failing
    /// object so the queue always ends up empty; the first error is returned.
    pub(crate) fn drain_destroy_queue(&self) -> MemResult<()> {
        if self.draining.replace(true) {
            return Ok(());
        }
        let mut first_err = None;
        loop {
            let next = self.destroy_queue.borrow_mut().pop();
            let Some(obj) = next else {
                break;
            };
            if let Err(e) = self.destroy(obj) {
                first_err.get_or_insert(e);
            }
        }
        self.draining.set(false);
        first_err.map_or(Ok(()), Err)
    }

    fn destroy(&self, obj: ObjectHandle) -> MemResult<()> {
        // safety: queued objects are doomed and only freed here
        let hdr = unsafe { obj.ptr.as_ref() };
        debug_assert!(hdr.has_flag(gc_flags::DOOMED));
        debug_assert_eq!(hdr.refcount.get(), 0);
        debug_assert!(!hdr.has_flag(gc_flags::TRACKED));
        tracing::trace!(?obj, "destroy");

        if hdr.has_flag(gc_flags::HAS_WEAK) {
            for (weak, callback) in self.weak.clear_target(obj) {
                callback(self, weak);
            }
        }

        let mut first_err = None;
        match self.types.get(hdr.type_tag) {
            Ok(ty) => ty.finalize(self, obj),
            Err(e) => {
                first_err = Some(e);
            }
        }

        let mut owned = Vec::new();
        self.enumerate_owned(hdr, &mut owned);
        for r in owned {
            if let Err(e) = self.release_owned(r) {
                first_err.get_or_insert(e);
            }
        }

        // safety: refcount is zero, nothing refers to it any more
        unsafe { self.free_object(hdr) };
        first_err.map_or(Ok(()), Err)
    }

    pub(crate) fn enumerate_owned(&self, hdr: &ObjectHeader, out: &mut Vec<ObjectHandle>) {
        if let Ok(ty) = self.types.get(hdr.type_tag) {
            ty.enumerate_owned(&ObjectView::new(hdr), out);
        }
    }

    /// Give the block of a dead object back to the heap
    ///
    /// safety: nothing may use the header afterwards
    pub(crate) unsafe fn free_object(&self, hdr: &ObjectHeader) {
        debug_assert!(!hdr.has_flag(gc_flags::TRACKED));
        let pool = hdr.pool;
        let ptr = NonNull::from(hdr).cast::<u8>();
        hdr.state.set(0);
        self.heap.release(ptr, pool);
        self.live_objects.set(self.live_objects.get() - 1);
    }

    /// Start tracking an object in generation 0 (no-op if already tracked)
    pub fn track(&self, obj: ObjectHandle) -> MemResult<()> {
        let hdr = self.header(obj)?;
        if hdr.has_flag(gc_flags::DOOMED) {
            return Err(Violation::Resurrection.into());
        }
        if !hdr.has_flag(gc_flags::TRACKED) {
            self.gc.track(hdr);
        }
        Ok(())
    }

    /// Stop tracking an object (no-op if not tracked)
    ///
    /// An untracked object that ends up in a garbage cycle is never
    /// collected.
    pub fn untrack(&self, obj: ObjectHandle) -> MemResult<()> {
        let hdr = self.header(obj)?;
        self.gc.untrack(hdr, false);
        Ok(())
    }

    // -------------------------------------------------------------------
    // payload access

    fn check_bounds(hdr: &ObjectHeader, offset: usize, len: usize) -> MemResult<()> {
        let payload = hdr.payload_len as usize;
        match offset.checked_add(len) {
            Some(end) if end <= payload => Ok(()),
            _ => Err(Violation::OutOfBounds {
                offset,
                len,
                payload,
            }
            .into()),
        }
    }

    pub fn payload_len(&self, obj: ObjectHandle) -> MemResult<usize> {
        Ok(self.header(obj)?.payload_len as usize)
    }

    pub fn read_bytes(&self, obj: ObjectHandle, offset: usize, buf: &mut [u8]) -> MemResult<()> {
        let hdr = self.header(obj)?;
        Self::check_bounds(hdr, offset, buf.len())?;
        unsafe {
            ptr::copy_nonoverlapping(hdr.payload_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Write raw bytes
    ///
    /// This does no refcounting; use [MemoryManager::store_ref] for
    /// reference slots.
    pub fn write_bytes(&self, obj: ObjectHandle, offset: usize, data: &[u8]) -> MemResult<()> {
        let hdr = self.header(obj)?;
        Self::check_bounds(hdr, offset, data.len())?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), hdr.payload_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Read the reference slot at byte `offset`
    ///
    /// The result is borrowed: no reference is added.
    pub fn load_ref(&self, obj: ObjectHandle, offset: usize) -> MemResult<Option<ObjectHandle>> {
        let mut slot = [0; REF_SLOT_SZ];
        self.read_bytes(obj, offset, &mut slot)?;
        match ObjectHandle::from_slot(&slot) {
            Some(target) => {
                self.header(target)?;
                Ok(Some(target))
            }
            None => Ok(None),
        }
    }

    /// Overwrite the reference slot at byte `offset`
    ///
    /// The new target gains a reference, the old one loses one (possibly
    /// destroying it).
    pub fn store_ref(
        &self,
        obj: ObjectHandle,
        offset: usize,
        value: Option<ObjectHandle>,
    ) -> MemResult<()> {
        let hdr = self.header(obj)?;
        Self::check_bounds(hdr, offset, REF_SLOT_SZ)?;
        let slot = unsafe {
            // safety: bounds checked above
            std::slice::from_raw_parts_mut(hdr.payload_ptr().add(offset), REF_SLOT_SZ)
        };

        // nothing changes unless both the old and the new target are live
        let old = ObjectHandle::from_slot(slot);
        if let Some(old) = old {
            self.header(old)?;
        }
        if let Some(v) = value {
            self.incref(v)?;
        }
        slot.copy_from_slice(&ObjectHandle::to_slot(value));

        match old {
            Some(old) => self.decref(old),
            None => Ok(()),
        }
    }

    fn slot_offset(index: usize) -> MemResult<usize> {
        index.checked_mul(REF_SLOT_SZ).ok_or(
            Violation::OutOfBounds {
                offset: usize::MAX,
                len: REF_SLOT_SZ,
                payload: 0,
            }
            .into(),
        )
    }

    pub fn set_slot(&self, obj: ObjectHandle, index: usize, value: Option<ObjectHandle>) -> MemResult<()> {
        self.store_ref(obj, Self::slot_offset(index)?, value)
    }

    pub fn get_slot(&self, obj: ObjectHandle, index: usize) -> MemResult<Option<ObjectHandle>> {
        self.load_ref(obj, Self::slot_offset(index)?)
    }

    // -------------------------------------------------------------------
    // introspection

    pub fn refcount(&self, obj: ObjectHandle) -> MemResult<usize> {
        Ok(self.header(obj)?.refcount.get())
    }

    pub fn type_tag(&self, obj: ObjectHandle) -> MemResult<TypeTag> {
        Ok(self.header(obj)?.type_tag)
    }

    pub fn is_tracked(&self, obj: ObjectHandle) -> MemResult<bool> {
        Ok(self.header(obj)?.has_flag(gc_flags::TRACKED))
    }

    /// Generation of a tracked object, `None` when untracked
    pub fn generation(&self, obj: ObjectHandle) -> MemResult<Option<Generation>> {
        let hdr = self.header(obj)?;
        if !hdr.has_flag(gc_flags::TRACKED) {
            return Ok(None);
        }
        Ok(Generation::from_index(hdr.gc_generation.get() as usize))
    }

    /// Whether the handle still names a live object that is not being destroyed
    pub fn is_live(&self, obj: ObjectHandle) -> bool {
        self.validate(obj)
            .is_some_and(|hdr| !hdr.has_flag(gc_flags::DOOMED))
    }

    pub fn live_objects(&self) -> usize {
        self.live_objects.get()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Hand every empty arena back to the OS, returns how many
    pub fn reclaim_empty_arenas(&self) -> usize {
        self.heap.reclaim_empty_arenas()
    }

    /// Tracked objects per generation, in bucket order
    pub fn generation_members(&self, gen: Generation) -> Vec<ObjectHandle> {
        self.gc
            .generation(gen.index())
            .to_vec()
            .into_iter()
            // safety: tracked objects are live
            .map(|hdr| unsafe { (*hdr).handle() })
            .collect()
    }

    // -------------------------------------------------------------------
    // collector controls

    /// Run a collection pass right now, even if automatic collection is off
    ///
    /// Returns how many unreachable objects were reclaimed.
    pub fn collect(&self, gen: Generation) -> MemResult<usize> {
        self.gc.collect(self, gen)
    }

    pub fn enable(&self) {
        self.gc.enable();
    }

    pub fn disable(&self) {
        self.gc.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.gc.is_enabled()
    }

    pub fn set_thresholds(&self, t0: usize, t1: usize, t2: usize) {
        self.gc.set_thresholds(Thresholds::new(t0, t1, t2));
    }

    pub fn thresholds(&self) -> Thresholds {
        self.gc.thresholds()
    }

    pub fn stats(&self) -> GcStats {
        self.gc.stats()
    }

    /// Automatic trigger counters
    ///
    /// `[0]`: tracked allocations minus deallocations since the last
    /// generation 0 pass, `[1]`/`[2]`: passes of the next younger
    /// generation since the last pass of this one.
    pub fn count(&self) -> [usize; NUM_GENERATIONS] {
        self.gc.counts()
    }

    pub fn collector_state(&self) -> CollectorState {
        self.gc.state()
    }

    // -------------------------------------------------------------------
    // weak references

    /// Create a weak reference, with an optional callback run when `obj`
    /// is destroyed
    pub fn weak_create(
        &self,
        obj: ObjectHandle,
        callback: Option<WeakCallback>,
    ) -> MemResult<WeakHandle> {
        let hdr = self.header(obj)?;
        if hdr.has_flag(gc_flags::DOOMED) {
            return Err(Violation::StaleHandle.into());
        }
        hdr.set_flag(gc_flags::HAS_WEAK);
        Ok(self.weak.create(obj, callback))
    }

    /// Borrowed target of a weak reference, no reference added
    pub fn weak_resolve(&self, weak: WeakHandle) -> Option<ObjectHandle> {
        self.weak.resolve(weak).filter(|obj| self.is_live(*obj))
    }

    /// Target of a weak reference with a new strong reference for the caller
    pub fn weak_upgrade(&self, weak: WeakHandle) -> MemResult<Option<ObjectHandle>> {
        match self.weak_resolve(weak) {
            Some(obj) => {
                self.incref(obj)?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// Drop a weak reference; its callback will never run
    pub fn weak_release(&self, weak: WeakHandle) -> bool {
        self.weak.release(weak)
    }

    pub fn weak_count(&self, obj: ObjectHandle) -> MemResult<usize> {
        self.header(obj)?;
        Ok(self.weak.count(obj))
    }

    // -------------------------------------------------------------------
    // interning

    /// Canonical instance for an admitted value, or a fresh one otherwise
    ///
    /// Either way the caller owns one reference to the result.
    pub fn intern(&self, policy: PolicyKey, value: InternValue<'_>) -> MemResult<ObjectHandle> {
        self.intern.intern(self, policy, value)
    }

    pub fn interned_count(&self) -> usize {
        self.intern.len()
    }

    // -------------------------------------------------------------------
    // teardown

    /// Run a final full collection and report what is left
    ///
    /// Interned instances lose their baseline reference first, so the
    /// report only counts objects the host still holds.
    pub fn shutdown(self) -> MemResult<ShutdownReport> {
        self.gc.disable();
        self.intern.release_all(&self)?;
        let collected = self.collect(Generation::All)?;
        let report = ShutdownReport {
            collected,
            live_objects: self.live_objects.get(),
            heap: self.heap.stats(),
        };
        if report.live_objects > 0 {
            tracing::warn!(live = report.live_objects, "objects still alive at shutdown");
        }
        tracing::debug!(?report, "shutdown");
        Ok(report)
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.gc.disable();
        if let Err(e) = self.intern.release_all(self) {
            tracing::warn!(error = %e, "releasing interned instances failed");
        }
        // everything else goes away with the heap
    }
}

#[cfg(test)]
mod tests;
