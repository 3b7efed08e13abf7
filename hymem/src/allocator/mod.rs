//! Segmented slab allocator backing every managed object
//!
//! Memory is requested from the OS in arenas of [ARENA_SZ] bytes which are
//! aligned to their own size, so the arena owning any block can be found by
//! masking off the low bits of its address. Each arena is cut into
//! [POOLS_PER_ARENA] pools. A pool is either unassigned or carved into
//! blocks of one size class. Size classes are multiples of [ALIGNMENT]
//! up to [SMALL_REQUEST_THRESHOLD]; anything bigger bypasses the pools
//! and gets its own allocation.
//!
//! ```text
//! +-arena (256 K, aligned to 256 K)------------------------------------+
//! | pool 0 (16 K)            | pool 1 (16 K)  | ... | pool 15 (16 K)   |
//! | ArenaHdr | blocks ...    | blocks ...     |     | blocks ...       |
//! +--------------------------------------------------------------------+
//! ```
//!
//! The arena header holds the metadata for all of its pools. Pool
//! metadata is *not* stored in the pool itself.
//!
//! A free block stores the free-list link in its first word. Object headers
//! put their validity word (which always has bit 63 set) in the same place,
//! so a freed block can always be told apart from a live object as long as
//! its arena has not been handed back to the OS.
//!
//! Pools that still have free blocks sit on a per-size-class doubly-linked
//! "available" list. Allocation always takes from the head of that list.
//! When a pool becomes completely empty it gives up its size class and
//! goes back to its arena. When an arena becomes completely empty it
//! becomes a reclamation candidate.

use std::{
    alloc::{self, Layout},
    cell::{Cell, RefCell},
    fmt::Debug,
    mem::size_of,
    ptr::{self, addr_of_mut, NonNull},
};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::Level;

use crate::{
    error::{MemError, MemResult},
    util::{roundto, UsizePtr},
};

/// log2 of the size of an arena
const ARENA_SHIFT: usize = 18; // 256 K
/// Size in bytes of an arena
pub const ARENA_SZ: usize = 1 << ARENA_SHIFT;
/// [Layout] of an appropriately-aligned arena (aligned to its size)
const ARENA_LAYOUT: Layout = match Layout::from_size_align(ARENA_SZ, ARENA_SZ) {
    Ok(x) => x,
    Err(_) => panic!("Invalid ARENA_SZ"),
};
/// log2 of the size of a pool within an arena
const POOL_SHIFT: usize = 14; // 16 K
/// Size in bytes of a pool within an arena
pub const POOL_SZ: usize = 1 << POOL_SHIFT;
/// The number of pools that fit within an arena
pub const POOLS_PER_ARENA: usize = ARENA_SZ / POOL_SZ;
/// Alignment (and granularity) of every block
pub const ALIGNMENT: usize = 16;
/// Number of size classes in the ladder
pub const NUM_SIZE_CLASSES: usize = 32;
/// Requests bigger than this get a dedicated allocation
pub const SMALL_REQUEST_THRESHOLD: usize = ALIGNMENT * NUM_SIZE_CLASSES;
/// Bytes at the start of pool 0 taken up by the arena header
const ARENA_HDR_SZ: usize = roundto(size_of::<ArenaHdr>(), ALIGNMENT);
const _: () = assert!(ARENA_HDR_SZ + SMALL_REQUEST_THRESHOLD <= POOL_SZ);
const _: () = assert!(NUM_SIZE_CLASSES < UNASSIGNED as usize);

/// Marker in [PoolMeta::size_class] for a pool that holds no blocks
const UNASSIGNED: u8 = u8::MAX;

/// Size class index for a request, or `None` if it must go to the large path
pub const fn size_class_of(sz: usize) -> Option<usize> {
    if sz > SMALL_REQUEST_THRESHOLD {
        None
    } else if sz == 0 {
        Some(0)
    } else {
        Some((sz - 1) / ALIGNMENT)
    }
}

/// Block size of a size class
pub const fn class_block_size(class: usize) -> usize {
    (class + 1) * ALIGNMENT
}

/// Allocator-facing subset of [Config](crate::Config)
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocConfig {
    pub retained_empty_arenas: usize,
    pub memory_limit: Option<usize>,
}

/// Counters exposed for introspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Arenas currently held
    pub arenas: usize,
    /// Arenas ever requested from the OS
    pub arenas_created: u64,
    /// Arenas handed back to the OS
    pub arenas_reclaimed: u64,
    /// Pools currently assigned to a size class
    pub pools_in_use: usize,
    /// Blocks currently handed out from pools
    pub blocks_allocated: usize,
    /// Live large objects
    pub large_objects: usize,
    /// Bytes held in live large objects
    pub large_bytes: usize,
    /// Bytes currently requested from the OS
    pub reserved_bytes: usize,
}

/// A block handed out by [Heap::allocate]
///
/// `pool` is null for large objects.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    pub ptr: NonNull<u8>,
    pub pool: *const PoolMeta,
    pub size: usize,
}

/// Contents of a block when it is free (i.e. free chain)
#[repr(C)]
struct FreeBlock {
    // DO NOT MODIFY
    // object headers rely on this overlapping their validity word
    next: Cell<*mut FreeBlock>,
}

/// Metadata for each (16 K) pool.
///
/// Note that this is not stored *in* the pool, but in the arena header.
#[repr(C)]
pub struct PoolMeta {
    /// Owning arena
    arena: *const ArenaHdr,
    /// Position within the arena
    index: usize,
    /// Size class, or [UNASSIGNED]
    size_class: Cell<u8>,
    /// Blocks that can be handed out
    free_list: Cell<*mut FreeBlock>,
    /// Blocks currently handed out
    allocated: Cell<usize>,
    /// Total blocks in this pool for its current size class
    capacity: Cell<usize>,
    /// Available list (only meaningful while assigned and not full)
    next_avail: Cell<*const PoolMeta>,
    prev_avail: Cell<*const PoolMeta>,
}

impl Debug for PoolMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMeta")
            .field("@addr", &(self as *const _))
            .field("index", &self.index)
            .field("size_class", &self.size_class.get())
            .field("free_list", &self.free_list.get())
            .field("allocated", &self.allocated.get())
            .field("capacity", &self.capacity.get())
            .field("next_avail", &self.next_avail.get())
            .field("prev_avail", &self.prev_avail.get())
            .finish()
    }
}

impl PoolMeta {
    unsafe fn init(self_: *mut Self, arena: *const ArenaHdr, index: usize) {
        ptr::write(
            self_,
            PoolMeta {
                arena,
                index,
                size_class: Cell::new(UNASSIGNED),
                free_list: Cell::new(ptr::null_mut()),
                allocated: Cell::new(0),
                capacity: Cell::new(0),
                next_avail: Cell::new(ptr::null()),
                prev_avail: Cell::new(ptr::null()),
            },
        );
    }

    #[inline]
    fn is_assigned(&self) -> bool {
        self.size_class.get() != UNASSIGNED
    }

    #[inline]
    fn arena(&self) -> &ArenaHdr {
        // safety: pool metadata only exists inside a live arena header
        unsafe { &*self.arena }
    }

    /// First byte of this pool that can hold blocks
    fn data_start(&self) -> usize {
        let unusable = if self.index == 0 { ARENA_HDR_SZ } else { 0 };
        self.arena as usize + self.index * POOL_SZ + unusable
    }

    fn data_len(&self) -> usize {
        let unusable = if self.index == 0 { ARENA_HDR_SZ } else { 0 };
        POOL_SZ - unusable
    }

    /// Carve this pool into blocks of `class` and chain them all together
    ///
    /// The pool memory is zeroed first so that stale object headers from a
    /// previous size class cannot survive at their old offsets.
    fn assign(&self, class: usize) {
        debug_assert!(!self.is_assigned());
        let block_sz = class_block_size(class);
        let start = self.data_start();
        let num_blocks = self.data_len() / block_sz;
        debug_assert!(num_blocks > 0);

        unsafe {
            // safety: the whole data region of an unassigned pool belongs to us
            ptr::write_bytes(start as *mut u8, 0, self.data_len());
            for block_i in 0..num_blocks {
                let block_ptr = (start + block_i * block_sz) as *mut FreeBlock;
                let next = if block_i + 1 < num_blocks {
                    (start + (block_i + 1) * block_sz) as *mut FreeBlock
                } else {
                    ptr::null_mut()
                };
                ptr::write(block_ptr, FreeBlock { next: Cell::new(next) });
            }
        }

        self.size_class.set(class as u8);
        self.free_list.set(start as *mut FreeBlock);
        self.allocated.set(0);
        self.capacity.set(num_blocks);
    }

    fn unassign(&self) {
        debug_assert!(self.allocated.get() == 0);
        self.size_class.set(UNASSIGNED);
        self.free_list.set(ptr::null_mut());
        self.capacity.set(0);
        self.next_avail.set(ptr::null());
        self.prev_avail.set(ptr::null());
    }
}

/// Header for each (256 K) arena, stored at the start of pool 0
#[repr(C)]
struct ArenaHdr {
    /// Sequence number, only for debugging
    serial: u64,
    /// Number of pools currently assigned to a size class
    pools_in_use: Cell<usize>,
    /// Metadata for each pool within the arena
    pools: [PoolMeta; POOLS_PER_ARENA],
}

impl Debug for ArenaHdr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaHdr")
            .field("@addr", &(self as *const _))
            .field("serial", &self.serial)
            .field("pools_in_use", &self.pools_in_use.get())
            .field("pools", &self.pools)
            .finish()
    }
}

impl ArenaHdr {
    unsafe fn init(self_: *mut Self, serial: u64) {
        (*self_).serial = serial;
        ptr::write(addr_of_mut!((*self_).pools_in_use), Cell::new(0));
        for i in 0..POOLS_PER_ARENA {
            PoolMeta::init(addr_of_mut!((*self_).pools[i]), self_, i);
        }
        // safety: we initialized everything
    }
}

/// Allocator root object
///
/// Single-mutator: every method takes `&self` and uses `Cell`s for state,
/// the caller guarantees nobody else is inside the allocator at the same time.
pub struct Heap {
    config: AllocConfig,
    /// Arenas in creation order
    arenas: RefCell<Vec<NonNull<ArenaHdr>>>,
    /// Base addresses of live arenas, for handle validation
    arena_set: RefCell<FxHashSet<usize>>,
    /// Per-size-class list of pools with free blocks
    avail: [Cell<*const PoolMeta>; NUM_SIZE_CLASSES],
    /// Arenas with no assigned pool
    empty_arenas: Cell<usize>,
    /// Large objects (address -> layout)
    large: RefCell<FxHashMap<usize, Layout>>,
    reserved_bytes: Cell<usize>,
    arenas_created: Cell<u64>,
    arenas_reclaimed: Cell<u64>,
}

impl Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("@addr", &(self as *const _))
            .field("config", &self.config)
            .field("arenas", &self.arenas.borrow())
            .field("empty_arenas", &self.empty_arenas.get())
            .field("large", &self.large.borrow().len())
            .field("reserved_bytes", &self.reserved_bytes.get())
            .finish()
    }
}

impl Heap {
    pub fn new(config: AllocConfig) -> Self {
        Self {
            config,
            arenas: RefCell::new(Vec::new()),
            arena_set: RefCell::new(FxHashSet::default()),
            avail: std::array::from_fn(|_| Cell::new(ptr::null())),
            empty_arenas: Cell::new(0),
            large: RefCell::new(FxHashMap::default()),
            reserved_bytes: Cell::new(0),
            arenas_created: Cell::new(0),
            arenas_reclaimed: Cell::new(0),
        }
    }

    /// Allocate a zeroed block of at least `size` bytes, aligned to [ALIGNMENT]
    pub fn allocate(&self, size: usize) -> MemResult<Block> {
        match size_class_of(size) {
            Some(class) => self.alloc_small(class),
            None => self.alloc_large(size),
        }
    }

    /// Give a block back
    ///
    /// Block must have come from this heap, not already be released,
    /// and nothing may touch it afterwards
    pub unsafe fn release(&self, ptr: NonNull<u8>, pool: *const PoolMeta) {
        if pool.is_null() {
            self.release_large(ptr);
        } else {
            self.release_small(ptr, &*pool);
        }
    }

    /// Check whether `addr` is the start of a block this heap currently holds
    /// and the block is at least `len` bytes long
    ///
    /// The block may be free or allocated.
    pub fn contains_block(&self, addr: usize, len: usize) -> bool {
        if addr % ALIGNMENT != 0 {
            return false;
        }
        let base = addr & !(ARENA_SZ - 1);
        if self.arena_set.borrow().contains(&base) {
            // safety: live arena, header is initialized
            let arena = unsafe { &*(base as *const ArenaHdr) };
            let pool = &arena.pools[(addr - base) / POOL_SZ];
            if !pool.is_assigned() || addr < pool.data_start() {
                return false;
            }
            let block_sz = class_block_size(pool.size_class.get() as usize);
            let offs = addr - pool.data_start();
            return len <= block_sz
                && offs % block_sz == 0
                && offs / block_sz < pool.capacity.get();
        }
        self.large
            .borrow()
            .get(&addr)
            .is_some_and(|layout| len <= layout.size())
    }

    fn alloc_small(&self, class: usize) -> MemResult<Block> {
        let mut pool = self.avail[class].get();
        if pool.is_null() {
            pool = self.alloc_slow(class)?;
        }
        // safety: pools on the available list are in live arenas
        let pool = unsafe { &*pool };
        let block = pool.free_list.get();
        debug_assert!(!block.is_null());
        // safety: free list entries are free blocks inside this pool
        pool.free_list.set(unsafe { (*block).next.get() });
        pool.allocated.set(pool.allocated.get() + 1);
        if pool.free_list.get().is_null() {
            self.unlink_avail(pool);
        }

        let block_sz = class_block_size(class);
        unsafe {
            ptr::write_bytes(block as *mut u8, 0, block_sz);
        }
        Ok(Block {
            // safety: came from the free list, which never holds null
            ptr: unsafe { NonNull::new_unchecked(block as *mut u8) },
            pool: pool as *const PoolMeta,
            size: block_sz,
        })
    }

    /// Allocation slow path
    ///
    /// Finds (or makes) a pool for `class` and puts it on the available list
    fn alloc_slow(&self, class: usize) -> MemResult<*const PoolMeta> {
        let trace_span = tracing::span!(Level::TRACE, "allocator::alloc_slow", class);
        let _span_enter = trace_span.enter();

        let pool = match self.find_unassigned_pool() {
            Some(pool) => pool,
            None => {
                let arena = self.grow(class_block_size(class))?;
                // safety: freshly initialized arena
                unsafe { &(*arena.as_ptr()).pools[0] as *const PoolMeta }
            }
        };
        let pool = unsafe { &*pool };
        let arena = pool.arena();
        if arena.pools_in_use.get() == 0 {
            self.empty_arenas.set(self.empty_arenas.get() - 1);
        }
        arena.pools_in_use.set(arena.pools_in_use.get() + 1);
        pool.assign(class);
        self.link_avail(pool);

        tracing::event!(
            Level::TRACE,
            pool = ?UsizePtr::from(pool),
            capacity = pool.capacity.get()
        );
        Ok(pool as *const PoolMeta)
    }

    /// Pick an unassigned pool, preferring the fullest arena that still has one
    ///
    /// Packing into already-busy arenas lets the mostly-empty ones drain
    /// and eventually be reclaimed.
    fn find_unassigned_pool(&self) -> Option<*const PoolMeta> {
        let arenas = self.arenas.borrow();
        let mut best: Option<&ArenaHdr> = None;
        for arena in arenas.iter() {
            let arena = unsafe { arena.as_ref() };
            let in_use = arena.pools_in_use.get();
            if in_use == POOLS_PER_ARENA {
                continue;
            }
            if best.map_or(true, |b| in_use > b.pools_in_use.get()) {
                best = Some(arena);
            }
        }
        let arena = best?;
        arena
            .pools
            .iter()
            .find(|p| !p.is_assigned())
            .map(|p| p as *const PoolMeta)
    }

    /// Get a fresh arena
    ///
    /// Only called once no arena has an unassigned pool. An empty arena
    /// would have had one, so there is nothing to reclaim and a denial is
    /// final. The reclaim-and-retry step lives on the large-object path.
    fn grow(&self, size: usize) -> MemResult<NonNull<ArenaHdr>> {
        self.new_arena().ok_or_else(|| {
            tracing::warn!(size, "arena request denied");
            MemError::AllocationFailure { size }
        })
    }

    fn would_exceed_limit(&self, bytes: usize) -> bool {
        match self.config.memory_limit {
            Some(limit) => self.reserved_bytes.get().saturating_add(bytes) > limit,
            None => false,
        }
    }

    fn new_arena(&self) -> Option<NonNull<ArenaHdr>> {
        if self.would_exceed_limit(ARENA_SZ) {
            return None;
        }
        let new_arena = unsafe { alloc::alloc_zeroed(ARENA_LAYOUT) as *mut ArenaHdr };
        let new_arena = NonNull::new(new_arena)?;
        let serial = self.arenas_created.get();
        unsafe {
            ArenaHdr::init(new_arena.as_ptr(), serial);
        }
        self.arenas_created.set(serial + 1);
        self.arenas.borrow_mut().push(new_arena);
        self.arena_set
            .borrow_mut()
            .insert(new_arena.as_ptr() as usize);
        self.empty_arenas.set(self.empty_arenas.get() + 1);
        self.reserved_bytes
            .set(self.reserved_bytes.get() + ARENA_SZ);

        tracing::debug!(ptr = ?UsizePtr::from(new_arena.as_ptr()), serial, "new arena");
        Some(new_arena)
    }

    fn link_avail(&self, pool: &PoolMeta) {
        let class = pool.size_class.get() as usize;
        let head = self.avail[class].get();
        pool.prev_avail.set(ptr::null());
        pool.next_avail.set(head);
        if !head.is_null() {
            unsafe { (*head).prev_avail.set(pool) };
        }
        self.avail[class].set(pool);
    }

    fn unlink_avail(&self, pool: &PoolMeta) {
        let class = pool.size_class.get() as usize;
        let prev = pool.prev_avail.get();
        let next = pool.next_avail.get();
        if prev.is_null() {
            debug_assert!(self.avail[class].get() == pool as *const _);
            self.avail[class].set(next);
        } else {
            unsafe { (*prev).next_avail.set(next) };
        }
        if !next.is_null() {
            unsafe { (*next).prev_avail.set(prev) };
        }
        pool.prev_avail.set(ptr::null());
        pool.next_avail.set(ptr::null());
    }

    unsafe fn release_small(&self, ptr: NonNull<u8>, pool: &PoolMeta) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::release");
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr.as_ptr()));

        debug_assert!(pool.is_assigned());
        debug_assert!(pool.allocated.get() > 0);
        let was_full = pool.free_list.get().is_null();
        let block = ptr.as_ptr() as *mut FreeBlock;
        debug_assert!((pool.free_list.get() as usize as u64) < (1u64 << 63));
        ptr::write(
            block,
            FreeBlock {
                next: Cell::new(pool.free_list.get()),
            },
        );
        pool.free_list.set(block);
        pool.allocated.set(pool.allocated.get() - 1);

        if pool.allocated.get() == 0 {
            if !was_full {
                self.unlink_avail(pool);
            }
            pool.unassign();
            let arena = pool.arena();
            arena.pools_in_use.set(arena.pools_in_use.get() - 1);
            if arena.pools_in_use.get() == 0 {
                self.empty_arenas.set(self.empty_arenas.get() + 1);
                self.maybe_reclaim_arena(arena);
            }
        } else if was_full {
            self.link_avail(pool);
        }
    }

    /// Hand an empty arena back to the OS if we are holding more
    /// empty arenas than configured
    fn maybe_reclaim_arena(&self, arena: &ArenaHdr) {
        debug_assert!(arena.pools_in_use.get() == 0);
        if self.empty_arenas.get() > self.config.retained_empty_arenas {
            let arena = NonNull::from(arena);
            unsafe { self.free_arena(arena) };
        }
    }

    /// Hand every empty arena back to the OS
    ///
    /// Returns the number of arenas released
    pub fn reclaim_empty_arenas(&self) -> usize {
        let empty: Vec<NonNull<ArenaHdr>> = self
            .arenas
            .borrow()
            .iter()
            .copied()
            .filter(|a| unsafe { a.as_ref() }.pools_in_use.get() == 0)
            .collect();
        let n = empty.len();
        for arena in empty {
            unsafe { self.free_arena(arena) };
        }
        n
    }

    /// Arena must be empty, and nothing may reference it afterwards
    unsafe fn free_arena(&self, arena: NonNull<ArenaHdr>) {
        debug_assert!(arena.as_ref().pools_in_use.get() == 0);
        let addr = arena.as_ptr() as usize;
        tracing::debug!(ptr = ?UsizePtr(addr), serial = arena.as_ref().serial, "reclaiming arena");

        self.arenas.borrow_mut().retain(|a| *a != arena);
        self.arena_set.borrow_mut().remove(&addr);
        self.empty_arenas.set(self.empty_arenas.get() - 1);
        self.reserved_bytes
            .set(self.reserved_bytes.get() - ARENA_SZ);
        self.arenas_reclaimed.set(self.arenas_reclaimed.get() + 1);
        alloc::dealloc(arena.as_ptr() as *mut u8, ARENA_LAYOUT);
    }

    fn alloc_large(&self, size: usize) -> MemResult<Block> {
        let trace_span = tracing::span!(Level::TRACE, "allocator::alloc_large", size);
        let _span_enter = trace_span.enter();

        let layout = Layout::from_size_align(size, ALIGNMENT)
            .map_err(|_| MemError::AllocationFailure { size })?;
        let ptr = match self.try_alloc_large(layout) {
            Some(ptr) => ptr,
            None => {
                tracing::warn!(size, "large allocation denied, reclaiming empty arenas and retrying");
                self.reclaim_empty_arenas();
                self.try_alloc_large(layout)
                    .ok_or(MemError::AllocationFailure { size })?
            }
        };
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr.as_ptr()));
        Ok(Block {
            ptr,
            pool: ptr::null(),
            size,
        })
    }

    fn try_alloc_large(&self, layout: Layout) -> Option<NonNull<u8>> {
        if self.would_exceed_limit(layout.size()) {
            return None;
        }
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        self.large.borrow_mut().insert(ptr.as_ptr() as usize, layout);
        self.reserved_bytes
            .set(self.reserved_bytes.get() + layout.size());
        Some(ptr)
    }

    unsafe fn release_large(&self, ptr: NonNull<u8>) {
        let trace_span = tracing::span!(Level::TRACE, "allocator::release_large");
        let _span_enter = trace_span.enter();
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr.as_ptr()));

        let layout = self.large.borrow_mut().remove(&(ptr.as_ptr() as usize));
        match layout {
            Some(layout) => {
                self.reserved_bytes
                    .set(self.reserved_bytes.get() - layout.size());
                alloc::dealloc(ptr.as_ptr(), layout);
            }
            None => panic!("Released a large block that was never allocated"),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let arenas = self.arenas.borrow();
        let mut pools_in_use = 0;
        let mut blocks_allocated = 0;
        for arena in arenas.iter() {
            let arena = unsafe { arena.as_ref() };
            pools_in_use += arena.pools_in_use.get();
            blocks_allocated += arena
                .pools
                .iter()
                .map(|p| p.allocated.get())
                .sum::<usize>();
        }
        let large = self.large.borrow();
        HeapStats {
            arenas: arenas.len(),
            arenas_created: self.arenas_created.get(),
            arenas_reclaimed: self.arenas_reclaimed.get(),
            pools_in_use,
            blocks_allocated,
            large_objects: large.len(),
            large_bytes: large.values().map(|l| l.size()).sum(),
            reserved_bytes: self.reserved_bytes.get(),
        }
    }

    /// Walk every pool and free list and check the bookkeeping adds up
    ///
    /// Panics on any inconsistency. Returns the number of outstanding blocks
    /// (pooled and large).
    pub fn _debug_check_consistency(&self) -> usize {
        let mut on_avail = FxHashSet::default();
        for class in 0..NUM_SIZE_CLASSES {
            let mut pool = self.avail[class].get();
            let mut prev: *const PoolMeta = ptr::null();
            while let Some(p) = unsafe { pool.as_ref() } {
                assert_eq!(p.size_class.get() as usize, class, "pool on wrong available list");
                assert_eq!(p.prev_avail.get(), prev, "broken available list back link");
                assert!(
                    on_avail.insert(pool as usize),
                    "pool on available lists more than once"
                );
                prev = pool;
                pool = p.next_avail.get();
            }
        }

        let mut outstanding = 0;
        let mut empty_arenas = 0;
        for arena in self.arenas.borrow().iter() {
            let arena = unsafe { arena.as_ref() };
            let mut assigned = 0;
            for pool in &arena.pools {
                if !pool.is_assigned() {
                    assert!(!on_avail.contains(&(pool as *const _ as usize)));
                    assert_eq!(pool.allocated.get(), 0);
                    continue;
                }
                assigned += 1;
                let block_sz = class_block_size(pool.size_class.get() as usize);
                let start = pool.data_start();
                let end = start + pool.capacity.get() * block_sz;

                let mut seen = FxHashSet::default();
                let mut free = pool.free_list.get();
                while !free.is_null() {
                    let addr = free as usize;
                    assert!(addr >= start && addr < end, "free block outside its pool");
                    assert_eq!((addr - start) % block_sz, 0, "misaligned free block");
                    assert!(seen.insert(addr), "block on free list twice");
                    free = unsafe { (*free).next.get() };
                }
                assert_eq!(
                    seen.len() + pool.allocated.get(),
                    pool.capacity.get(),
                    "pool block count mismatch"
                );
                assert_eq!(
                    !seen.is_empty(),
                    on_avail.contains(&(pool as *const _ as usize)),
                    "available list membership mismatch"
                );
                outstanding += pool.allocated.get();
            }
            assert_eq!(assigned, arena.pools_in_use.get());
            if assigned == 0 {
                empty_arenas += 1;
            }
        }
        assert_eq!(empty_arenas, self.empty_arenas.get());

        outstanding + self.large.borrow().len()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for arena in self.arenas.get_mut().drain(..) {
            unsafe { alloc::dealloc(arena.as_ptr() as *mut u8, ARENA_LAYOUT) };
        }
        for (addr, layout) in self.large.get_mut().drain() {
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}
