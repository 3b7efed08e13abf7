//! Object headers, handles, and the host-facing type interface
//!
//! Every managed object lives in one allocator block laid out as
//!
//! ```text
//! +-block------------------------------------------+
//! | ObjectHeader (64 bytes) | payload (host bytes) |
//! +------------------------------------------------+
//! ```
//!
//! The first word of the header is the validity word:
//! - `bits[62:0]` = allocation serial
//! - `bits[63]` = valid (i.e. allocated)
//!
//! Once a block is freed the allocator stores its free-list link in that
//! same word. A link is either null or an address, neither of which has
//! bit 63 set, so a handle whose block has been freed (or reused for an
//! object with a different serial) is detected rather than followed.

use std::{
    cell::{Cell, RefCell},
    fmt::Debug,
    mem::size_of,
    ptr::NonNull,
    rc::Rc,
};

use crate::{
    allocator::{PoolMeta, ALIGNMENT},
    error::{MemResult, Violation},
    MemoryManager,
};

/// Indicates that there is a live object in this block (i.e. not a free-list link)
pub(crate) const HDR_VALID_BIT: u64 = 1 << 63;
/// Serials are 63 bits wide
pub(crate) const HDR_SERIAL_MASK: u64 = !HDR_VALID_BIT;

/// Size of a reference slot inside a payload (address + serial)
pub const REF_SLOT_SZ: usize = 16;

/// `gc_generation` value for objects that are not tracked
pub(crate) const GEN_UNTRACKED: u8 = u8::MAX;

/// Bits of [ObjectHeader::gc_flags]
pub(crate) mod gc_flags {
    /// Member of a generation bucket
    pub const TRACKED: u8 = 1 << 0;
    /// Member of the set being scanned by the current pass
    /// (or of its doomed set once the pass is finalizing)
    pub const COLLECTING: u8 = 1 << 1;
    /// Scratch bit for the reachability walk
    pub const REACHABLE: u8 = 1 << 2;
    /// Refcount reached zero or found unreachable; being torn down
    pub const DOOMED: u8 = 1 << 3;
    /// At least one weak reference was ever created for this object
    pub const HAS_WEAK: u8 = 1 << 4;
    /// Canonical interned instance
    pub const PERMANENT: u8 = 1 << 5;
}

/// Identifies the [ObjectType] of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(pub u32);

impl TypeTag {
    /// Leaf object with an uninterpreted byte payload
    pub const OPAQUE: TypeTag = TypeTag(0);
    /// Container whose payload is an array of reference slots
    pub const SLOTS: TypeTag = TypeTag(1);
}

/// Per-object metadata, at the very start of the block
#[repr(C, align(16))]
pub(crate) struct ObjectHeader {
    /// Validity bit + serial
    ///
    /// DO NOT MOVE, this must overlap the allocator free-list link
    pub(crate) state: Cell<u64>,
    pub(crate) refcount: Cell<usize>,
    /// Trial refcount, only meaningful during a collection pass
    pub(crate) gc_refs: Cell<isize>,
    /// Generation bucket links
    pub(crate) gc_prev: Cell<*const ObjectHeader>,
    pub(crate) gc_next: Cell<*const ObjectHeader>,
    /// Owning pool, null for large objects
    pub(crate) pool: *const PoolMeta,
    pub(crate) type_tag: TypeTag,
    pub(crate) payload_len: u32,
    pub(crate) gc_generation: Cell<u8>,
    pub(crate) gc_flags: Cell<u8>,
}

pub const HEADER_SZ: usize = size_of::<ObjectHeader>();
const _: () = assert!(HEADER_SZ % ALIGNMENT == 0);

impl Debug for ObjectHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("@addr", &(self as *const _))
            .field("state", &format_args!("{:#018x}", self.state.get()))
            .field("refcount", &self.refcount.get())
            .field("gc_refs", &self.gc_refs.get())
            .field("gc_prev", &self.gc_prev.get())
            .field("gc_next", &self.gc_next.get())
            .field("pool", &self.pool)
            .field("type_tag", &self.type_tag)
            .field("payload_len", &self.payload_len)
            .field("gc_generation", &self.gc_generation.get())
            .field("gc_flags", &format_args!("{:#08b}", self.gc_flags.get()))
            .finish()
    }
}

impl ObjectHeader {
    #[inline]
    pub(crate) fn has_flag(&self, flag: u8) -> bool {
        self.gc_flags.get() & flag != 0
    }

    #[inline]
    pub(crate) fn set_flag(&self, flag: u8) {
        self.gc_flags.set(self.gc_flags.get() | flag);
    }

    #[inline]
    pub(crate) fn clear_flag(&self, flag: u8) {
        self.gc_flags.set(self.gc_flags.get() & !flag);
    }

    #[inline]
    pub(crate) fn serial(&self) -> u64 {
        self.state.get() & HDR_SERIAL_MASK
    }

    /// Handle naming this (live) header
    pub(crate) fn handle(&self) -> ObjectHandle {
        ObjectHandle {
            ptr: NonNull::from(self),
            serial: self.serial(),
        }
    }

    pub(crate) fn payload_ptr(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(HEADER_SZ) }
    }

    /// Borrow the payload
    ///
    /// safety: the object must stay allocated and nobody may write the
    /// payload while the slice is alive
    pub(crate) unsafe fn payload(&self) -> &[u8] {
        std::slice::from_raw_parts(self.payload_ptr(), self.payload_len as usize)
    }
}

/// Reference to a managed object
///
/// This is basically a fat pointer. It stores the header address and the
/// allocation serial of the object. Handles are plain values; they do not own
/// a reference by themselves, refcounting is explicit through
/// [MemoryManager::incref] / [MemoryManager::decref].
///
/// Handles compare with identity equality, not value equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    pub(crate) ptr: NonNull<ObjectHeader>,
    pub(crate) serial: u64,
}

impl Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectHandle({:?}#{})", self.ptr, self.serial)
    }
}

impl ObjectHandle {
    #[inline]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn serial(self) -> u64 {
        self.serial
    }

    /// Encoding used inside reference slots
    pub(crate) fn to_slot(slot: Option<ObjectHandle>) -> [u8; REF_SLOT_SZ] {
        let mut out = [0; REF_SLOT_SZ];
        if let Some(h) = slot {
            out[..8].copy_from_slice(&(h.addr() as u64).to_le_bytes());
            out[8..].copy_from_slice(&h.serial.to_le_bytes());
        }
        out
    }

    /// Decode a reference slot
    ///
    /// This only produces a candidate handle, it still has to be validated
    /// before anything is dereferenced.
    pub(crate) fn from_slot(bytes: &[u8]) -> Option<ObjectHandle> {
        let addr = u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?);
        let serial = u64::from_le_bytes(bytes.get(8..16)?.try_into().ok()?);
        let ptr = NonNull::new(usize::try_from(addr).ok()? as *mut ObjectHeader)?;
        Some(ObjectHandle { ptr, serial })
    }
}

/// Read-only view of an object handed to [ObjectType::enumerate_owned]
pub struct ObjectView<'a> {
    handle: ObjectHandle,
    type_tag: TypeTag,
    payload: &'a [u8],
}

impl<'a> ObjectView<'a> {
    pub(crate) fn new(hdr: &'a ObjectHeader) -> Self {
        Self {
            handle: hdr.handle(),
            type_tag: hdr.type_tag,
            // safety: views only live for the duration of a type hook call,
            // during which nothing writes the payload
            payload: unsafe { hdr.payload() },
        }
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decode the reference slot at byte `offset`, if it holds one
    pub fn ref_at(&self, offset: usize) -> Option<ObjectHandle> {
        let end = offset.checked_add(REF_SLOT_SZ)?;
        ObjectHandle::from_slot(self.payload.get(offset..end)?)
    }

    /// Every non-empty reference slot, treating the whole payload as a slot array
    pub fn ref_slots(&self) -> impl Iterator<Item = ObjectHandle> + 'a {
        self.payload
            .chunks_exact(REF_SLOT_SZ)
            .filter_map(ObjectHandle::from_slot)
    }
}

/// Host-provided behavior of one kind of object
///
/// This is the only thing the collector knows about object layouts.
pub trait ObjectType {
    fn name(&self) -> &str;

    /// Whether instances may hold owned references
    ///
    /// Containers are tracked by the cycle collector from allocation.
    fn is_container(&self) -> bool;

    /// Push every reference `obj` owns onto `out`
    ///
    /// Must report each owned reference exactly as many times as it
    /// contributes to the target's refcount.
    fn enumerate_owned(&self, obj: &ObjectView<'_>, out: &mut Vec<ObjectHandle>);

    /// Destructor business logic, run once before owned references are dropped
    ///
    /// The object is already marked as being destroyed: it can be read, but
    /// any attempt to take a new reference to it is rejected.
    fn finalize(&self, _mm: &MemoryManager, _obj: ObjectHandle) {}
}

/// Table of registered [ObjectType]s, indexed by [TypeTag]
pub(crate) struct TypeRegistry {
    types: RefCell<Vec<Rc<dyn ObjectType>>>,
}

impl TypeRegistry {
    pub(crate) fn new() -> Self {
        Self {
            types: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, ty: Rc<dyn ObjectType>) -> TypeTag {
        let mut types = self.types.borrow_mut();
        let tag = TypeTag(types.len() as u32);
        tracing::debug!(tag = tag.0, name = ty.name(), "registered type");
        types.push(ty);
        tag
    }

    /// Look up a type
    ///
    /// Hands out a clone of the `Rc` so that hooks can register types
    /// without tripping over an outstanding borrow.
    pub(crate) fn get(&self, tag: TypeTag) -> MemResult<Rc<dyn ObjectType>> {
        self.types
            .borrow()
            .get(tag.0 as usize)
            .cloned()
            .ok_or_else(|| Violation::UnknownType(tag.0).into())
    }

    pub(crate) fn len(&self) -> usize {
        self.types.borrow().len()
    }
}
