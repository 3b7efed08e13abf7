use std::{cell::RefCell, rc::Rc};

use super::*;
use crate::allocator::ARENA_SZ;

/// Slot container that runs a closure from its finalize hook
struct Hooked<F> {
    on_finalize: F,
}

impl<F: Fn(&MemoryManager, ObjectHandle)> ObjectType for Hooked<F> {
    fn name(&self) -> &str {
        "hooked"
    }

    fn is_container(&self) -> bool {
        true
    }

    fn enumerate_owned(&self, obj: &ObjectView<'_>, out: &mut Vec<ObjectHandle>) {
        out.extend(obj.ref_slots());
    }

    fn finalize(&self, mm: &MemoryManager, obj: ObjectHandle) {
        (self.on_finalize)(mm, obj)
    }
}

fn hooked<F: Fn(&MemoryManager, ObjectHandle) + 'static>(mm: &MemoryManager, f: F) -> TypeTag {
    mm.register_type(Box::new(Hooked { on_finalize: f }))
}

fn stale() -> MemError {
    MemError::InvariantViolation(Violation::StaleHandle)
}

#[test]
fn alloc_basics() {
    let mm = MemoryManager::with_defaults();
    let obj = mm.alloc(TypeTag::OPAQUE, 24).unwrap();
    println!("{:?}", obj);
    assert_eq!(mm.refcount(obj).unwrap(), 1);
    assert_eq!(mm.type_tag(obj).unwrap(), TypeTag::OPAQUE);
    assert_eq!(mm.payload_len(obj).unwrap(), 24);
    assert!(!mm.is_tracked(obj).unwrap());
    assert_eq!(mm.generation(obj).unwrap(), None);
    assert!(mm.is_live(obj));
    assert_eq!(mm.live_objects(), 1);
    assert_eq!(mm.heap_stats().blocks_allocated, 1);

    mm.decref(obj).unwrap();
    assert!(!mm.is_live(obj));
    assert_eq!(mm.live_objects(), 0);
    assert_eq!(mm.heap_stats().blocks_allocated, 0);
    assert_eq!(mm.refcount(obj).unwrap_err(), stale());
    // second release of the same handle
    assert_eq!(mm.decref(obj).unwrap_err(), stale());
    assert_eq!(mm.incref(obj).unwrap_err(), stale());
}

#[test]
fn reused_block_does_not_revive_old_handle() {
    let mm = MemoryManager::with_defaults();
    let keep = mm.alloc(TypeTag::OPAQUE, 8).unwrap();
    let old = mm.alloc(TypeTag::OPAQUE, 8).unwrap();
    mm.decref(old).unwrap();
    let new = mm.alloc(TypeTag::OPAQUE, 8).unwrap();
    // same block, different serial
    assert_eq!(new.addr(), old.addr());
    assert_ne!(new, old);
    assert!(mm.is_live(new));
    assert!(!mm.is_live(old));
    assert_eq!(mm.refcount(old).unwrap_err(), stale());
    mm.decref(keep).unwrap();
    mm.decref(new).unwrap();
}

#[test]
fn large_object_payload() {
    let mm = MemoryManager::with_defaults();
    let obj = mm.alloc(TypeTag::OPAQUE, 4000).unwrap();
    assert_eq!(mm.heap_stats().large_objects, 1);
    mm.write_bytes(obj, 3990, b"0123456789").unwrap();
    let mut buf = [0; 10];
    mm.read_bytes(obj, 3990, &mut buf).unwrap();
    assert_eq!(&buf, b"0123456789");
    mm.decref(obj).unwrap();
    assert_eq!(mm.heap_stats().large_objects, 0);
}

#[test]
fn unknown_type() {
    let mm = MemoryManager::with_defaults();
    assert_eq!(
        mm.alloc(TypeTag(42), 8).unwrap_err(),
        MemError::InvariantViolation(Violation::UnknownType(42))
    );
}

#[test]
fn registered_types_follow_builtins() {
    let mm = MemoryManager::with_defaults();
    let tag = hooked(&mm, |_, _| {});
    assert_eq!(tag, TypeTag(2));
    let obj = mm.alloc(tag, 16).unwrap();
    assert!(mm.is_tracked(obj).unwrap());
    mm.decref(obj).unwrap();
}

#[test]
fn payload_bounds() {
    let mm = MemoryManager::with_defaults();
    let obj = mm.alloc(TypeTag::OPAQUE, 16).unwrap();
    assert!(mm.read_bytes(obj, 0, &mut [0; 16]).is_ok());
    assert_eq!(
        mm.read_bytes(obj, 8, &mut [0; 16]).unwrap_err(),
        MemError::InvariantViolation(Violation::OutOfBounds {
            offset: 8,
            len: 16,
            payload: 16
        })
    );
    assert!(mm.write_bytes(obj, usize::MAX, b"x").is_err());
    assert!(mm.load_ref(obj, 8).is_err());
    mm.decref(obj).unwrap();
}

#[test]
fn fresh_payload_is_zeroed() {
    let mm = MemoryManager::with_defaults();
    let a = mm.alloc(TypeTag::OPAQUE, 48).unwrap();
    mm.write_bytes(a, 0, &[0xff; 48]).unwrap();
    mm.decref(a).unwrap();
    let b = mm.alloc(TypeTag::OPAQUE, 48).unwrap();
    let mut buf = [1; 48];
    mm.read_bytes(b, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&x| x == 0));
}

#[test]
fn store_ref_moves_references() {
    let mm = MemoryManager::with_defaults();
    let c = mm.alloc_slots(2).unwrap();
    let a = mm.alloc(TypeTag::OPAQUE, 0).unwrap();
    let b = mm.alloc(TypeTag::OPAQUE, 0).unwrap();
    assert!(mm.is_tracked(c).unwrap());
    assert_eq!(mm.generation(c).unwrap(), Some(Generation::Gen0));
    assert_eq!(mm.get_slot(c, 0).unwrap(), None);

    mm.set_slot(c, 0, Some(a)).unwrap();
    assert_eq!(mm.refcount(a).unwrap(), 2);
    assert_eq!(mm.get_slot(c, 0).unwrap(), Some(a));

    mm.set_slot(c, 0, Some(b)).unwrap();
    assert_eq!(mm.refcount(a).unwrap(), 1);
    assert_eq!(mm.refcount(b).unwrap(), 2);

    // same value again is a no-op for the count
    mm.set_slot(c, 0, Some(b)).unwrap();
    assert_eq!(mm.refcount(b).unwrap(), 2);

    mm.set_slot(c, 0, None).unwrap();
    assert_eq!(mm.refcount(b).unwrap(), 1);
    assert!(mm.set_slot(c, 2, Some(a)).is_err());
    assert_eq!(mm.refcount(a).unwrap(), 1);

    mm.decref(a).unwrap();
    mm.decref(b).unwrap();
    mm.decref(c).unwrap();
    assert_eq!(mm.live_objects(), 0);
}

#[test]
fn store_ref_drops_last_reference() {
    let mm = MemoryManager::with_defaults();
    let c = mm.alloc_slots(1).unwrap();
    let a = mm.alloc(TypeTag::OPAQUE, 0).unwrap();
    mm.set_slot(c, 0, Some(a)).unwrap();
    mm.decref(a).unwrap();
    assert!(mm.is_live(a));
    mm.set_slot(c, 0, None).unwrap();
    assert!(!mm.is_live(a));
    mm.decref(c).unwrap();
}

#[test]
fn store_ref_over_stale_slot_changes_nothing() {
    let mm = MemoryManager::with_defaults();
    let c = mm.alloc_slots(1).unwrap();
    let gone = mm.alloc(TypeTag::OPAQUE, 8).unwrap();
    mm.decref(gone).unwrap();
    let raw = ObjectHandle::to_slot(Some(gone));
    mm.write_bytes(c, 0, &raw).unwrap();

    let v = mm.alloc(TypeTag::OPAQUE, 8).unwrap();
    assert_eq!(mm.set_slot(c, 0, Some(v)).unwrap_err(), stale());
    assert_eq!(mm.refcount(v).unwrap(), 1);
    let mut now = [0; REF_SLOT_SZ];
    mm.read_bytes(c, 0, &mut now).unwrap();
    assert_eq!(now, raw);

    mm.write_bytes(c, 0, &[0; REF_SLOT_SZ]).unwrap();
    mm.set_slot(c, 0, Some(v)).unwrap();
    assert_eq!(mm.refcount(v).unwrap(), 2);
    mm.decref(v).unwrap();
    mm.decref(c).unwrap();
    assert!(!mm.is_live(v));
}

#[test]
fn cascade_frees_owned_objects() {
    let mm = MemoryManager::with_defaults();
    let outer = mm.alloc_slots(2).unwrap();
    let inner = mm.alloc_slots(1).unwrap();
    let leaf = mm.alloc(TypeTag::OPAQUE, 8).unwrap();
    mm.set_slot(inner, 0, Some(leaf)).unwrap();
    mm.set_slot(outer, 0, Some(inner)).unwrap();
    mm.set_slot(outer, 1, Some(leaf)).unwrap();
    mm.decref(inner).unwrap();
    mm.decref(leaf).unwrap();
    assert_eq!(mm.refcount(leaf).unwrap(), 2);
    assert_eq!(mm.count()[0], 2);

    mm.decref(outer).unwrap();
    assert!(!mm.is_live(outer));
    assert!(!mm.is_live(inner));
    assert!(!mm.is_live(leaf));
    assert_eq!(mm.live_objects(), 0);
    assert_eq!(mm.count()[0], 0);
    assert_eq!(mm.stats().collections, [0, 0, 0]);
}

#[test]
fn deep_chain_is_not_recursive() {
    let mm = MemoryManager::new(Config::default().with_gc_enabled(false));
    let head = mm.alloc_slots(1).unwrap();
    let mut tail = head;
    for _ in 0..200_000 {
        let next = mm.alloc_slots(1).unwrap();
        mm.set_slot(tail, 0, Some(next)).unwrap();
        mm.decref(next).unwrap();
        tail = next;
    }
    assert_eq!(mm.live_objects(), 200_001);
    mm.decref(head).unwrap();
    assert_eq!(mm.live_objects(), 0);
    assert!(!mm.is_live(tail));
}

#[test]
fn finalize_runs_once_before_owned_refs_drop() {
    let mm = MemoryManager::with_defaults();
    let log = Rc::new(RefCell::new(Vec::new()));
    let log2 = log.clone();
    let tag = hooked(&mm, move |mm, obj| {
        // owned references are still in place
        let child = mm.get_slot(obj, 0).unwrap();
        log2.borrow_mut().push((obj, child.map(|c| mm.refcount(c).unwrap())));
    });
    let parent = mm.alloc(tag, REF_SLOT_SZ).unwrap();
    let child = mm.alloc(TypeTag::OPAQUE, 0).unwrap();
    mm.set_slot(parent, 0, Some(child)).unwrap();
    mm.decref(child).unwrap();

    mm.decref(parent).unwrap();
    assert_eq!(*log.borrow(), vec![(parent, Some(1))]);
    assert!(!mm.is_live(child));
}

#[test]
fn decref_from_hook_is_drained_by_outer_call() {
    let mm = MemoryManager::with_defaults();
    let other = mm.alloc(TypeTag::OPAQUE, 0).unwrap();
    let held = Rc::new(RefCell::new(Some(other)));
    let held2 = held.clone();
    let tag = hooked(&mm, move |mm, _| {
        if let Some(o) = held2.borrow_mut().take() {
            mm.decref(o).unwrap();
        }
    });
    let obj = mm.alloc(tag, 0).unwrap();
    mm.decref(obj).unwrap();
    assert!(held.borrow().is_none());
    assert!(!mm.is_live(other));
    assert_eq!(mm.live_objects(), 0);
}

#[test]
fn resurrection_is_rejected() {
    let mm = MemoryManager::with_defaults();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    let tag = hooked(&mm, move |mm, obj| {
        seen2.borrow_mut().push(mm.incref(obj));
        seen2.borrow_mut().push(mm.track(obj));
        seen2.borrow_mut().push(mm.weak_create(obj, None).map(|_| ()));
        assert!(!mm.is_live(obj));
    });
    let obj = mm.alloc(tag, 0).unwrap();
    mm.decref(obj).unwrap();
    assert_eq!(
        *seen.borrow(),
        vec![
            Err(MemError::InvariantViolation(Violation::Resurrection)),
            Err(MemError::InvariantViolation(Violation::Resurrection)),
            Err(stale()),
        ]
    );
    assert_eq!(mm.live_objects(), 0);
}

#[test]
fn underflow_inside_hook() {
    let mm = MemoryManager::with_defaults();
    let seen = Rc::new(RefCell::new(None));
    let seen2 = seen.clone();
    let tag = hooked(&mm, move |mm, obj| {
        *seen2.borrow_mut() = Some(mm.decref(obj));
    });
    let obj = mm.alloc(tag, 0).unwrap();
    mm.decref(obj).unwrap();
    assert_eq!(
        *seen.borrow(),
        Some(Err(MemError::InvariantViolation(Violation::Underflow)))
    );
}

#[test]
fn explicit_track_untrack() {
    let mm = MemoryManager::with_defaults();
    let leaf = mm.alloc(TypeTag::OPAQUE, 0).unwrap();
    let c = mm.alloc_slots(1).unwrap();
    assert_eq!(mm.stats().objects, [1, 0, 0]);

    mm.untrack(c).unwrap();
    assert!(!mm.is_tracked(c).unwrap());
    assert_eq!(mm.stats().objects, [0, 0, 0]);
    mm.untrack(c).unwrap();

    mm.track(leaf).unwrap();
    mm.track(leaf).unwrap();
    assert_eq!(mm.generation(leaf).unwrap(), Some(Generation::Gen0));
    assert_eq!(mm.generation_members(Generation::Gen0), vec![leaf]);

    mm.decref(leaf).unwrap();
    mm.decref(c).unwrap();
    assert_eq!(mm.stats().objects, [0, 0, 0]);
}

#[test]
fn weak_refs_follow_target() {
    let mm = MemoryManager::with_defaults();
    let obj = mm.alloc(TypeTag::OPAQUE, 0).unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let fired2 = fired.clone();
    let w1 = mm
        .weak_create(
            obj,
            Some(Box::new(move |mm: &MemoryManager, w: WeakHandle| {
                // already disconnected when the callback runs
                assert_eq!(mm.weak_resolve(w), None);
                fired2.borrow_mut().push(w);
            })),
        )
        .unwrap();
    let w2 = mm.weak_create(obj, None).unwrap();
    assert_eq!(mm.weak_count(obj).unwrap(), 2);
    assert_eq!(mm.weak_resolve(w1), Some(obj));
    assert_eq!(mm.refcount(obj).unwrap(), 1);

    let strong = mm.weak_upgrade(w2).unwrap();
    assert_eq!(strong, Some(obj));
    assert_eq!(mm.refcount(obj).unwrap(), 2);
    mm.decref(obj).unwrap();

    mm.decref(obj).unwrap();
    assert_eq!(*fired.borrow(), vec![w1]);
    assert_eq!(mm.weak_resolve(w1), None);
    assert_eq!(mm.weak_resolve(w2), None);
    assert_eq!(mm.weak_upgrade(w2).unwrap(), None);
    assert!(mm.weak_release(w1));
    assert!(mm.weak_release(w2));
    assert!(!mm.weak_release(w2));
}

#[test]
fn released_weak_ref_never_fires() {
    let mm = MemoryManager::with_defaults();
    let obj = mm.alloc(TypeTag::OPAQUE, 0).unwrap();
    let fired = Rc::new(RefCell::new(false));
    let fired2 = fired.clone();
    let w = mm
        .weak_create(
            obj,
            Some(Box::new(move |_: &MemoryManager, _: WeakHandle| {
                *fired2.borrow_mut() = true
            })),
        )
        .unwrap();
    assert!(mm.weak_release(w));
    assert_eq!(mm.weak_count(obj).unwrap(), 0);
    mm.decref(obj).unwrap();
    assert!(!*fired.borrow());
}

#[test]
fn intern_small_ints() {
    let mm = MemoryManager::with_defaults();
    let a = mm.intern(PolicyKey::SMALL_INT, InternValue::Int(7)).unwrap();
    let b = mm.intern(PolicyKey::SMALL_INT, InternValue::Int(7)).unwrap();
    assert_eq!(a, b);
    // cache baseline + two callers
    assert_eq!(mm.refcount(a).unwrap(), 3);
    assert_eq!(mm.interned_count(), 1);

    let mut buf = [0; 8];
    mm.read_bytes(a, 0, &mut buf).unwrap();
    assert_eq!(i64::from_le_bytes(buf), 7);

    mm.decref(a).unwrap();
    mm.decref(b).unwrap();
    assert_eq!(mm.refcount(a).unwrap(), 1);
    assert_eq!(
        mm.decref(a).unwrap_err(),
        MemError::InvariantViolation(Violation::PermanentRelease)
    );
    assert!(mm.is_live(a));

    let c = mm.intern(PolicyKey::SMALL_INT, InternValue::Int(7)).unwrap();
    assert_eq!(c, a);
    mm.decref(c).unwrap();
}

#[test]
fn intern_out_of_policy() {
    let mm = MemoryManager::with_defaults();
    let a = mm.intern(PolicyKey::SMALL_INT, InternValue::Int(1000)).unwrap();
    let b = mm.intern(PolicyKey::SMALL_INT, InternValue::Int(1000)).unwrap();
    assert_ne!(a, b);
    assert_eq!(mm.refcount(a).unwrap(), 1);
    assert_eq!(mm.interned_count(), 0);
    mm.decref(a).unwrap();
    mm.decref(b).unwrap();
    assert_eq!(mm.live_objects(), 0);

    let e1 = mm.intern(PolicyKey::EMPTY_BYTES, InternValue::Bytes(b"")).unwrap();
    let e2 = mm.intern(PolicyKey::EMPTY_BYTES, InternValue::Bytes(&[])).unwrap();
    assert_eq!(e1, e2);
    assert_eq!(mm.payload_len(e1).unwrap(), 0);
    let full = mm.intern(PolicyKey::EMPTY_BYTES, InternValue::Bytes(b"abc")).unwrap();
    assert_ne!(full, e1);
    assert_eq!(mm.payload_len(full).unwrap(), 3);

    assert_eq!(
        mm.intern(PolicyKey(9), InternValue::Int(0)).unwrap_err(),
        MemError::UnknownPolicy(9)
    );
}

#[test]
fn custom_intern_policy() {
    let mm = MemoryManager::with_defaults();
    let key = mm.register_intern_policy(InternPolicy {
        name: "short_bytes".to_string(),
        type_tag: TypeTag::OPAQUE,
        admits: crate::Admission::MaxLen(4),
    });
    assert_eq!(key, PolicyKey(2));
    let a = mm.intern(key, InternValue::Bytes(b"abc")).unwrap();
    let b = mm.intern(key, InternValue::Bytes(b"abc")).unwrap();
    let c = mm.intern(key, InternValue::Bytes(b"abd")).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(mm.interned_count(), 2);
}

#[test]
fn memory_limit_surfaces_as_allocation_failure() {
    let mm = MemoryManager::new(Config::default().with_memory_limit(ARENA_SZ));
    let small = mm.alloc(TypeTag::OPAQUE, 16).unwrap();
    assert_eq!(
        mm.alloc(TypeTag::OPAQUE, 1 << 20).unwrap_err(),
        MemError::AllocationFailure { size: 1 << 20 }
    );
    assert_eq!(mm.live_objects(), 1);
    mm.decref(small).unwrap();
}

#[test]
fn oversized_payload() {
    let mm = MemoryManager::with_defaults();
    assert_eq!(
        mm.alloc(TypeTag::OPAQUE, usize::MAX).unwrap_err(),
        MemError::AllocationFailure { size: usize::MAX }
    );
}

#[test]
fn shutdown_reports_leaks() {
    let mm = MemoryManager::with_defaults();
    let a = mm.alloc_slots(1).unwrap();
    let b = mm.alloc_slots(1).unwrap();
    mm.set_slot(a, 0, Some(b)).unwrap();
    mm.set_slot(b, 0, Some(a)).unwrap();
    mm.decref(a).unwrap();
    mm.decref(b).unwrap();
    let _leaked = mm.alloc(TypeTag::OPAQUE, 8).unwrap();
    let _interned = mm.intern(PolicyKey::SMALL_INT, InternValue::Int(1)).unwrap();

    let report = mm.shutdown().unwrap();
    println!("{:?}", report);
    assert_eq!(report.collected, 2);
    // the leaked object plus the caller's reference to the interned one
    assert_eq!(report.live_objects, 2);
    assert_eq!(report.heap.blocks_allocated, 2);
}
