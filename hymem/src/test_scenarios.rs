//! End-to-end runs through the public API, mixing refcounting, cycle
//! collection, weak references and interning the way a runtime would

use std::{cell::RefCell, rc::Rc};

use crate::{
    allocator::ARENA_SZ, Config, Generation, InternValue, MemError, MemoryManager, ObjectHandle,
    ObjectType, ObjectView, PolicyKey, TypeTag, Violation, WeakHandle, REF_SLOT_SZ,
};

/// Runtime-style object: an 8 byte tag followed by a reference slot array
struct Record;

impl Record {
    const SLOTS_AT: usize = 8;
}

impl ObjectType for Record {
    fn name(&self) -> &str {
        "record"
    }

    fn is_container(&self) -> bool {
        true
    }

    fn enumerate_owned(&self, obj: &ObjectView<'_>, out: &mut Vec<ObjectHandle>) {
        let mut offset = Record::SLOTS_AT;
        while offset < obj.len() {
            if let Some(r) = obj.ref_at(offset) {
                out.push(r);
            }
            offset += REF_SLOT_SZ;
        }
    }
}

fn record(mm: &MemoryManager, tag: TypeTag, id: u64, slots: usize) -> ObjectHandle {
    let obj = mm.alloc(tag, Record::SLOTS_AT + slots * REF_SLOT_SZ).unwrap();
    mm.write_bytes(obj, 0, &id.to_le_bytes()).unwrap();
    obj
}

fn record_id(mm: &MemoryManager, obj: ObjectHandle) -> u64 {
    let mut buf = [0; 8];
    mm.read_bytes(obj, 0, &mut buf).unwrap();
    u64::from_le_bytes(buf)
}

fn link(mm: &MemoryManager, from: ObjectHandle, slot: usize, to: ObjectHandle) {
    mm.store_ref(from, Record::SLOTS_AT + slot * REF_SLOT_SZ, Some(to))
        .unwrap();
}

#[test]
fn acyclic_release_needs_no_collector() {
    let mm = MemoryManager::with_defaults();
    let tag = mm.register_type(Box::new(Record));
    let a = record(&mm, tag, 1, 1);
    let b = record(&mm, tag, 2, 0);
    link(&mm, a, 0, b);
    mm.decref(b).unwrap();
    assert_eq!(mm.refcount(b).unwrap(), 1);

    let w = mm.weak_create(b, None).unwrap();
    mm.decref(a).unwrap();
    assert!(!mm.is_live(b));
    assert_eq!(mm.weak_resolve(w), None);
    assert_eq!(mm.stats().collections, [0, 0, 0]);
    assert_eq!(mm.heap_stats().blocks_allocated, 0);
}

#[test]
fn ring_of_records_is_collected() {
    let mm = MemoryManager::with_defaults();
    let tag = mm.register_type(Box::new(Record));
    const N: usize = 50;
    let ring: Vec<_> = (0..N).map(|i| record(&mm, tag, i as u64, 1)).collect();
    for i in 0..N {
        link(&mm, ring[i], 0, ring[(i + 1) % N]);
    }
    for r in &ring {
        mm.decref(*r).unwrap();
    }
    assert_eq!(mm.live_objects(), N);
    assert_eq!(mm.collect(Generation::All).unwrap(), N);
    assert_eq!(mm.live_objects(), 0);
}

#[test]
fn ring_with_one_outside_holder_survives_whole() {
    let mm = MemoryManager::with_defaults();
    let tag = mm.register_type(Box::new(Record));
    let ring: Vec<_> = (0..5).map(|i| record(&mm, tag, i, 2)).collect();
    for i in 0..5 {
        link(&mm, ring[i], 0, ring[(i + 1) % 5]);
    }
    let payload = mm.alloc(TypeTag::OPAQUE, 32).unwrap();
    link(&mm, ring[3], 1, payload);
    mm.decref(payload).unwrap();

    let holder = ring[2];
    for r in &ring {
        if *r != holder {
            mm.decref(*r).unwrap();
        }
    }
    assert_eq!(mm.collect(Generation::All).unwrap(), 0);
    for (i, r) in ring.iter().enumerate() {
        assert_eq!(record_id(&mm, *r), i as u64);
    }
    assert!(mm.is_live(payload));

    mm.decref(holder).unwrap();
    assert_eq!(mm.collect(Generation::All).unwrap(), 5);
    assert_eq!(mm.live_objects(), 0);
}

#[test]
fn churn_keeps_arena_count_flat() {
    let mm = MemoryManager::new(Config::default().with_thresholds(100, 10, 10));
    let tag = mm.register_type(Box::new(Record));
    let mut live = Vec::new();
    let mut peak_arenas = 0;
    for round in 0..50 {
        for i in 0..200u64 {
            let obj = if i % 3 == 0 {
                mm.alloc(TypeTag::OPAQUE, (i as usize % 5) * 40).unwrap()
            } else {
                record(&mm, tag, i, 1)
            };
            live.push(obj);
        }
        // some cycles, some plain garbage
        for pair in live.chunks(2) {
            if let [x, y] = pair {
                if mm.type_tag(*x).unwrap() == tag && mm.type_tag(*y).unwrap() == tag {
                    link(&mm, *x, 0, *y);
                    link(&mm, *y, 0, *x);
                }
            }
        }
        for obj in live.drain(..) {
            mm.decref(obj).unwrap();
        }
        mm.collect(Generation::All).unwrap();
        assert_eq!(mm.live_objects(), 0);

        let arenas = mm.heap_stats().arenas;
        if round == 0 {
            peak_arenas = arenas;
        }
        assert!(arenas <= peak_arenas, "round {round}: {arenas} arenas");
    }
    assert!(mm.heap_stats().arenas_created <= 2);
}

#[test]
fn automatic_trigger_and_disable() {
    let mm = MemoryManager::new(Config::default().with_thresholds(8, 10, 10));
    let tag = mm.register_type(Box::new(Record));
    let held: Vec<_> = (0..8).map(|i| record(&mm, tag, i, 0)).collect();
    assert_eq!(mm.stats().collections[0], 0);
    let ninth = record(&mm, tag, 8, 0);
    assert_eq!(mm.stats().collections[0], 1);

    mm.disable();
    for i in 0..100 {
        mm.decref(record(&mm, tag, i, 0)).unwrap();
        // left for the manager to clean up
        record(&mm, tag, i + 100, 0);
    }
    assert_eq!(mm.stats().collections[0], 1);
    assert!(mm.count()[0] >= 8);
    mm.collect(Generation::Gen0).unwrap();
    assert_eq!(mm.stats().collections[0], 2);
    assert_eq!(mm.count()[0], 0);

    for h in held {
        mm.decref(h).unwrap();
    }
    mm.decref(ninth).unwrap();
}

#[test]
fn interned_small_ints_are_shared() {
    let mm = MemoryManager::with_defaults();
    let tag = mm.register_type(Box::new(Record));
    let x = mm.intern(PolicyKey::SMALL_INT, InternValue::Int(42)).unwrap();
    let y = mm.intern(PolicyKey::SMALL_INT, InternValue::Int(42)).unwrap();
    assert_eq!(x, y);
    assert_eq!(mm.refcount(x).unwrap(), 3);

    // a cycle that references the interned value gives its reference back
    let a = record(&mm, tag, 1, 2);
    let b = record(&mm, tag, 2, 1);
    link(&mm, a, 0, b);
    link(&mm, b, 0, a);
    link(&mm, a, 1, x);
    assert_eq!(mm.refcount(x).unwrap(), 4);
    mm.decref(a).unwrap();
    mm.decref(b).unwrap();
    assert_eq!(mm.collect(Generation::All).unwrap(), 2);
    assert_eq!(mm.refcount(x).unwrap(), 3);

    mm.decref(x).unwrap();
    mm.decref(y).unwrap();
    assert!(mm.is_live(x));
    assert_eq!(
        mm.decref(x).unwrap_err(),
        MemError::InvariantViolation(Violation::PermanentRelease)
    );
}

#[test]
fn weak_callbacks_during_cycle_collection() {
    let mm = MemoryManager::with_defaults();
    let tag = mm.register_type(Box::new(Record));
    let ring: Vec<_> = (0..3).map(|i| record(&mm, tag, i, 1)).collect();
    for i in 0..3 {
        link(&mm, ring[i], 0, ring[(i + 1) % 3]);
    }

    let fired = Rc::new(RefCell::new(Vec::new()));
    // two weak refs on the last record, one on the first
    for (obj, label) in [(ring[2], "2a"), (ring[0], "0"), (ring[2], "2b")] {
        let fired = fired.clone();
        mm.weak_create(
            obj,
            Some(Box::new(move |_: &MemoryManager, _: WeakHandle| {
                fired.borrow_mut().push(label)
            })),
        )
        .unwrap();
    }
    for r in &ring {
        mm.decref(*r).unwrap();
    }
    assert_eq!(mm.collect(Generation::Gen0).unwrap(), 3);
    assert_eq!(*fired.borrow(), vec!["0", "2a", "2b"]);
}

#[test]
fn misuse_is_reported_not_followed() {
    let mm = MemoryManager::with_defaults();
    let obj = mm.alloc(TypeTag::OPAQUE, 8).unwrap();
    mm.decref(obj).unwrap();
    let stale = MemError::InvariantViolation(Violation::StaleHandle);
    assert_eq!(mm.decref(obj).unwrap_err(), stale);
    assert_eq!(mm.read_bytes(obj, 0, &mut [0; 8]).unwrap_err(), stale);
    assert_eq!(mm.weak_create(obj, None).unwrap_err(), stale);

    // give the arena back; the old handle must still be rejected
    assert_eq!(mm.reclaim_empty_arenas(), 1);
    assert_eq!(mm.heap_stats().reserved_bytes, 0);
    assert_eq!(mm.incref(obj).unwrap_err(), stale);
}

#[test]
fn allocation_failure_under_limit() {
    let mm = MemoryManager::new(Config::default().with_memory_limit(2 * ARENA_SZ));
    let mut held = Vec::new();
    let err = loop {
        match mm.alloc(TypeTag::OPAQUE, 400) {
            Ok(obj) => held.push(obj),
            Err(e) => break e,
        }
    };
    assert_eq!(err, MemError::AllocationFailure { size: 400 });
    assert_eq!(mm.heap_stats().arenas, 2);
    assert_eq!(mm.live_objects(), held.len());

    // freeing makes room again
    for obj in held.drain(..) {
        mm.decref(obj).unwrap();
    }
    assert!(mm.alloc(TypeTag::OPAQUE, 400).is_ok());
}
