//! Weak reference registry
//!
//! A weak reference names an object without keeping it alive. Weak refs
//! live in a slot table outside the managed heap and are indexed by target
//! address, so destroying an object finds and clears all of its weak refs
//! without scanning the table.
//!
//! A [WeakHandle] is an index plus a generation. Releasing a weak ref bumps
//! the slot generation, so stale handles resolve to nothing instead of
//! whatever reused the slot.

use std::cell::{Cell, RefCell};

use rustc_hash::FxHashMap;

use crate::{object::ObjectHandle, MemoryManager};

/// Called once when the target of a weak reference is destroyed
///
/// The target is already unreachable when this runs. The weak ref it was
/// attached to is passed in and already resolves to `None`.
pub type WeakCallback = Box<dyn FnOnce(&MemoryManager, WeakHandle)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakHandle {
    index: u32,
    gen: u32,
}

struct WeakSlot {
    gen: u32,
    in_use: bool,
    target: Option<ObjectHandle>,
    callback: Option<WeakCallback>,
}

pub(crate) struct WeakRegistry {
    slots: RefCell<Vec<WeakSlot>>,
    free: RefCell<Vec<u32>>,
    by_target: RefCell<FxHashMap<usize, Vec<WeakHandle>>>,
    live: Cell<usize>,
}

impl WeakRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            by_target: RefCell::new(FxHashMap::default()),
            live: Cell::new(0),
        }
    }

    pub(crate) fn create(&self, target: ObjectHandle, callback: Option<WeakCallback>) -> WeakHandle {
        let mut slots = self.slots.borrow_mut();
        let index = match self.free.borrow_mut().pop() {
            Some(i) => i,
            None => {
                slots.push(WeakSlot {
                    gen: 0,
                    in_use: false,
                    target: None,
                    callback: None,
                });
                (slots.len() - 1) as u32
            }
        };
        let slot = &mut slots[index as usize];
        debug_assert!(!slot.in_use);
        slot.in_use = true;
        slot.target = Some(target);
        slot.callback = callback;
        let weak = WeakHandle {
            index,
            gen: slot.gen,
        };

        self.by_target
            .borrow_mut()
            .entry(target.addr())
            .or_default()
            .push(weak);
        self.live.set(self.live.get() + 1);
        tracing::trace!(?weak, ?target, "weak ref created");
        weak
    }

    fn with_slot<R>(&self, weak: WeakHandle, f: impl FnOnce(&mut WeakSlot) -> R) -> Option<R> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(weak.index as usize)?;
        if !slot.in_use || slot.gen != weak.gen {
            return None;
        }
        Some(f(slot))
    }

    /// Current target, `None` once it was destroyed or the weak ref released
    pub(crate) fn resolve(&self, weak: WeakHandle) -> Option<ObjectHandle> {
        self.with_slot(weak, |slot| slot.target).flatten()
    }

    /// Drop a weak ref without running its callback
    ///
    /// Returns false for handles that were already released.
    pub(crate) fn release(&self, weak: WeakHandle) -> bool {
        let Some((target, callback)) =
            self.with_slot(weak, |slot| (slot.target.take(), slot.callback.take()))
        else {
            return false;
        };
        // dropped outside the borrow, the closure may own arbitrary state
        drop(callback);

        if let Some(target) = target {
            let mut by_target = self.by_target.borrow_mut();
            if let Some(list) = by_target.get_mut(&target.addr()) {
                list.retain(|w| *w != weak);
                if list.is_empty() {
                    by_target.remove(&target.addr());
                }
            }
        }

        {
            let mut slots = self.slots.borrow_mut();
            let slot = &mut slots[weak.index as usize];
            slot.in_use = false;
            slot.gen = slot.gen.wrapping_add(1);
        }
        self.free.borrow_mut().push(weak.index);
        self.live.set(self.live.get() - 1);
        true
    }

    /// Disconnect every weak ref to `target`
    ///
    /// Returns the callbacks to run, in the order the weak refs were
    /// created. The weak refs themselves stay allocated (resolving to
    /// `None`) until they are released.
    pub(crate) fn clear_target(&self, target: ObjectHandle) -> Vec<(WeakHandle, WeakCallback)> {
        let Some(weaks) = self.by_target.borrow_mut().remove(&target.addr()) else {
            return Vec::new();
        };
        let mut slots = self.slots.borrow_mut();
        let mut callbacks = Vec::new();
        for weak in weaks {
            let slot = &mut slots[weak.index as usize];
            if !slot.in_use || slot.gen != weak.gen {
                continue;
            }
            debug_assert_eq!(slot.target, Some(target));
            slot.target = None;
            if let Some(cb) = slot.callback.take() {
                callbacks.push((weak, cb));
            }
        }
        tracing::trace!(?target, callbacks = callbacks.len(), "weak refs cleared");
        callbacks
    }

    /// Number of weak refs currently pointing at `target`
    pub(crate) fn count(&self, target: ObjectHandle) -> usize {
        self.by_target
            .borrow()
            .get(&target.addr())
            .map_or(0, |list| list.len())
    }

    /// Allocated weak refs, including ones whose target is gone
    pub(crate) fn live(&self) -> usize {
        self.live.get()
    }
}
