//! Slot pools for heap objects and upvalues.
//!
//! A pool hands out shared handles while tracking every allocation in a
//! slot table. Allocation scans for the first unoccupied slot before
//! growing the table, so slot indices are reused as soon as an entry's
//! refcount reaches zero and the backing storage stays proportional to
//! the live set. Handles stay valid across pool growth.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Reference-counted slot pool.
pub struct Pool<T> {
    slots: Vec<Weak<RefCell<T>>>,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Pool { slots: Vec::new() }
    }

    /// Allocate into the first free slot, growing only when every slot
    /// is occupied. The returned handle keeps the entry alive; the slot
    /// frees itself when the last handle drops.
    pub fn alloc(&mut self, value: T) -> Rc<RefCell<T>> {
        let strong = Rc::new(RefCell::new(value));
        let weak = Rc::downgrade(&strong);
        match self.slots.iter().position(|slot| slot.strong_count() == 0) {
            Some(idx) => self.slots[idx] = weak,
            None => self.slots.push(weak),
        }
        strong
    }

    /// Number of slots currently holding a live entry.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    /// Total slots ever grown to, occupied or not.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether a slot is unoccupied and available for reuse.
    pub fn slot_is_free(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .map(|slot| slot.strong_count() == 0)
            .unwrap_or(true)
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Pool::new()
    }
}
