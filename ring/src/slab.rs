//! The fixed-capacity slot arena backing a [`Ring`](crate::Ring).
//!
//! Free slots form a Treiber stack threaded through each slot's `free_next`
//! index. The stack head packs the top index with a modification tag, so a
//! pop that raced with a pop-then-push of the same slot fails its CAS instead
//! of installing a stale successor.
use crate::{
    key::{AtomicKey, Key},
    loom::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering::*},
        cell::UnsafeCell,
    },
    util::Backoff,
};
use alloc::{boxed::Box, vec::Vec};
use core::fmt;

pub(crate) struct Slab<T> {
    slots: Box<[Slot<T>]>,
    free: AtomicU64,
    len: AtomicUsize,
}

pub(crate) struct Slot<T> {
    /// The node scheduled after this one, or `NIL`.
    pub(crate) next: AtomicKey,

    /// The node scheduled before this one. `NIL` if and only if the node is
    /// not scheduled.
    pub(crate) prev: AtomicKey,

    /// Odd while the slot is occupied.
    generation: AtomicU32,

    free_next: AtomicU32,

    value: UnsafeCell<Option<T>>,
}

const NO_FREE: u32 = u32::MAX;

#[inline]
fn pack_head(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
fn unpack_head(head: u64) -> (u32, u32) {
    (head as u32, (head >> 32) as u32)
}

#[inline]
fn is_live(generation: u32) -> bool {
    generation & 1 == 1
}

// === impl Slab ===

impl<T> Slab<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "a slab must have at least one slot");
        assert!(
            capacity < NO_FREE as usize,
            "slab capacity must be less than {NO_FREE}"
        );

        let slots = (0..capacity)
            .map(|i| {
                let free_next = if i + 1 == capacity {
                    NO_FREE
                } else {
                    (i + 1) as u32
                };
                Slot {
                    next: AtomicKey::nil(),
                    prev: AtomicKey::nil(),
                    generation: AtomicU32::new(0),
                    free_next: AtomicU32::new(free_next),
                    value: UnsafeCell::new(None),
                }
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            free: AtomicU64::new(pack_head(0, 0)),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Acquire)
    }

    /// Returns the slot a key points at, without validating its generation.
    ///
    /// Link traversal goes through here; keys stored in links were live when
    /// they were written.
    #[inline]
    pub(crate) fn slot(&self, key: Key) -> &Slot<T> {
        &self.slots[key.index()]
    }

    /// Returns `true` if `key` names the current occupant of its slot.
    pub(crate) fn is_live(&self, key: Key) -> bool {
        self.slots
            .get(key.index())
            .map(|slot| slot.generation.load(Acquire) == key.generation())
            .unwrap_or(false)
    }

    /// Returns the key of the slot's current occupant, if there is one.
    pub(crate) fn occupant(&self, index: usize) -> Option<Key> {
        let generation = self.slots.get(index)?.generation.load(Acquire);
        if is_live(generation) {
            Some(Key::pack(index as u32, generation))
        } else {
            None
        }
    }

    /// Moves `value` into a free slot, returning it back if there is none.
    pub(crate) fn alloc(&self, value: T) -> Result<Key, T> {
        let mut boff = Backoff::new();
        let mut head = self.free.load(Acquire);
        let index = loop {
            let (index, tag) = unpack_head(head);
            if index == NO_FREE {
                return Err(value);
            }

            let next = self.slots[index as usize].free_next.load(Acquire);
            match self.free.compare_exchange_weak(
                head,
                pack_head(next, tag.wrapping_add(1)),
                AcqRel,
                Acquire,
            ) {
                Ok(_) => break index,
                Err(actual) => {
                    head = actual;
                    boff.spin();
                }
            }
        };

        // Popping the slot off the free stack gives this thread exclusive
        // access to it until its generation is published.
        let slot = &self.slots[index as usize];
        slot.value.with_mut(|v| unsafe {
            // Safety: the slot is free, so no consumer holds a reference to
            // its value, and no other producer can pop it.
            *v = Some(value);
        });
        slot.next.store(Key::NIL, Relaxed);
        slot.prev.store(Key::NIL, Relaxed);
        let generation = slot.generation.load(Relaxed).wrapping_add(1);
        debug_assert!(is_live(generation));
        slot.generation.store(generation, Release);
        self.len.fetch_add(1, Release);

        test_trace!(index, generation, "slab: alloc");
        Ok(Key::pack(index, generation))
    }

    /// Borrows the value stored under `key`.
    ///
    /// # Safety
    ///
    /// The caller must hold the ring's consumer lock, so that the slot cannot
    /// be released while the returned reference is live.
    pub(crate) unsafe fn get(&self, key: Key) -> Option<&T> {
        if !self.is_live(key) {
            return None;
        }
        self.slots[key.index()]
            .value
            .with(|v| unsafe { (*v).as_ref() })
    }

    /// Takes the value stored under `key` and returns its slot to the free
    /// stack.
    ///
    /// # Safety
    ///
    /// The caller must hold the ring's consumer lock exclusively, and the
    /// slot must not be scheduled.
    pub(crate) unsafe fn release(&self, key: Key) -> Option<T> {
        if !self.is_live(key) {
            return None;
        }

        let index = key.index() as u32;
        let slot = &self.slots[key.index()];
        let value = slot.value.with_mut(|v| unsafe { (*v).take() });
        slot.generation
            .store(key.generation().wrapping_add(1), Release);
        self.len.fetch_sub(1, Release);

        let mut head = self.free.load(Relaxed);
        loop {
            let (top, tag) = unpack_head(head);
            slot.free_next.store(top, Release);
            match self.free.compare_exchange_weak(
                head,
                pack_head(index, tag.wrapping_add(1)),
                AcqRel,
                Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        test_trace!(index, generation = key.generation(), "slab: release");
        value
    }
}

// Safety: values are only moved in by the producer that popped their slot
// and only moved out or borrowed by the single consumer.
unsafe impl<T: Send> Send for Slab<T> {}
unsafe impl<T: Send + Sync> Sync for Slab<T> {}

impl<T> fmt::Debug for Slab<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (free, tag) = unpack_head(self.free.load(Relaxed));
        f.debug_struct("Slab")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("free_head", &free)
            .field("free_tag", &tag)
            .finish()
    }
}
