//! A lock-free circular ready ring.
//!
//! A [`Ring`] holds its members in a fixed-capacity slab and links the
//! *scheduled* ones into a circular doubly-linked list. A `current` pointer
//! marks the next member to run. The ring follows these rules:
//!
//! - Any thread may [`schedule`](Ring::schedule) a member. A newly scheduled
//!   member is linked in just before `current`, so ready members run in FIFO
//!   order relative to the dispatch position.
//! - A member is scheduled exactly when its `prev` link is non-`NIL`.
//!   Claiming that link is the first step of scheduling, so scheduling an
//!   already-scheduled member is a no-op.
//! - [`unschedule`](Ring::unschedule) splices a member out, but leaves its
//!   `next` link behind. The dispatch loop uses that link to
//!   [`advance`](Ring::advance) past a member that has just removed itself.
//!   `current` is therefore updated lazily.
//! - Reading a member's value and releasing its slot requires the ring's
//!   [`Consumer`]. There is at most one consumer at a time.
//!
//! Concurrent unscheduling is only supported from the consumer's thread.
//! Scheduling may race with anything.
use crate::{
    key::{AtomicKey, Key},
    loom::{
        atomic::{AtomicBool, Ordering::*},
        hint,
    },
    slab::Slab,
    util::{Backoff, CachePadded},
};
use alloc::vec::Vec;
use core::fmt;

/// A lock-free circular ready ring over a fixed-capacity slab.
///
/// See the [module-level documentation](self) for details.
pub struct Ring<T> {
    current: CachePadded<AtomicKey>,
    has_consumer: CachePadded<AtomicBool>,
    slab: Slab<T>,
}

/// A handle that holds the exclusive right to read and release the values in
/// a [`Ring`].
///
/// Only one `Consumer` may exist for a ring at a time. It is released when
/// dropped.
#[must_use]
pub struct Consumer<'ring, T> {
    ring: &'ring Ring<T>,
}

/// The outcome of [`Ring::schedule`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// The ring was empty. The member is now `current`, and whoever drives
    /// the ring should be woken.
    Woke,
    /// The member was linked into a non-empty ring.
    Linked,
    /// The member was already scheduled.
    AlreadyScheduled,
    /// The key does not name a live member.
    Stale,
}

/// Error returned by [`Ring::insert`] when every slot is occupied.
#[derive(Debug, PartialEq, Eq)]
pub struct Full<T>(pub T);

/// An integrity violation found by [`Ring::validate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Corrupted {
    /// The walk reached a key that no longer names a live member.
    Stale(Key),
    /// The walk reached a member whose `prev` link is `NIL`.
    Unscheduled(Key),
    /// A member was reached twice before the walk returned to `current`.
    Duplicate(Key),
    /// `from.next` is `to`, but `to.prev` is not `from`.
    BrokenLink { from: Key, to: Key },
    /// Scheduled members exist that the walk from `current` never reached.
    Unreachable { scheduled: usize, reachable: usize },
}

const DEFAULT_CAPACITY: usize = 4096;

impl<T> Ring<T> {
    /// Returns a new ring with the default capacity of 4096 slots.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Returns a new ring able to hold `capacity` members.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero or not less than `u32::MAX`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            current: CachePadded(AtomicKey::nil()),
            has_consumer: CachePadded(AtomicBool::new(false)),
            slab: Slab::with_capacity(capacity),
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    /// Returns the number of members, scheduled or not.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves `value` into the ring as a new, unscheduled member.
    ///
    /// This may be called from any thread.
    pub fn insert(&self, value: T) -> Result<Key, Full<T>> {
        self.slab.alloc(value).map_err(Full)
    }

    /// Returns `true` if `key` names a live member of this ring.
    #[inline]
    #[must_use]
    pub fn contains(&self, key: Key) -> bool {
        self.slab.is_live(key)
    }

    /// Returns `true` if `key` names a live, scheduled member.
    #[must_use]
    pub fn is_scheduled(&self, key: Key) -> bool {
        self.contains(key) && !self.slab.slot(key).prev.load(SeqCst).is_nil()
    }

    /// Returns the member the dispatch loop should run next.
    ///
    /// The returned member may have unscheduled itself since it became
    /// current. Callers should check [`is_scheduled`](Self::is_scheduled)
    /// and [`advance`](Self::advance) past it if it is not.
    #[inline]
    #[must_use]
    pub fn current(&self) -> Option<Key> {
        self.current.load(SeqCst).non_nil()
    }

    /// Links `key` into the ring just before `current`.
    ///
    /// This is safe to call from any thread, concurrently with any other ring
    /// operation.
    ///
    /// # Panics
    ///
    /// If the ring's links are found in a state that no interleaving of ring
    /// operations can produce.
    pub fn schedule(&self, key: Key) -> Schedule {
        if !self.contains(key) {
            return Schedule::Stale;
        }
        let node = self.slab.slot(key);

        'top: loop {
            // An unscheduled member stays `current` until the consumer
            // advances past it. Its `next` link is still intact, so step
            // `current` off it before the links are rewritten below.
            if self.current.load(SeqCst) == key && node.prev.load(SeqCst).is_nil() {
                let next = node.next.load(SeqCst);
                self.current.compare_exchange(key, next);
                test_trace!(?key, ?next, "ring: stepped off stale current");
            }

            // Claim the node. Its `prev` link is only ever `NIL` while it is
            // unscheduled, so whoever swaps it away owns the insertion.
            let actual = node.prev.compare_exchange(Key::NIL, key);
            if !actual.is_nil() {
                return Schedule::AlreadyScheduled;
            }

            // The slot may have been released and reused between the
            // liveness check and the claim.
            if !self.contains(key) {
                node.prev.compare_exchange(key, Key::NIL);
                return Schedule::Stale;
            }

            let mut current;
            let mut target;
            'set_current: loop {
                // Assume the ring is empty: a lone node is its own neighbour.
                // Nothing links to this node yet, so this is safe to redo.
                node.next.store(key, SeqCst);
                node.prev.store(key, SeqCst);
                current = self.current.compare_exchange(Key::NIL, key);
                if current.is_nil() {
                    test_trace!(?key, "ring: woke");
                    return Schedule::Woke;
                }

                // Insert between `current` and its predecessor.
                target = self.slab.slot(current).prev.load(SeqCst);

                // The current node was unscheduled out from under us. Walk
                // `current` forward, or claim it if the ring emptied.
                while target.is_nil() {
                    let potential = self.slab.slot(current).next.load(SeqCst);
                    let actual = self.current.compare_exchange(current, potential);
                    current = if actual == current { potential } else { actual };
                    if current.is_nil() {
                        continue 'set_current;
                    }
                    target = self.slab.slot(current).prev.load(SeqCst);
                    hint::spin_loop();
                }

                loop {
                    // Nothing points at this node yet, so its own links can
                    // be written freely.
                    node.next.store(current, SeqCst);
                    node.prev.store(target, SeqCst);

                    let actual = self.slab.slot(current).prev.compare_exchange(target, key);
                    if actual.is_nil() {
                        // `current` was unscheduled while we were linking.
                        target = Key::NIL;
                        while target.is_nil() {
                            let potential = self.slab.slot(current).next.load(SeqCst);
                            let actual = self.current.compare_exchange(current, potential);
                            current = if actual == current { potential } else { actual };
                            if current.is_nil() {
                                continue 'set_current;
                            }
                            target = self.slab.slot(current).prev.load(SeqCst);
                            hint::spin_loop();
                        }
                        continue;
                    }
                    if actual != target {
                        // Another node was inserted before `current`, or
                        // `target` unscheduled itself. Try the new neighbour.
                        target = actual;
                        continue;
                    }

                    let target_node = self.slab.slot(target);
                    let mut expected = current;
                    loop {
                        let actual = target_node.next.compare_exchange(expected, key);
                        if actual == expected || actual == key || actual == target {
                            break;
                        }
                        if actual.is_nil() {
                            // `target` was the only member and left the ring.
                            // Release the claim and start over.
                            node.prev.store(Key::NIL, SeqCst);
                            continue 'top;
                        }
                        if actual == current || self.is_splicing(actual) {
                            // `actual` is being unscheduled from between
                            // `target` and `current`, and `current.prev`
                            // already skips it. Linking this node in its place
                            // completes that splice.
                            test_trace!(?key, ?target, ?actual, "ring: splice in progress");
                            expected = actual;
                            hint::spin_loop();
                            continue;
                        }
                        panic!(
                            "ring corrupted while scheduling {key:?}: expected \
                             {target:?}.next to be {current:?}, found {actual:?}"
                        );
                    }

                    test_trace!(?key, ?target, ?current, "ring: linked");
                    return Schedule::Linked;
                }
            }
        }
    }

    /// Splices `key` out of the ring.
    ///
    /// Returns `false` if the member was not scheduled. The member's `next`
    /// link is left in place so the dispatch loop can still advance past it.
    ///
    /// This must only be called from the thread that drives the ring.
    pub fn unschedule(&self, key: Key) -> bool {
        if !self.contains(key) {
            return false;
        }
        let node = self.slab.slot(key);

        let prev = node.prev.swap(Key::NIL, SeqCst);
        if prev.is_nil() {
            return false;
        }

        loop {
            let next = node.next.compare_exchange(key, Key::NIL);
            if next == key || next.is_nil() {
                // The node was the only member. `current` collapses to `NIL`
                // when the loop advances past it.
                test_trace!(?key, "ring: unscheduled last member");
                return true;
            }

            let actual = self.slab.slot(next).prev.compare_exchange(key, prev);
            if actual != key {
                // A node was scheduled between us and `next`.
                node.next.store(actual, SeqCst);
                continue;
            }

            self.slab.slot(prev).next.compare_exchange(key, next);
            test_trace!(?key, ?prev, ?next, "ring: unscheduled");
            return true;
        }
    }

    /// Returns `true` if `key` no longer names a scheduled member, so a link
    /// still pointing at it belongs to an unfinished `unschedule`.
    fn is_splicing(&self, key: Key) -> bool {
        !self.contains(key) || self.slab.slot(key).prev.load(SeqCst).is_nil()
    }

    /// Moves `current` from `from` to its successor.
    ///
    /// Nothing happens if `current` is no longer `from`. Returns the new
    /// value of `current`.
    pub fn advance(&self, from: Key) -> Option<Key> {
        let next = if self.contains(from) {
            self.slab.slot(from).next.load(SeqCst)
        } else {
            return self.recover(from);
        };
        let actual = self.current.compare_exchange(from, next);
        if actual == from {
            next.non_nil()
        } else {
            actual.non_nil()
        }
    }

    /// Moves `current` off a member whose slot is no longer live.
    ///
    /// A released slot's links cannot be trusted, so the new `current` is
    /// found by scanning the slab for any scheduled member.
    fn recover(&self, stale: Key) -> Option<Key> {
        let replacement = (0..self.capacity())
            .filter_map(|index| self.slab.occupant(index))
            .find(|&key| !self.slab.slot(key).prev.load(SeqCst).is_nil())
            .unwrap_or(Key::NIL);
        let actual = self.current.compare_exchange(stale, replacement);
        test_trace!(?stale, ?replacement, ?actual, "ring: recovered current");
        if actual == stale {
            replacement.non_nil()
        } else {
            actual.non_nil()
        }
    }

    /// Waits until the consumer lock is available and returns a [`Consumer`].
    pub fn consume(&self) -> Consumer<'_, T> {
        let mut boff = Backoff::new();
        while self
            .has_consumer
            .compare_exchange(false, true, AcqRel, Acquire)
            .is_err()
        {
            while self.has_consumer.load(Relaxed) {
                boff.spin();
            }
        }
        Consumer { ring: self }
    }

    /// Returns a [`Consumer`] if no other consumer exists.
    pub fn try_consume(&self) -> Option<Consumer<'_, T>> {
        self.has_consumer
            .compare_exchange(false, true, AcqRel, Acquire)
            .ok()
            .map(|_| Consumer { ring: self })
    }

    /// Walks the ring from `current` and checks that it is a well-formed
    /// cycle containing every scheduled member.
    ///
    /// Returns the members in dispatch order. The result is only meaningful
    /// while no other thread is modifying the ring.
    pub fn validate(&self) -> Result<Vec<Key>, Corrupted> {
        let scheduled = (0..self.capacity())
            .filter_map(|index| self.slab.occupant(index))
            .filter(|&key| !self.slab.slot(key).prev.load(SeqCst).is_nil())
            .count();

        let mut walk = Vec::with_capacity(scheduled);
        if let Some(start) = self.current() {
            let mut key = start;
            loop {
                if !self.contains(key) {
                    return Err(Corrupted::Stale(key));
                }
                if self.slab.slot(key).prev.load(SeqCst).is_nil() {
                    return Err(Corrupted::Unscheduled(key));
                }
                if walk.contains(&key) {
                    return Err(Corrupted::Duplicate(key));
                }
                walk.push(key);

                let next = self.slab.slot(key).next.load(SeqCst);
                if next.is_nil() || !self.contains(next) {
                    return Err(Corrupted::Stale(next));
                }
                if self.slab.slot(next).prev.load(SeqCst) != key {
                    return Err(Corrupted::BrokenLink {
                        from: key,
                        to: next,
                    });
                }
                if next == start {
                    break;
                }
                key = next;
            }
        }

        if walk.len() != scheduled {
            return Err(Corrupted::Unreachable {
                scheduled,
                reachable: walk.len(),
            });
        }
        Ok(walk)
    }
}

impl<T> Default for Ring<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("current", &self.current)
            .field("has_consumer", &self.has_consumer.load(Acquire))
            .field("slab", &self.slab)
            .finish()
    }
}

// === impl Consumer ===

impl<T> Consumer<'_, T> {
    /// Borrows the value of the member named by `key`, if it is live.
    #[must_use]
    pub fn get(&self, key: Key) -> Option<&T> {
        // Safety: holding the consumer lock means no slot can be released
        // while the returned borrow of `self` is live.
        unsafe { self.ring.slab.get(key) }
    }

    /// Removes the member named by `key` and returns its value.
    ///
    /// The member is unscheduled first if it is still scheduled. Its slot is
    /// released, so `key` and every copy of it become stale.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        if !self.ring.contains(key) {
            return None;
        }
        self.ring.unschedule(key);
        if self.ring.current.load(SeqCst) == key {
            self.ring.advance(key);
        }
        // Safety: `&mut self` guarantees no borrow from `get` is live, and
        // the member was unscheduled above.
        unsafe { self.ring.slab.release(key) }
    }

    /// Returns the ring this consumer reads from.
    #[inline]
    #[must_use]
    pub fn ring(&self) -> &Ring<T> {
        self.ring
    }
}

impl<T> Drop for Consumer<'_, T> {
    fn drop(&mut self) {
        self.ring.has_consumer.store(false, Release);
    }
}

impl<T> fmt::Debug for Consumer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("ring", &format_args!("{:p}", self.ring))
            .finish()
    }
}

// === impl Full ===

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ring is full")
    }
}

// === impl Corrupted ===

impl fmt::Display for Corrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale(key) => write!(f, "walk reached stale key {key:?}"),
            Self::Unscheduled(key) => write!(f, "walk reached unscheduled member {key:?}"),
            Self::Duplicate(key) => write!(f, "member {key:?} reached twice"),
            Self::BrokenLink { from, to } => {
                write!(f, "{from:?}.next is {to:?}, but {to:?}.prev is not {from:?}")
            }
            Self::Unreachable {
                scheduled,
                reachable,
            } => write!(
                f,
                "{scheduled} members are scheduled, but only {reachable} are reachable"
            ),
        }
    }
}
