//! Generation-tagged slot references.
use crate::loom::atomic::{AtomicU64, Ordering};
use core::fmt;

mycelium_bitfield::bitfield! {
    /// A reference to a slot in a [`Ring`](crate::Ring).
    ///
    /// A `Key` packs the slot's index together with the slot's generation at
    /// the time the key was issued. Once the slot is released, its generation
    /// changes, and every key naming the old generation is *stale*.
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Key<u64> {
        /// The index of the slot in the ring's slab.
        const INDEX: u32;

        /// The slot's generation. Live generations are always odd.
        const GENERATION: u32;
    }
}

/// An atomic cell holding a [`Key`] (or [`Key::NIL`]).
#[repr(transparent)]
pub(crate) struct AtomicKey(AtomicU64);

// === impl Key ===

impl Key {
    /// The null link. No live slot is ever named by `NIL`.
    pub const NIL: Self = Self::from_bits(u64::MAX);

    pub(crate) fn pack(index: u32, generation: u32) -> Self {
        Self::new()
            .with(Self::INDEX, index)
            .with(Self::GENERATION, generation)
    }

    /// Returns the slot index this key refers to.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.get(Self::INDEX) as usize
    }

    /// Returns the slot generation this key was issued for.
    #[inline]
    #[must_use]
    pub fn generation(self) -> u32 {
        self.get(Self::GENERATION)
    }

    #[inline]
    #[must_use]
    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    /// Returns the packed representation of this key.
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn non_nil(self) -> Option<Self> {
        if self.is_nil() {
            None
        } else {
            Some(self)
        }
    }
}

// === impl AtomicKey ===

impl AtomicKey {
    pub(crate) fn nil() -> Self {
        Self(AtomicU64::new(Key::NIL.into_bits()))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> Key {
        Key::from_bits(self.0.load(order))
    }

    #[inline]
    pub(crate) fn store(&self, key: Key, order: Ordering) {
        self.0.store(key.into_bits(), order)
    }

    #[inline]
    pub(crate) fn swap(&self, key: Key, order: Ordering) -> Key {
        Key::from_bits(self.0.swap(key.into_bits(), order))
    }

    /// Compares and swaps, returning the value that was actually observed.
    ///
    /// The result is equal to `current` if and only if the swap happened.
    #[inline]
    pub(crate) fn compare_exchange(&self, current: Key, new: Key) -> Key {
        match self.0.compare_exchange(
            current.into_bits(),
            new.into_bits(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(bits) | Err(bits) => Key::from_bits(bits),
        }
    }
}

impl fmt::Debug for AtomicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrips_fields() {
        let key = Key::pack(7, 3);
        assert_eq!(key.index(), 7);
        assert_eq!(key.generation(), 3);
        assert!(!key.is_nil());
    }

    #[test]
    fn nil_is_not_a_slot() {
        assert!(Key::NIL.is_nil());
        assert_eq!(Key::NIL.index(), u32::MAX as usize);
        assert_eq!(Key::NIL.non_nil(), None);
    }

    #[test]
    fn key_is_valid_bitfield() {
        Key::assert_valid();
    }
}
