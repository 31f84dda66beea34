#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
pub(crate) mod util;

pub mod key;
pub mod ring;
mod slab;

pub(crate) mod loom;

#[doc(inline)]
pub use key::Key;
#[doc(inline)]
pub use ring::{Consumer, Corrupted, Full, Ring, Schedule};
