//! Time utilities.
//!
//! A [`Timer`] runs one-shot callbacks on a driver thread of its own. A
//! [`Timeout`] is a future that the timer fulfils once its duration has
//! elapsed.
pub mod timer;
mod timeout;

pub use self::{
    timeout::Timeout,
    timer::{global_timer, set_global_timer, AlreadyInitialized, Timer, TimerHandle},
};
pub use std::time::Duration;
