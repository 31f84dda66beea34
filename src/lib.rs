#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations)]

#[macro_use]
pub(crate) mod util;

pub mod agent;
pub mod composite;
pub mod coroutine;
pub mod error;
pub mod future;
pub mod observer;
pub mod proxy;
pub mod scheduler;
pub mod time;

#[doc(inline)]
pub use self::{
    agent::{Agent, AgentStatus, ThreadedAgent},
    composite::{wait_all, wait_any, wait_some, Collection, CompositeFuture},
    coroutine::{Coroutine, Cx},
    error::{Error, Fault},
    future::{Deferred, Promise, PromiseRef, Status, ToPromise, TypedPromise, Until},
    observer::{Observable, Observer, Subscription},
    proxy::Proxy,
    scheduler::Scheduler,
    time::Timeout,
};
