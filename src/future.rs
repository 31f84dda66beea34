//! The future state machine.
//!
//! Every future in this crate owns a [`Core`]: its [`Status`], the error it
//! failed with, the callbacks to run once it completes, and its membership in
//! a [`Scheduler`](crate::Scheduler)'s ready ring if it runs as a fiber.
//! Types that embed a `Core` implement [`Promise`], and the ones that produce
//! a value also implement [`TypedPromise`].
//!
//! # Status transitions
//!
//! ```text
//!                   set_error                 chained observer
//!      Pending ───────────────────► Throw ─────────────────────► Handled
//!       │  ▲  ╲                       ▲
//!       │  │   ╲ set_pending_throw    │ unhandled when resumed
//!       │  │    ╲                     │
//!       │  │     ►  PendingThrow ─────┘
//!       │  └────────────┘ taken by the fiber body
//!       ▼
//!   Fulfilled
//! ```
//!
//! `Fulfilled` and `Handled` are *terminal*: once a future reaches either,
//! every further attempt to change its status or error is a
//! [`Fault::Terminal`]. Entering `Fulfilled` or `Throw` fires the future's
//! completion callbacks. They fire exactly once per entry, after the status
//! lock is released, on the thread that caused the transition.
use crate::{
    error::{Error, Fault},
    scheduler::Membership,
};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt, mem,
    sync::{Arc, OnceLock, Weak},
    time::Instant,
};

mod until;

pub use self::until::Until;

/// The status of a future.
///
/// The numeric values order the statuses: negative values are *aborted*.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Status {
    /// Not yet complete.
    Pending = 0,
    /// Complete, with a value if the future produces one.
    Fulfilled = 1,
    /// An error has been raised, but the fiber it was raised in has not yet
    /// had a chance to handle it.
    PendingThrow = -3,
    /// Failed with an error that nobody has handled.
    Throw = -2,
    /// Failed with an error that a chained future has observed.
    Handled = -1,
}

/// A callback run when a future completes. It receives the completed
/// future's [`Core`].
pub type Callback = Box<dyn FnOnce(&Core) + Send + Sync + 'static>;

/// A handler registered with an event source by [`Deferred::from_event`].
///
/// Sources tell handlers apart with [`Arc::ptr_eq`].
pub type EventHandler<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

/// Identifies a registered completion callback, for
/// [`Core::unsubscribe`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// The shared state of a future.
pub struct Core {
    state: RwLock<State>,
    cancellable: bool,
    wakeup_time: Mutex<Option<Instant>>,
    pub(crate) node: OnceLock<Membership>,
    pub(crate) bind_lock: Mutex<()>,
}

struct State {
    status: Status,
    error: Option<Error>,
    callbacks: Vec<(CallbackId, Callback)>,
    next_callback: u64,
    /// Set if a callback ran for the latest completion.
    observed: bool,
}

/// A future: something that will eventually settle to [`Status::Fulfilled`]
/// or fail with an [`Error`].
///
/// A `Promise` that is scheduled on a [`Scheduler`](crate::Scheduler) is a
/// *fiber*. The scheduler calls [`resume`](Self::resume) each time the fiber
/// reaches the front of the ready ring, until it completes.
pub trait Promise: Send + Sync + 'static {
    fn core(&self) -> &Core;

    /// Runs one quantum of this future's work.
    ///
    /// The default implementation does no work. It promotes an unhandled
    /// [`Status::PendingThrow`] to [`Status::Throw`], and faults if the
    /// future is already terminal.
    fn resume(&self) -> Result<(), Fault> {
        self.core().resume_default()
    }

    /// Attempts to cancel this future.
    ///
    /// Cancelling a future that is not pending does nothing. Cancelling a
    /// future that does not [support
    /// cancellation](Self::supports_cancellation) is a
    /// [`Fault::NotCancellable`].
    fn cancel(&self) -> Result<(), Fault> {
        self.core().cancel()
    }

    #[inline]
    fn status(&self) -> Status {
        self.core().status()
    }

    #[inline]
    fn error(&self) -> Option<Error> {
        self.core().error()
    }

    #[inline]
    fn is_complete(&self) -> bool {
        self.status().is_complete()
    }

    #[inline]
    fn supports_cancellation(&self) -> bool {
        self.core().supports_cancellation()
    }
}

/// A shared, type-erased reference to a future.
pub type PromiseRef = Arc<dyn Promise>;

/// A future that produces a value of type `T`.
pub trait TypedPromise<T>: Promise {
    /// Returns the future's value.
    ///
    /// This is a [`Fault::NotFulfilled`] unless the future is
    /// [`Status::Fulfilled`].
    fn value(&self) -> Result<T, Fault>;
}

/// Conversion into a type-erased [`PromiseRef`].
pub trait ToPromise {
    fn to_promise(&self) -> PromiseRef;
}

/// A future that is settled explicitly, by calling [`fulfill`] or [`fail`].
///
/// `Deferred<()>` is the plain, valueless future.
///
/// [`fulfill`]: Deferred::fulfill
/// [`fail`]: Deferred::fail
pub struct Deferred<T> {
    core: Core,
    value: Mutex<Option<T>>,
}

/// Returns a future that is already fulfilled.
#[must_use]
pub fn fulfilled() -> Arc<Deferred<()>> {
    Deferred::fulfilled(())
}

// === impl Status ===

impl Status {
    /// Returns `true` for the failed statuses.
    #[inline]
    #[must_use]
    pub fn is_aborted(self) -> bool {
        (self as i8) < 0
    }

    /// Returns `true` for the statuses that can never change again.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Handled)
    }

    /// Returns `true` once the future has settled, successfully or not.
    #[inline]
    #[must_use]
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Throw | Self::Handled)
    }

    fn fires_completion(self) -> bool {
        matches!(self, Self::Fulfilled | Self::Throw)
    }
}

// === impl Core ===

impl Core {
    /// Returns a new pending core for a future that cannot be cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cancellation(false)
    }

    /// Returns a new pending core for a future that can be cancelled.
    #[must_use]
    pub fn cancellable() -> Self {
        Self::with_cancellation(true)
    }

    fn with_cancellation(cancellable: bool) -> Self {
        Self {
            state: RwLock::new(State {
                status: Status::Pending,
                error: None,
                callbacks: Vec::new(),
                next_callback: 0,
                observed: false,
            }),
            cancellable,
            wakeup_time: Mutex::new(None),
            node: OnceLock::new(),
            bind_lock: Mutex::new(()),
        }
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> Status {
        self.state.read().status
    }

    /// Returns the error this future failed with.
    ///
    /// A [`Status::Handled`] future still returns its original error.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.state.read().error.clone()
    }

    #[inline]
    #[must_use]
    pub fn supports_cancellation(&self) -> bool {
        self.cancellable
    }

    /// Sets the status.
    ///
    /// Entering [`Status::Fulfilled`] or [`Status::Throw`] from any other
    /// status fires the completion callbacks.
    pub fn set_status(&self, status: Status) -> Result<(), Fault> {
        self.update(|state| {
            state.check_mutable()?;
            state.status = status;
            Ok(())
        })
    }

    /// Fails this future with `error`.
    ///
    /// Unless the status is [`Status::PendingThrow`], this also transitions
    /// to [`Status::Throw`].
    pub fn set_error(&self, error: Error) -> Result<(), Fault> {
        self.update(|state| {
            state.check_mutable()?;
            state.error = Some(error);
            if state.status != Status::PendingThrow {
                state.status = Status::Throw;
            }
            Ok(())
        })
    }

    /// Raises `error` without completing the future, so that the fiber it
    /// belongs to can handle it when next resumed.
    pub fn set_pending_throw(&self, error: Error) -> Result<(), Fault> {
        self.update(|state| {
            state.check_mutable()?;
            state.error = Some(error);
            state.status = Status::PendingThrow;
            Ok(())
        })
    }

    /// Registers `callback` to run when this future completes.
    ///
    /// Returns `None`, dropping `callback` without running it, if the future
    /// is already complete.
    pub fn subscribe(
        &self,
        callback: impl FnOnce(&Core) + Send + Sync + 'static,
    ) -> Option<CallbackId> {
        let mut state = self.state.write();
        if state.status.is_complete() {
            return None;
        }
        let id = CallbackId(state.next_callback);
        state.next_callback += 1;
        state.callbacks.push((id, Box::new(callback)));
        Some(id)
    }

    /// Registers `callback` to run when this future completes, or runs it
    /// immediately if the future already has.
    pub fn on_complete(
        &self,
        callback: impl FnOnce(&Core) + Send + Sync + 'static,
    ) -> Option<CallbackId> {
        let mut state = self.state.write();
        if state.status.is_complete() {
            state.observed = true;
            drop(state);
            callback(self);
            return None;
        }
        let id = CallbackId(state.next_callback);
        state.next_callback += 1;
        state.callbacks.push((id, Box::new(callback)));
        Some(id)
    }

    /// Removes a callback registered by [`subscribe`](Self::subscribe) or
    /// [`on_complete`](Self::on_complete).
    ///
    /// Returns `false` if the callback already ran or was removed.
    pub fn unsubscribe(&self, id: CallbackId) -> bool {
        let mut state = self.state.write();
        let before = state.callbacks.len();
        state.callbacks.retain(|(cb, _)| *cb != id);
        state.callbacks.len() != before
    }

    /// Returns `true` if a completion callback ran when this future last
    /// completed, or has run since.
    #[must_use]
    pub fn was_observed(&self) -> bool {
        self.state.read().observed
    }

    /// The time before which a scheduler should not resume this fiber.
    #[must_use]
    pub fn wakeup_time(&self) -> Option<Instant> {
        *self.wakeup_time.lock()
    }

    pub fn set_wakeup_time(&self, at: Option<Instant>) {
        *self.wakeup_time.lock() = at;
    }

    /// Returns `true` if this future is linked into a scheduler's ready ring.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.node.get().map(Membership::is_scheduled).unwrap_or(false)
    }

    pub(crate) fn cancel(&self) -> Result<(), Fault> {
        if !self.cancellable {
            return Err(Fault::NotCancellable);
        }
        self.update(|state| {
            if state.status == Status::Pending {
                state.error = Some(Error::cancelled());
                state.status = Status::Throw;
            }
            Ok(())
        })
    }

    pub(crate) fn resume_default(&self) -> Result<(), Fault> {
        self.update(|state| match state.status {
            status if status.is_terminal() => Err(Fault::ResumedTerminal(status)),
            Status::PendingThrow => {
                state.status = Status::Throw;
                Ok(())
            }
            _ => Ok(()),
        })
    }

    /// Runs `store` and fulfils this future, in one critical section.
    pub(crate) fn fulfill_with(&self, store: impl FnOnce()) -> Result<(), Fault> {
        self.update(|state| {
            state.check_mutable()?;
            store();
            state.status = Status::Fulfilled;
            Ok(())
        })
    }

    /// Fulfils this future unless it is already complete. Returns `true` if
    /// this call fulfilled it.
    pub(crate) fn try_fulfill(&self) -> bool {
        self.update(|state| {
            if state.status.is_complete() {
                return Ok(false);
            }
            state.status = Status::Fulfilled;
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Fails this future with `error`, even if an error is pending.
    pub(crate) fn throw(&self, error: Error) -> Result<(), Fault> {
        self.update(|state| {
            state.check_mutable()?;
            state.error = Some(error);
            state.status = Status::Throw;
            Ok(())
        })
    }

    /// Fails this future with the error `merge` derives from its current
    /// one, in one critical section.
    pub(crate) fn throw_with(
        &self,
        merge: impl FnOnce(Option<Error>) -> Error,
    ) -> Result<(), Fault> {
        self.update(|state| {
            state.check_mutable()?;
            state.error = Some(merge(state.error.take()));
            state.status = Status::Throw;
            Ok(())
        })
    }

    /// Raises `error` as a pending throw, only if this future is still
    /// [`Status::Pending`]. Returns `true` if it was raised.
    pub(crate) fn interrupt(&self, error: Error) -> bool {
        let mut state = self.state.write();
        if state.status != Status::Pending {
            return false;
        }
        state.error = Some(error);
        state.status = Status::PendingThrow;
        true
    }

    /// Takes a pending error so the fiber body can handle it.
    pub(crate) fn take_pending_throw(&self) -> Option<Error> {
        let mut state = self.state.write();
        if state.status != Status::PendingThrow {
            return None;
        }
        state.status = Status::Pending;
        state.error.take()
    }

    /// Returns this future to [`Status::Pending`], bypassing terminal
    /// immutability. Only composites re-arm themselves this way.
    pub(crate) fn reset(&self) {
        let mut state = self.state.write();
        state.status = Status::Pending;
        state.error = None;
    }

    /// Runs `f` while holding the status read lock, if this future is
    /// fulfilled.
    pub(crate) fn read_fulfilled<R>(&self, f: impl FnOnce() -> R) -> Result<R, Fault> {
        let state = self.state.read();
        match state.status {
            Status::Fulfilled => Ok(f()),
            status => Err(Fault::NotFulfilled(status)),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut State) -> Result<R, Fault>) -> Result<R, Fault> {
        let mut state = self.state.write();
        let before = state.status;
        let result = f(&mut state)?;
        let after = state.status;
        if after == before || !after.fires_completion() {
            return Ok(result);
        }

        let callbacks = mem::take(&mut state.callbacks);
        state.observed = !callbacks.is_empty();
        drop(state);

        test_trace!(?before, ?after, callbacks = callbacks.len(), "future completed");
        for (_, callback) in callbacks {
            callback(self);
        }
        Ok(result)
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Core")
            .field("status", &state.status)
            .field("error", &state.error)
            .field("callbacks", &state.callbacks.len())
            .field("cancellable", &self.cancellable)
            .field("node", &self.node.get())
            .finish()
    }
}

// === impl State ===

impl State {
    fn check_mutable(&self) -> Result<(), Fault> {
        if self.status.is_terminal() {
            return Err(Fault::Terminal(self.status));
        }
        Ok(())
    }
}

// === impl dyn Promise ===

impl fmt::Debug for dyn Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("status", &self.status())
            .field("node", &self.core().node.get())
            .finish()
    }
}

// === impl ToPromise ===

impl<P: Promise> ToPromise for Arc<P> {
    fn to_promise(&self) -> PromiseRef {
        self.clone()
    }
}

impl ToPromise for PromiseRef {
    fn to_promise(&self) -> PromiseRef {
        self.clone()
    }
}

// === impl Deferred ===

impl<T: Send + 'static> Deferred<T> {
    /// Returns a new pending future that cannot be cancelled.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_core(Core::new()))
    }

    /// Returns a new pending future that can be cancelled.
    #[must_use]
    pub fn cancellable() -> Arc<Self> {
        Arc::new(Self::with_core(Core::cancellable()))
    }

    #[must_use]
    pub fn fulfilled(value: T) -> Arc<Self> {
        let mut this = Self::with_core(Core::new());
        *this.value.get_mut() = Some(value);
        this.core.state.write().status = Status::Fulfilled;
        Arc::new(this)
    }

    #[must_use]
    pub fn failed(error: Error) -> Arc<Self> {
        let this = Self::with_core(Core::new());
        {
            let mut state = this.core.state.write();
            state.status = Status::Throw;
            state.error = Some(error);
        }
        Arc::new(this)
    }

    /// Returns a future fulfilled by the next event a source raises.
    ///
    /// `add` registers a handler with the source. The first time the handler
    /// is called, it passes itself to `remove` and then fulfils the future
    /// with the event. Later calls do nothing.
    pub fn from_event<A, R>(add: A, remove: R) -> Arc<Self>
    where
        A: FnOnce(EventHandler<T>),
        R: FnOnce(&EventHandler<T>) + Send + 'static,
    {
        let this = Self::new();
        let remove = Mutex::new(Some(remove));
        let itself = Arc::new(Mutex::new(None::<Weak<dyn Fn(T) + Send + Sync>>));
        let handler: EventHandler<T> = {
            let this = this.clone();
            let itself = itself.clone();
            Arc::new(move |event: T| {
                let Some(remove) = remove.lock().take() else {
                    return;
                };
                let handler = itself.lock().as_ref().and_then(Weak::upgrade);
                if let Some(handler) = handler {
                    remove(&handler);
                }
                // Fails only if the future was settled some other way.
                let _ = this.fulfill(event);
            })
        };
        *itself.lock() = Some(Arc::downgrade(&handler));
        add(handler);
        this
    }

    fn with_core(core: Core) -> Self {
        Self {
            core,
            value: Mutex::new(None),
        }
    }

    /// Stores `value` and fulfils this future.
    pub fn fulfill(&self, value: T) -> Result<(), Fault> {
        self.core.fulfill_with(|| *self.value.lock() = Some(value))
    }

    /// Fails this future with `error`.
    pub fn fail(&self, error: Error) -> Result<(), Fault> {
        self.core.set_error(error)
    }

    /// Borrows the value, if this future is fulfilled.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, Fault> {
        self.core
            .read_fulfilled(|| self.value.lock().as_ref().map(f))?
            .ok_or(Fault::NotFulfilled(Status::Fulfilled))
    }
}

impl<T: Send + 'static> Promise for Deferred<T> {
    fn core(&self) -> &Core {
        &self.core
    }
}

impl<T: Clone + Send + 'static> TypedPromise<T> for Deferred<T> {
    fn value(&self) -> Result<T, Fault> {
        self.with_value(T::clone)
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("core", &self.core)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}
