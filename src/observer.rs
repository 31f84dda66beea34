//! Bridges between futures and push-style observers.
//!
//! Any typed future is [`Observable`]: subscribing an [`Observer`] to it
//! delivers its value and completion once it fulfils, or its error if it
//! fails. A [`Collection`] delivers each of its futures' values as they
//! settle. Going the other way, an [`ObserverFuture`] is an observer that is
//! itself a future for the first value it observes, and
//! [`Observable::next`] subscribes one to a source.
use crate::{
    composite::Collection,
    error::{Error, Fault},
    future::{CallbackId, Core, Deferred, Promise, PromiseRef, Status, TypedPromise},
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::*},
        Arc, Weak,
    },
};

/// Receives the values of an [`Observable`].
pub trait Observer<T>: Send + Sync {
    fn on_next(&self, value: T);

    fn on_error(&self, error: Error);

    fn on_completed(&self);
}

/// A source of values that [`Observer`]s can subscribe to.
pub trait Observable<T: Send + 'static> {
    /// Subscribes `observer` to this source's values.
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Subscription;

    /// Calls `f` with each value this source produces, until `f` returns
    /// `false`.
    ///
    /// The returned future fulfils once `f` has stopped the iteration or the
    /// source has completed, and fails if the source fails.
    fn for_each(&self, f: impl FnMut(T) -> bool + Send + 'static) -> Arc<Deferred<()>>
    where
        Self: Sized,
    {
        let each = ForEach::new(f);
        let complete = each.complete();
        let subscription = self.subscribe(each);
        complete.core().on_complete(move |_| subscription.dispose());
        complete
    }

    /// Like [`for_each`](Self::for_each), but `f` returns a future for
    /// whether to go on.
    ///
    /// Each value waits for the future returned for the one before it to
    /// fulfil. The iteration stops when a future fulfils with `false`, and
    /// fails when one fails.
    fn for_each_async<P>(
        &self,
        f: impl FnMut(T) -> Arc<P> + Send + 'static,
    ) -> Arc<Deferred<()>>
    where
        Self: Sized,
        P: TypedPromise<bool>,
    {
        let each = AsyncForEach::new(f);
        let complete = each.complete();
        let subscription = self.subscribe(each);
        complete.core().on_complete(move |_| subscription.dispose());
        complete
    }

    /// Returns a future for the next value this source produces.
    ///
    /// The future unsubscribes once it settles. Later values need another
    /// call to `next`.
    fn next(&self) -> Arc<ObserverFuture<T>>
    where
        Self: Sized,
    {
        let future = ObserverFuture::new();
        let subscription = self.subscribe(future.clone());
        future.attach(subscription);
        future
    }
}

/// A handle to an observer's subscription.
///
/// Dropping a `Subscription` does *not* unsubscribe the observer; call
/// [`dispose`](Self::dispose).
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

/// An [`Observer`] that is a future for the first value it receives.
///
/// An error fails the future. Completion without any value leaves it
/// pending.
pub struct ObserverFuture<T> {
    core: Core,
    value: Mutex<Option<T>>,
    subscription: Mutex<Option<Subscription>>,
}

/// An [`Observer`] that passes each value to a callback, until the callback
/// returns `false`.
pub struct ForEach<T> {
    f: Mutex<Box<dyn FnMut(T) -> bool + Send>>,
    complete: Arc<Deferred<()>>,
}

/// An [`Observer`] that passes each value to a callback returning a future
/// for whether to go on.
pub struct AsyncForEach<T> {
    this: Weak<Self>,
    f: Mutex<Box<dyn FnMut(T) -> Arc<dyn TypedPromise<bool>> + Send>>,
    queue: Mutex<Queue<T>>,
    complete: Arc<Deferred<()>>,
}

struct Queue<T> {
    values: VecDeque<T>,
    /// Set while a value is being iterated.
    busy: bool,
    source_completed: bool,
}

struct Inner {
    disposed: AtomicBool,
    callbacks: Mutex<Vec<(PromiseRef, CallbackId)>>,
}

/// Checked by a delivery callback before it calls its observer.
pub(crate) struct Gate(Arc<Inner>);

// === impl Observable for futures ===

impl<T, P> Observable<T> for Arc<P>
where
    T: Send + 'static,
    P: TypedPromise<T>,
{
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Subscription {
        let subscription = Subscription::new();
        let gate = subscription.gate();
        let future = Arc::downgrade(self);
        let callback = self.core().on_complete(move |_| {
            if !gate.is_open() {
                return;
            }
            if let Some(future) = future.upgrade() {
                match future.value() {
                    Ok(value) => {
                        observer.on_next(value);
                        observer.on_completed();
                    }
                    Err(fault) => observer.on_error(failure(&*future, fault)),
                }
            }
        });
        if let Some(callback) = callback {
            subscription.track(self.clone(), callback);
        }
        subscription
    }
}

// === impl Observable for Collection ===

impl<T: Send + 'static> Observable<T> for Collection<T> {
    /// Delivers each future's value, or error, as it settles. The observer
    /// is completed once, after every future in the collection has settled.
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> Subscription {
        let subscription = Subscription::new();
        let members = self.members();
        if members.is_empty() {
            observer.on_completed();
            return subscription;
        }

        let remaining = Arc::new(AtomicUsize::new(members.len()));
        for member in members {
            let gate = subscription.gate();
            let observer = observer.clone();
            let remaining = remaining.clone();
            let future = Arc::downgrade(&member.typed);
            let callback = member.erased.core().on_complete(move |_| {
                if !gate.is_open() {
                    return;
                }
                if let Some(future) = future.upgrade() {
                    match future.value() {
                        Ok(value) => observer.on_next(value),
                        Err(fault) => observer.on_error(failure(&*future, fault)),
                    }
                }
                if remaining.fetch_sub(1, AcqRel) == 1 {
                    observer.on_completed();
                }
            });
            if let Some(callback) = callback {
                subscription.track(member.erased.clone(), callback);
            }
        }
        subscription
    }
}

fn failure<P: Promise + ?Sized>(future: &P, fault: Fault) -> Error {
    future.error().unwrap_or_else(|| fault.into())
}

// === impl Subscription ===

impl Subscription {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                disposed: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn gate(&self) -> Gate {
        Gate(self.inner.clone())
    }

    pub(crate) fn track(&self, future: PromiseRef, callback: CallbackId) {
        if self.is_disposed() {
            future.core().unsubscribe(callback);
            return;
        }
        self.inner.callbacks.lock().push((future, callback));
    }

    /// Unsubscribes the observer. Nothing is delivered to it afterwards.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, AcqRel) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for (future, callback) in callbacks {
            future.core().unsubscribe(callback);
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .field("callbacks", &self.inner.callbacks.lock().len())
            .finish()
    }
}

impl Gate {
    pub(crate) fn is_open(&self) -> bool {
        !self.0.disposed.load(Acquire)
    }
}

// === impl ObserverFuture ===

impl<T: Send + 'static> ObserverFuture<T> {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: Core::new(),
            value: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }

    /// Disposes `subscription` once this future settles.
    pub(crate) fn attach(&self, subscription: Subscription) {
        *self.subscription.lock() = Some(subscription);
        // The source may have delivered while subscribing.
        if self.core.status() != Status::Pending {
            self.release();
        }
    }

    fn release(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.dispose();
        }
    }
}

impl<T: Send + 'static> Observer<T> for ObserverFuture<T> {
    fn on_next(&self, value: T) {
        if self.core.status() == Status::Pending {
            // Later values lose to the first.
            let _ = self.core.fulfill_with(|| *self.value.lock() = Some(value));
        }
        self.release();
    }

    fn on_error(&self, error: Error) {
        if self.core.status() == Status::Pending {
            let _ = self.core.set_error(error);
        }
        self.release();
    }

    fn on_completed(&self) {}
}

impl<T: Send + 'static> Promise for ObserverFuture<T> {
    fn core(&self) -> &Core {
        &self.core
    }
}

impl<T: Clone + Send + 'static> TypedPromise<T> for ObserverFuture<T> {
    fn value(&self) -> Result<T, Fault> {
        self.core
            .read_fulfilled(|| self.value.lock().clone())?
            .ok_or(Fault::NotFulfilled(Status::Fulfilled))
    }
}

impl<T> fmt::Debug for ObserverFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverFuture")
            .field("core", &self.core)
            .finish()
    }
}

// === impl ForEach ===

impl<T: Send + 'static> ForEach<T> {
    pub fn new(f: impl FnMut(T) -> bool + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            f: Mutex::new(Box::new(f)),
            complete: Deferred::new(),
        })
    }

    /// Returns a future that settles when the iteration ends.
    #[must_use]
    pub fn complete(&self) -> Arc<Deferred<()>> {
        self.complete.clone()
    }
}

impl<T: Send + 'static> Observer<T> for ForEach<T> {
    fn on_next(&self, value: T) {
        if self.complete.status() != Status::Pending {
            return;
        }
        let mut f = self.f.lock();
        if !(&mut *f)(value) {
            drop(f);
            let _ = self.complete.fulfill(());
        }
    }

    fn on_error(&self, error: Error) {
        if self.complete.status() == Status::Pending {
            let _ = self.complete.fail(error);
        }
    }

    fn on_completed(&self) {
        if self.complete.status() == Status::Pending {
            let _ = self.complete.fulfill(());
        }
    }
}

impl<T> fmt::Debug for ForEach<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForEach")
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

// === impl AsyncForEach ===

impl<T: Send + 'static> AsyncForEach<T> {
    pub fn new<P>(mut f: impl FnMut(T) -> Arc<P> + Send + 'static) -> Arc<Self>
    where
        P: TypedPromise<bool>,
    {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            f: Mutex::new(Box::new(move |value: T| -> Arc<dyn TypedPromise<bool>> {
                f(value)
            })),
            queue: Mutex::new(Queue {
                values: VecDeque::new(),
                busy: false,
                source_completed: false,
            }),
            complete: Deferred::new(),
        })
    }

    /// Returns a future that settles when the iteration ends.
    #[must_use]
    pub fn complete(&self) -> Arc<Deferred<()>> {
        self.complete.clone()
    }

    /// Iterates queued values until one's future is still pending.
    fn drain(&self) {
        loop {
            let value = {
                let mut queue = self.queue.lock();
                match queue.values.pop_front() {
                    Some(value) if self.complete.status() == Status::Pending => value,
                    _ => {
                        queue.values.clear();
                        queue.busy = false;
                        if queue.source_completed {
                            drop(queue);
                            let _ = self.complete.fulfill(());
                        }
                        return;
                    }
                }
            };

            let proceed = (&mut *self.f.lock())(value);
            if proceed.status().is_complete() {
                if self.step(&*proceed) {
                    continue;
                }
                return;
            }

            let Some(this) = self.this.upgrade() else {
                return;
            };
            // Runs at once if `proceed` settled since it was checked.
            proceed.core().on_complete({
                let proceed = proceed.clone();
                move |_| {
                    if this.step(&*proceed) {
                        this.drain();
                    }
                }
            });
            return;
        }
    }

    /// Applies a settled iteration future, returning whether to go on.
    fn step(&self, proceed: &dyn TypedPromise<bool>) -> bool {
        match proceed.value() {
            Ok(true) => true,
            Ok(false) => {
                let _ = self.complete.fulfill(());
                false
            }
            Err(fault) => {
                let _ = self.complete.fail(failure(proceed, fault));
                false
            }
        }
    }
}

impl<T: Send + 'static> Observer<T> for AsyncForEach<T> {
    fn on_next(&self, value: T) {
        if self.complete.status() != Status::Pending {
            return;
        }
        {
            let mut queue = self.queue.lock();
            queue.values.push_back(value);
            if queue.busy {
                return;
            }
            queue.busy = true;
        }
        self.drain();
    }

    fn on_error(&self, error: Error) {
        if self.complete.status() == Status::Pending {
            let _ = self.complete.fail(error);
        }
    }

    fn on_completed(&self) {
        let mut queue = self.queue.lock();
        queue.source_completed = true;
        if queue.busy {
            return;
        }
        drop(queue);
        if self.complete.status() == Status::Pending {
            let _ = self.complete.fulfill(());
        }
    }
}

impl<T> fmt::Debug for AsyncForEach<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncForEach")
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
