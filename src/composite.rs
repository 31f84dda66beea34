//! Futures over sets of futures.
//!
//! A [`CompositeFuture`] fulfils when a [`Compositor`] predicate over its
//! constituents holds. The two usual predicates are [`wait_any`] and
//! [`wait_all`]. When a constituent fails, its error is merged into an
//! [`Aggregate`](crate::error::Aggregate) on the composite, and the
//! constituent is marked [`Status::Handled`].
//!
//! A [`Collection`] is an ordered list of futures that all produce the same
//! type of value.
use crate::{
    error::Error,
    future::{CallbackId, Core, Deferred, Promise, PromiseRef, Status, TypedPromise},
    observer::{Observer, Subscription},
};
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{Arc, Weak},
};

/// A predicate over the constituents of a [`CompositeFuture`].
pub type Compositor = Arc<dyn Fn(&[PromiseRef]) -> bool + Send + Sync>;

/// Holds once any constituent is fulfilled.
#[must_use]
pub fn wait_any() -> Compositor {
    Arc::new(|futures| futures.iter().any(|f| f.status() == Status::Fulfilled))
}

/// Holds once every constituent is fulfilled.
#[must_use]
pub fn wait_all() -> Compositor {
    Arc::new(|futures| futures.iter().all(|f| f.status() == Status::Fulfilled))
}

/// Holds once at least `needed` constituents are fulfilled.
#[must_use]
pub fn wait_some(needed: usize) -> Compositor {
    Arc::new(move |futures| {
        futures
            .iter()
            .filter(|f| f.status() == Status::Fulfilled)
            .count()
            >= needed
    })
}

/// A future that fulfils when its [`Compositor`] holds over its constituent
/// futures.
///
/// A composite with no constituents fulfils immediately.
pub struct CompositeFuture {
    core: Core,
    this: Weak<Self>,
    compositor: Compositor,
    constituents: RwLock<Constituents>,
}

/// An ordered list of futures producing values of type `T`.
pub struct Collection<T> {
    members: Vec<Member<T>>,
}

pub(crate) struct Member<T> {
    pub(crate) typed: Arc<dyn TypedPromise<T>>,
    pub(crate) erased: PromiseRef,
}

#[derive(Default)]
struct Constituents {
    futures: Vec<PromiseRef>,
    callbacks: Vec<Option<CallbackId>>,
}

// === impl CompositeFuture ===

impl CompositeFuture {
    pub fn new(futures: impl IntoIterator<Item = PromiseRef>, compositor: Compositor) -> Arc<Self> {
        let this = Arc::new_cyclic(|this| Self {
            core: Core::new(),
            this: this.clone(),
            compositor,
            constituents: RwLock::new(Constituents::default()),
        });

        let mut settled = Vec::new();
        {
            let mut constituents = this.constituents.write();
            for future in futures {
                let composite = this.this.clone();
                let callback = future.core().subscribe(move |constituent| {
                    if let Some(composite) = composite.upgrade() {
                        composite.check_future(constituent);
                    }
                });
                if callback.is_none() {
                    settled.push(future.clone());
                }
                constituents.futures.push(future);
                constituents.callbacks.push(callback);
            }
        }

        for future in settled {
            this.check_future(future.core());
        }
        this.check_fulfilled(&this.constituents.read());
        this
    }

    /// Returns a composite that fulfils once any of `futures` is fulfilled.
    pub fn any(futures: impl IntoIterator<Item = PromiseRef>) -> Arc<Self> {
        Self::new(futures, wait_any())
    }

    /// Returns a composite that fulfils once all of `futures` are fulfilled.
    pub fn all(futures: impl IntoIterator<Item = PromiseRef>) -> Arc<Self> {
        Self::new(futures, wait_all())
    }

    /// Removes every constituent that is no longer pending, and re-arms the
    /// composite unless the remaining constituents already satisfy it.
    ///
    /// This lets the same composite be waited on repeatedly, for instance to
    /// handle each of a set of futures as it completes.
    ///
    /// This must not be called from a completion callback of the composite
    /// or of its constituents.
    pub fn reset(&self) {
        let mut constituents = self.constituents.write();
        self.reset_locked(&mut constituents);
    }

    /// Returns the fulfilled constituents and [resets](Self::reset) the
    /// composite, as one atomic step.
    pub fn get_fulfilled_and_reset(&self) -> Vec<PromiseRef> {
        let mut constituents = self.constituents.write();
        let fulfilled = constituents
            .futures
            .iter()
            .filter(|f| f.status() == Status::Fulfilled)
            .cloned()
            .collect();
        self.reset_locked(&mut constituents);
        fulfilled
    }

    /// Returns the constituent futures.
    #[must_use]
    pub fn futures(&self) -> Vec<PromiseRef> {
        self.constituents.read().futures.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.constituents.read().futures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers each constituent to `observer` as it completes, successfully
    /// or not.
    ///
    /// `observer` is completed once the composite fulfils, or receives the
    /// composite's aggregate error if it fails.
    pub fn subscribe_each(&self, observer: Arc<dyn Observer<PromiseRef>>) -> Subscription {
        let subscription = Subscription::new();
        for future in self.futures() {
            let constituent = Arc::downgrade(&future);
            let gate = subscription.gate();
            let observer = observer.clone();
            let callback = future.core().on_complete(move |_| {
                if !gate.is_open() {
                    return;
                }
                if let Some(constituent) = constituent.upgrade() {
                    observer.on_next(constituent);
                }
            });
            if let Some(callback) = callback {
                subscription.track(future, callback);
            }
        }

        let gate = subscription.gate();
        let callback = self.core.on_complete(move |core| {
            if !gate.is_open() {
                return;
            }
            match core.status() {
                Status::Fulfilled => observer.on_completed(),
                _ => {
                    let error = core.error().unwrap_or_else(|| Error::msg("composite failed"));
                    observer.on_error(error);
                }
            }
        });
        if let (Some(callback), Some(this)) = (callback, self.this.upgrade()) {
            subscription.track(this, callback);
        }
        subscription
    }

    fn check_future(&self, constituent: &Core) {
        // Recursive, since a completion callback run under this lock may
        // complete another constituent.
        let constituents = self.constituents.read_recursive();
        if self.core.status() == Status::Fulfilled {
            return;
        }

        let status = constituent.status();
        if status.is_aborted() {
            if let Some(error) = constituent.error() {
                // Fails only if something already handled the composite.
                let _ = self.core.throw_with(|existing| match existing {
                    Some(existing) => Error::aggregate([existing, error]),
                    None => Error::aggregate([error]),
                });
                test_trace!(?status, "merged constituent error");
                // Loses only to another observer handling it first.
                let _ = constituent.set_status(Status::Handled);
            }
        }

        self.check_fulfilled(&constituents);
    }

    fn check_fulfilled(&self, constituents: &Constituents) -> bool {
        if self.core.error().is_some() {
            return false;
        }
        if constituents.futures.is_empty() || (self.compositor)(&constituents.futures) {
            self.core.try_fulfill();
            return true;
        }
        false
    }

    fn reset_locked(&self, constituents: &mut Constituents) {
        let Constituents { futures, callbacks } = constituents;
        let mut kept = Constituents::default();
        for (future, callback) in futures.drain(..).zip(callbacks.drain(..)) {
            if future.status() == Status::Pending {
                kept.futures.push(future);
                kept.callbacks.push(callback);
            } else if let Some(callback) = callback {
                future.core().unsubscribe(callback);
            }
        }
        *constituents = kept;

        // Clears the aggregate error along with the status.
        self.core.reset();
        if self.check_fulfilled(constituents) {
            test_trace!(
                remaining = constituents.futures.len(),
                "composite reset while satisfied"
            );
        }
    }
}

impl Promise for CompositeFuture {
    fn core(&self) -> &Core {
        &self.core
    }
}

impl fmt::Debug for CompositeFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeFuture")
            .field("core", &self.core)
            .field("futures", &self.constituents.read().futures)
            .finish()
    }
}

// === impl Collection ===

impl<T: Send + 'static> Collection<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    /// Appends `future` to the collection.
    pub fn push<P: TypedPromise<T>>(&mut self, future: Arc<P>) {
        self.members.push(Member {
            typed: future.clone(),
            erased: future,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns the futures in the order they were pushed.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TypedPromise<T>>> + '_ {
        self.members.iter().map(|m| &m.typed)
    }

    /// Returns a future for every value in the collection, in order.
    ///
    /// The returned future fails with an
    /// [`Aggregate`](crate::error::Aggregate) error if any of the
    /// collection's futures fail.
    pub fn to_vec(&self) -> Arc<Deferred<Vec<T>>> {
        let all = CompositeFuture::all(self.members.iter().map(|m| m.erased.clone()));
        let result = Deferred::new();
        let typed = self.members.iter().map(|m| m.typed.clone()).collect::<Vec<_>>();

        let out = result.clone();
        // The callback keeps the composite alive until it completes.
        let composite = all.clone();
        all.core().on_complete(move |core| {
            let _composite = composite;
            let settled = match core.status() {
                Status::Fulfilled => typed
                    .iter()
                    .map(|f| f.value())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(Error::from),
                _ => Err(core.error().unwrap_or_else(|| Error::msg("collection failed"))),
            };
            // `out` is only settled here.
            let _ = match settled {
                Ok(values) => out.fulfill(values),
                Err(error) => out.fail(error),
            };
        });
        result
    }

    pub(crate) fn members(&self) -> &[Member<T>] {
        &self.members
    }
}

impl<T: Send + 'static> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static, P: TypedPromise<T>> FromIterator<Arc<P>> for Collection<T> {
    fn from_iter<I: IntoIterator<Item = Arc<P>>>(iter: I) -> Self {
        let mut collection = Self::new();
        for future in iter {
            collection.push(future);
        }
        collection
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.members.iter().map(|m| &m.erased))
            .finish()
    }
}
