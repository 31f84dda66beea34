//! Marshalling closures onto a scheduler.
use crate::{
    error::{Error, Fault},
    future::{Core, Promise, Status, TypedPromise},
};
use parking_lot::Mutex;
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::debug;

type Invocation<T> = Box<dyn FnOnce() -> Result<T, Error> + Send>;

/// A fiber that runs a closure once, and settles with its result.
///
/// Scheduling a `Proxy` on a [`Scheduler`](crate::Scheduler) runs the closure
/// on whichever thread ticks that scheduler. This is how work is handed to a
/// scheduler owned by another thread: see
/// [`Scheduler::invoke`](crate::Scheduler::invoke).
pub struct Proxy<T> {
    core: Core,
    invocation: Mutex<Option<Invocation<T>>>,
    value: Mutex<Option<T>>,
}

impl<T: Send + 'static> Proxy<T> {
    /// Returns a proxy for a fallible closure.
    pub fn new(f: impl FnOnce() -> Result<T, Error> + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            core: Core::new(),
            invocation: Mutex::new(Some(Box::new(f))),
            value: Mutex::new(None),
        })
    }

    /// Returns a proxy for a closure that cannot fail.
    pub fn from_fn(f: impl FnOnce() -> T + Send + 'static) -> Arc<Self> {
        Self::new(move || Ok(f()))
    }

    /// Takes the closure's result out of the proxy.
    pub fn take(&self) -> Result<T, Fault> {
        self.core
            .read_fulfilled(|| self.value.lock().take())?
            .ok_or(Fault::NotFulfilled(Status::Fulfilled))
    }
}

impl<T: Send + 'static> Promise for Proxy<T> {
    fn core(&self) -> &Core {
        &self.core
    }

    fn resume(&self) -> Result<(), Fault> {
        self.core.resume_default()?;
        if self.core.status() != Status::Pending {
            return Ok(());
        }
        // Taken out first, so the lock is not held while it runs.
        let Some(invocation) = self.invocation.lock().take() else {
            return Ok(());
        };

        match panic::catch_unwind(AssertUnwindSafe(invocation)) {
            Ok(Ok(value)) => self.core.fulfill_with(|| *self.value.lock() = Some(value)),
            Ok(Err(error)) => self.core.throw(error),
            Err(payload) => {
                let error = Error::panicked(payload);
                debug!(%error, "proxied invocation panicked");
                self.core.throw(error)
            }
        }
    }
}

impl<T: Clone + Send + 'static> TypedPromise<T> for Proxy<T> {
    fn value(&self) -> Result<T, Fault> {
        self.core
            .read_fulfilled(|| self.value.lock().clone())?
            .ok_or(Fault::NotFulfilled(Status::Fulfilled))
    }
}

impl<T> fmt::Debug for Proxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("core", &self.core)
            .field("invoked", &self.invocation.lock().is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{util::trace_init, Scheduler};

    #[test]
    fn runs_once_on_the_ticking_thread() {
        let _trace = trace_init();
        let scheduler = Scheduler::new();
        let proxy = scheduler
            .invoke(|| std::thread::current().id())
            .expect("must schedule");
        assert_eq!(proxy.status(), Status::Pending);

        let tick = scheduler.tick();
        assert_eq!(tick.polled, 1);
        assert_eq!(tick.completed, 1);
        assert!(scheduler.is_empty());
        assert_eq!(proxy.value(), Ok(std::thread::current().id()));
        assert_eq!(proxy.take(), Ok(std::thread::current().id()));
        assert!(proxy.take().is_err());

        assert_eq!(scheduler.tick().polled, 0);
    }

    #[test]
    fn errors_settle_as_throw() {
        let _trace = trace_init();
        let scheduler = Scheduler::new();
        let proxy = scheduler
            .try_invoke(|| Err::<(), _>(Error::msg("nope")))
            .expect("must schedule");
        assert_eq!(
            scheduler.block_on(&proxy).unwrap_err().to_string(),
            "nope"
        );
        assert_eq!(proxy.status(), Status::Throw);
    }

    #[test]
    fn panics_are_caught() {
        let _trace = trace_init();
        let scheduler = Scheduler::new();
        let proxy = Proxy::<()>::from_fn(|| panic!("kaboom"));
        scheduler.schedule(&proxy).unwrap();
        scheduler.tick();

        assert_eq!(proxy.status(), Status::Throw);
        let error = proxy.error().unwrap();
        let panicked = error
            .downcast_ref::<crate::error::Panicked>()
            .expect("must be a caught panic");
        assert_eq!(panicked.to_string(), "invocation panicked: kaboom");
    }
}
