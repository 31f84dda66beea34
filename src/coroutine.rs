//! Coroutine fibers.
//!
//! A [`Coroutine`] is a fiber whose body runs in quanta. Between quanta the
//! body is suspended, usually because it has *chained* onto another future
//! and is waiting for it to complete. The body is a [`Routine`]: either a
//! hand-written state machine driving a [`Frame`], or an `async` block
//! adapted by [`AsyncRoutine`] and given a [`Cx`] to wait with.
//!
//! # The suspension protocol
//!
//! A routine that needs the outcome of another future calls
//! [`Frame::chain`]. If that returns `true`, the routine records where to
//! continue in [`Frame::pc`] and returns [`Step::Pending`]: the coroutine
//! leaves its scheduler's ready ring, and is put back when the chained future
//! completes. When the routine runs again, it calls
//! [`Frame::check_exception`] before anything else, which re-raises a
//! cancellation of the coroutine itself, or the error the chained future
//! failed with.
//!
//! ```
//! use skein::{coroutine::{Frame, Routine, Step}, future::{Deferred, Promise}, Error, Scheduler};
//! use std::sync::Arc;
//!
//! // Waits for `input`, then doubles it.
//! struct Double {
//!     input: Arc<Deferred<u32>>,
//! }
//!
//! impl Routine for Double {
//!     type Output = u32;
//!
//!     fn resume(&mut self, frame: &mut Frame) -> Result<Step<u32>, Error> {
//!         if frame.pc == 0 {
//!             frame.pc = 1;
//!             if frame.chain(&self.input) {
//!                 return Ok(Step::Pending);
//!             }
//!         }
//!         frame.check_exception()?;
//!         Ok(Step::Done(self.input.with_value(|v| v * 2)?))
//!     }
//! }
//!
//! let scheduler = Scheduler::new();
//! let input = Deferred::new();
//! let double = skein::Coroutine::spawn(&scheduler, |_| Double { input: input.clone() }).unwrap();
//!
//! scheduler.tick();
//! assert!(!double.is_complete());
//!
//! input.fulfill(21).unwrap();
//! assert_eq!(scheduler.block_on(&double).unwrap(), 42);
//! ```
use crate::{
    error::{Error, Fault},
    future::{CallbackId, Core, Promise, PromiseRef, Status, ToPromise, TypedPromise},
    scheduler::{Scheduler, Shared},
};
use parking_lot::Mutex;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering::*},
        Arc, Weak,
    },
    task::{Context, Poll, Wake, Waker},
    time::{Duration, Instant},
};
use tracing::error;

/// The body of a [`Coroutine`].
pub trait Routine: Send + 'static {
    type Output: Send + 'static;

    /// Runs the body until it next suspends, yields, or finishes.
    fn resume(&mut self, frame: &mut Frame) -> Result<Step<Self::Output>, Error>;
}

/// What a [`Routine`] did when it was resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Run again on the next pass of the scheduler.
    Yield,
    /// Suspended until something wakes the coroutine, usually the completion
    /// of a chained future.
    Pending,
    /// Finished with a value.
    Done(T),
}

/// The resumable state of a [`Coroutine`] that its [`Routine`] drives.
pub struct Frame {
    /// The point the routine resumes from. Starts at 0.
    pub pc: u32,
    /// A bitmask of the error handling regions active at `pc`.
    pub epc: u64,
    link: Arc<Link>,
}

/// A fiber that runs a [`Routine`].
pub struct Coroutine<R: Routine> {
    core: Core,
    link: Arc<Link>,
    body: Mutex<Body<R>>,
    output: Mutex<Option<R::Output>>,
}

/// The context an `async` coroutine body suspends through.
#[derive(Clone)]
pub struct Cx {
    link: Arc<Link>,
}

/// Adapts a [`Future`] to a [`Routine`].
///
/// The future is polled with a waker that reschedules the coroutine.
pub struct AsyncRoutine<F> {
    future: Pin<Box<F>>,
}

/// Future returned by [`Cx::wait`].
#[must_use = "futures do nothing unless `.await`ed"]
pub struct Wait {
    link: Arc<Link>,
    target: PromiseRef,
    chained: bool,
}

/// Future returned by [`Cx::yield_now`].
#[must_use = "futures do nothing unless `.await`ed"]
pub struct YieldNow {
    link: Arc<Link>,
    yielded: bool,
}

/// Future returned by [`Cx::sleep`].
#[must_use = "futures do nothing unless `.await`ed"]
pub struct Sleep {
    link: Arc<Link>,
    /// `None` if the deadline lies past the last representable instant.
    deadline: Option<Instant>,
}

struct Body<R> {
    frame: Frame,
    routine: Option<R>,
}

/// The part of a coroutine that wakers and completion callbacks hold on to.
pub(crate) struct Link {
    fiber: Weak<dyn Promise>,
    scheduler: Weak<Shared>,
    /// Set whenever the coroutine is woken, and cleared before each resume.
    woken: AtomicBool,
    chained: Mutex<Option<Chained>>,
    /// An error raised on the coroutine that its body has yet to observe.
    pending: Mutex<Option<Error>>,
}

struct Chained {
    future: PromiseRef,
    callback: Option<CallbackId>,
}

// === impl Coroutine ===

impl<R: Routine> Coroutine<R> {
    /// Builds a coroutine from `make`, and schedules it on `scheduler`.
    ///
    /// `make` receives the [`Cx`] that an `async` body waits through.
    pub fn spawn(scheduler: &Scheduler, make: impl FnOnce(Cx) -> R) -> Result<Arc<Self>, Fault> {
        let this = Arc::new_cyclic(|this: &Weak<Self>| {
            let fiber: Weak<dyn Promise> = this.clone();
            let link = Arc::new(Link {
                fiber,
                scheduler: Arc::downgrade(&scheduler.0),
                woken: AtomicBool::new(false),
                chained: Mutex::new(None),
                pending: Mutex::new(None),
            });
            let routine = make(Cx { link: link.clone() });
            Self {
                core: Core::cancellable(),
                body: Mutex::new(Body {
                    frame: Frame {
                        pc: 0,
                        epc: 0,
                        link: link.clone(),
                    },
                    routine: Some(routine),
                }),
                link,
                output: Mutex::new(None),
            }
        });
        scheduler.schedule(&this)?;
        Ok(this)
    }

    /// Takes the coroutine's output, leaving it without a value.
    pub fn take(&self) -> Result<R::Output, Fault> {
        self.core
            .read_fulfilled(|| self.output.lock().take())?
            .ok_or(Fault::NotFulfilled(Status::Fulfilled))
    }

    fn suspend(&self) {
        if let Some(scheduler) = self.link.scheduler.upgrade() {
            Scheduler(scheduler).unschedule(self);
        }
        // A wake that raced with leaving the ring must not be lost.
        if self.link.woken.load(SeqCst) {
            self.link.reschedule();
        }
    }
}

impl<R: Routine> Promise for Coroutine<R> {
    fn core(&self) -> &Core {
        &self.core
    }

    fn resume(&self) -> Result<(), Fault> {
        let status = self.core.status();
        if status.is_terminal() {
            return Err(Fault::ResumedTerminal(status));
        }
        if let Some(error) = self.core.take_pending_throw() {
            *self.link.pending.lock() = Some(error);
        }
        if self.core.status() != Status::Pending {
            return Ok(());
        }
        self.link.woken.store(false, SeqCst);

        let mut body = self.body.lock();
        let step = {
            let Body { frame, routine } = &mut *body;
            match routine.as_mut() {
                Some(routine) => routine.resume(frame),
                None => return Ok(()),
            }
        };

        match step {
            Ok(Step::Yield) => Ok(()),
            Ok(Step::Pending) => {
                drop(body);
                self.suspend();
                Ok(())
            }
            Ok(Step::Done(value)) => {
                body.routine = None;
                drop(body);
                self.link.detach();
                self.core
                    .fulfill_with(|| *self.output.lock() = Some(value))
            }
            Err(error) => {
                body.routine = None;
                drop(body);
                self.link.detach();
                self.core.throw(error)
            }
        }
    }

    /// Cancels the coroutine.
    ///
    /// The future the coroutine is chained on is cancelled too, if it
    /// supports cancellation. The coroutine's body observes a
    /// [`Cancelled`](crate::error::Cancelled) error at its next resumption
    /// point.
    fn cancel(&self) -> Result<(), Fault> {
        if self.core.status().is_complete() {
            return Ok(());
        }
        if let Some(chained) = self.link.detach() {
            if chained.supports_cancellation() {
                chained.cancel()?;
            }
        }
        if self.core.interrupt(Error::cancelled()) {
            self.core.set_wakeup_time(None);
            self.link.reschedule();
        }
        Ok(())
    }
}

impl<R> TypedPromise<R::Output> for Coroutine<R>
where
    R: Routine,
    R::Output: Clone,
{
    fn value(&self) -> Result<R::Output, Fault> {
        self.core
            .read_fulfilled(|| self.output.lock().clone())?
            .ok_or(Fault::NotFulfilled(Status::Fulfilled))
    }
}

impl<R: Routine> fmt::Debug for Coroutine<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("core", &self.core)
            .field("routine", &std::any::type_name::<R>())
            .finish()
    }
}

// === impl Frame ===

impl Frame {
    /// Chains the coroutine onto `future`.
    ///
    /// Returns `false` if `future` is already complete, in which case the
    /// routine should carry on without suspending. Otherwise the coroutine
    /// is woken once `future` completes, and the routine should return
    /// [`Step::Pending`].
    pub fn chain(&self, future: &impl ToPromise) -> bool {
        self.link.chain(future.to_promise())
    }

    /// Re-raises an error the coroutine must handle before continuing.
    ///
    /// This is, in order, a cancellation of the coroutine itself, or the
    /// error the chained future failed with. A chained future whose error is
    /// re-raised here is marked [`Status::Handled`].
    pub fn check_exception(&self) -> Result<(), Error> {
        self.link.check()
    }

    /// Returns the future the coroutine is chained on.
    #[must_use]
    pub fn chained(&self) -> Option<PromiseRef> {
        self.link.chained.lock().as_ref().map(|c| c.future.clone())
    }

    /// Returns a waker that reschedules the coroutine.
    #[must_use]
    pub fn waker(&self) -> Waker {
        Waker::from(self.link.clone())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("pc", &self.pc)
            .field("epc", &format_args!("{:#b}", self.epc))
            .field("chained", &self.chained())
            .finish()
    }
}

// === impl Link ===

impl Link {
    fn chain(self: &Arc<Self>, future: PromiseRef) -> bool {
        let mut chained = self.chained.lock();
        if let Some(old) = chained.take() {
            old.unsubscribe();
        }
        let link = Arc::downgrade(self);
        let callback = future.core().subscribe(move |_| {
            if let Some(link) = link.upgrade() {
                link.reschedule();
            }
        });
        let suspended = callback.is_some();
        *chained = Some(Chained { future, callback });
        suspended
    }

    fn check(&self) -> Result<(), Error> {
        self.check_pending()?;

        let mut slot = self.chained.lock();
        let Some(chained) = slot.take() else {
            return Ok(());
        };
        let status = chained.future.status();
        match status {
            Status::Fulfilled => Ok(()),
            Status::Pending | Status::PendingThrow => {
                *slot = Some(chained);
                Ok(())
            }
            Status::Throw | Status::Handled => {
                if status == Status::Throw {
                    // Loses only to another observer handling it first.
                    let _ = chained.future.core().set_status(Status::Handled);
                }
                Err(chained
                    .future
                    .error()
                    .unwrap_or_else(|| Fault::NotFulfilled(status).into()))
            }
        }
    }

    fn check_pending(&self) -> Result<(), Error> {
        match self.pending.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn detach(&self) -> Option<PromiseRef> {
        let chained = self.chained.lock().take()?;
        chained.unsubscribe();
        Some(chained.future)
    }

    fn reschedule(&self) {
        self.woken.store(true, SeqCst);
        let (Some(fiber), Some(scheduler)) = (self.fiber.upgrade(), self.scheduler.upgrade())
        else {
            return;
        };
        if let Err(fault) = scheduler.schedule(&fiber) {
            error!(%fault, "failed to reschedule a woken coroutine");
        }
    }
}

impl Wake for Link {
    fn wake(self: Arc<Self>) {
        self.reschedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.reschedule();
    }
}

impl Chained {
    fn unsubscribe(&self) {
        if let Some(callback) = self.callback {
            self.future.core().unsubscribe(callback);
        }
    }
}

// === impl Cx ===

impl Cx {
    /// Waits for `future` to complete.
    ///
    /// Resolves to the error `future` failed with, marking it
    /// [`Status::Handled`], or to a cancellation of this coroutine.
    pub fn wait(&self, future: &impl ToPromise) -> Wait {
        Wait {
            link: self.link.clone(),
            target: future.to_promise(),
            chained: false,
        }
    }

    /// Waits for `future` to complete, then returns its value.
    pub fn value<T, P>(&self, future: &Arc<P>) -> impl Future<Output = Result<T, Error>> + Send
    where
        P: TypedPromise<T>,
        T: Send + 'static,
    {
        let wait = self.wait(future);
        let future = future.clone();
        async move {
            wait.await?;
            future.value().map_err(Error::from)
        }
    }

    /// Lets every other ready fiber on the scheduler run before continuing.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow {
            link: self.link.clone(),
            yielded: false,
        }
    }

    /// Suspends this coroutine for at least `duration`.
    ///
    /// The scheduler does not resume the coroutine before the deadline, but
    /// keeps running other fibers meanwhile. A `duration` too long to add to
    /// the current instant suspends the coroutine until it is cancelled.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            link: self.link.clone(),
            deadline: Instant::now().checked_add(duration),
        }
    }

    /// Returns the scheduler this coroutine runs on, if it still exists.
    #[must_use]
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.link.scheduler.upgrade().map(Scheduler)
    }

    /// Returns the coroutine this context belongs to.
    #[must_use]
    pub fn fiber(&self) -> Option<PromiseRef> {
        self.link.fiber.upgrade()
    }
}

impl fmt::Debug for Cx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx")
            .field("fiber", &self.fiber())
            .finish_non_exhaustive()
    }
}

// === impl AsyncRoutine ===

impl<F> AsyncRoutine<F> {
    pub fn new(future: F) -> Self {
        Self {
            future: Box::pin(future),
        }
    }
}

impl<F, T> Routine for AsyncRoutine<F>
where
    F: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn resume(&mut self, frame: &mut Frame) -> Result<Step<T>, Error> {
        let waker = frame.waker();
        let mut cx = Context::from_waker(&waker);
        match self.future.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(value)) => Ok(Step::Done(value)),
            Poll::Ready(Err(error)) => Err(error),
            Poll::Pending => Ok(Step::Pending),
        }
    }
}

impl<F> fmt::Debug for AsyncRoutine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRoutine")
            .field("future", &std::any::type_name::<F>())
            .finish()
    }
}

// === impl Wait ===

impl Future for Wait {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.chained {
            self.link.check_pending()?;
            self.chained = true;
            let target = self.target.clone();
            if self.link.chain(target) {
                return Poll::Pending;
            }
            return Poll::Ready(self.link.check());
        }

        if self.target.is_complete() {
            Poll::Ready(self.link.check())
        } else {
            // Woken without the target completing, so only a cancellation
            // can be waiting.
            self.link.check_pending()?;
            Poll::Pending
        }
    }
}

impl fmt::Debug for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("target", &self.target)
            .field("chained", &self.chained)
            .finish()
    }
}

// === impl YieldNow ===

impl Future for YieldNow {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.link.check_pending()?;
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

impl fmt::Debug for YieldNow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YieldNow")
            .field("yielded", &self.yielded)
            .finish()
    }
}

// === impl Sleep ===

impl Future for Sleep {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.link.check_pending()?;
        let Some(deadline) = self.deadline else {
            // Only cancellation wakes the coroutine again.
            return Poll::Pending;
        };
        if Instant::now() >= deadline {
            return Poll::Ready(Ok(()));
        }
        if let Some(fiber) = self.link.fiber.upgrade() {
            fiber.core().set_wakeup_time(Some(deadline));
        }
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests;
