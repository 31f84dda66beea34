//! The cooperative dispatch loop.
//!
//! A [`Scheduler`] owns one ready [`Ring`] of fibers. Each [tick] walks the
//! ring from its current position, resuming each ready fiber for one quantum
//! and retiring the fibers that have completed. Fibers are scheduled from any
//! thread; only the thread that is ticking the scheduler resumes them.
//!
//! [tick]: Scheduler::tick
use crate::{
    coroutine::{AsyncRoutine, Coroutine, Cx},
    error::{Error, Fault},
    future::{Promise, PromiseRef, Status, ToPromise, TypedPromise},
    proxy::Proxy,
};
use parking_lot::{Condvar, Mutex};
use skein_ring::{Consumer, Key, Ring, Schedule};
use std::{
    fmt,
    future::Future,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::*},
        Arc, Weak,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, debug_span, error, trace, warn};

/// A handle to a cooperative fiber scheduler.
///
/// Cloning a `Scheduler` returns another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler(pub(crate) Arc<Shared>);

/// Configures a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct Builder {
    name: Option<String>,
    capacity: usize,
    tick_size: usize,
    sleep_threshold: Duration,
}

/// Metrics recorded during a scheduler tick.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct Tick {
    /// The total number of fibers resumed on this tick.
    pub polled: usize,

    /// The number of fibers retired on this tick because they completed.
    pub completed: usize,

    /// The number of retired fibers that had failed with an error nothing
    /// observed.
    ///
    /// This should always be <= `self.completed`.
    pub failed: usize,

    /// The number of times a sleeping fiber was passed over.
    pub sleeping: usize,

    /// How long until the earliest sleeping fiber passed over on this tick
    /// is due.
    pub next_wakeup: Option<Duration>,

    /// `true` if the tick finished with fibers still scheduled.
    pub has_remaining: bool,
}

/// The number of fibers a scheduler resumes per tick, by default.
pub const DEFAULT_TICK_SIZE: usize = 256;

/// The number of fibers a scheduler can hold, by default.
pub const DEFAULT_CAPACITY: usize = 4096;

/// A sleeping fiber due within this long does not park the scheduler's
/// thread, by default.
pub const DEFAULT_SLEEP_THRESHOLD: Duration = Duration::from_millis(5);

/// How long an idle loop waits before retrying when another thread holds the
/// ring.
const CONTENDED_RETRY: Duration = Duration::from_millis(1);

pub(crate) struct Shared {
    name: Option<String>,
    ring: Ring<PromiseRef>,
    event: Event,
    /// `true` while the loop thread is blocked on `event`.
    parked: AtomicBool,
    /// Bumped on every schedule, so that a loop about to park can tell it
    /// missed one.
    epoch: AtomicUsize,
    stopped: AtomicBool,
    tick_size: usize,
    sleep_threshold: Duration,
}

/// A fiber's binding to the scheduler that runs it.
#[derive(Debug)]
pub(crate) struct Membership {
    scheduler: Weak<Shared>,
    key: Key,
}

/// A manual-reset event.
struct Event {
    set: Mutex<bool>,
    cond: Condvar,
}

// === impl Scheduler ===

impl Scheduler {
    /// Returns a new scheduler with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Builder::new().build()
    }

    #[must_use]
    pub fn builder() -> Builder {
        Builder::new()
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    /// Schedules `fiber` to be resumed by this scheduler.
    ///
    /// The first time a fiber is scheduled, it is bound to this scheduler for
    /// the rest of its life. Scheduling a fiber that is already scheduled
    /// does nothing, and scheduling one that has completed and been retired
    /// is ignored.
    ///
    /// This may be called from any thread.
    ///
    /// # Errors
    ///
    /// - [`Fault::ForeignScheduler`] if `fiber` is bound to a different
    ///   scheduler.
    /// - [`Fault::RingFull`] if binding `fiber` needs a slot and none are free.
    pub fn schedule(&self, fiber: &impl ToPromise) -> Result<(), Fault> {
        self.0.schedule(&fiber.to_promise())
    }

    /// Removes `fiber` from the ready ring without releasing its binding.
    ///
    /// This must only be called on the thread ticking this scheduler.
    pub(crate) fn unschedule(&self, fiber: &dyn Promise) -> bool {
        match fiber.core().node.get() {
            Some(node) if node.is_bound_to(&self.0) => self.0.ring.unschedule(node.key),
            _ => false,
        }
    }

    /// Runs one scheduler tick, resuming up to the configured tick size worth
    /// of fibers.
    ///
    /// If another thread is already ticking this scheduler, this returns
    /// immediately without resuming anything.
    pub fn tick(&self) -> Tick {
        let shared = &*self.0;
        let Some(mut consumer) = shared.ring.try_consume() else {
            return Tick {
                has_remaining: shared.ring.current().is_some(),
                ..Tick::default()
            };
        };

        let _span = debug_span!("tick", scheduler = ?shared.name).entered();
        let mut tick = Tick::default();
        let mut first_sleeper = None;
        let mut next_wakeup: Option<Instant> = None;
        let mut skipped = 0;

        while tick.polled < shared.tick_size && skipped <= shared.ring.capacity() {
            let Some(key) = shared.ring.current() else {
                break;
            };

            // `current` is moved off unscheduled and retired members lazily.
            let fiber = match consumer.get(key) {
                Some(fiber) if shared.ring.is_scheduled(key) => fiber.clone(),
                _ => {
                    test_trace!(?key, "skipping unscheduled fiber");
                    shared.ring.advance(key);
                    skipped += 1;
                    continue;
                }
            };

            let status = fiber.status();
            if status.is_complete() {
                retire(&mut consumer, key, status, &mut tick);
                continue;
            }

            let core = fiber.core();
            if let Some(wakeup) = core.wakeup_time() {
                if wakeup > Instant::now() {
                    // Once every scheduled fiber turns out to be asleep, the
                    // rest of this tick would only spin.
                    if first_sleeper == Some(key) {
                        break;
                    }
                    first_sleeper.get_or_insert(key);
                    next_wakeup = Some(next_wakeup.map_or(wakeup, |next| next.min(wakeup)));
                    tick.sleeping += 1;
                    shared.ring.advance(key);
                    continue;
                }
                core.set_wakeup_time(None);
            }

            let span = debug_span!("poll", fiber.key = ?key, fiber.status = ?status);
            let result = span.in_scope(|| fiber.resume());
            tick.polled += 1;
            if let Err(fault) = result {
                error!(?key, %fault, "fiber faulted while resuming");
                // Fails only if the fault was resuming a terminal fiber, which
                // is retired just below.
                let _ = core.throw(fault.into());
            }

            let status = fiber.status();
            if status.is_complete() {
                retire(&mut consumer, key, status, &mut tick);
                continue;
            }

            // Nothing happens if the fiber moved `current` while running.
            shared.ring.advance(key);
        }

        tick.has_remaining = shared.ring.current().is_some();
        tick.next_wakeup = next_wakeup.map(|at| at.saturating_duration_since(Instant::now()));
        debug!(
            tick.polled,
            tick.completed,
            tick.failed,
            tick.sleeping,
            tick.has_remaining,
            "scheduler tick"
        );
        tick
    }

    /// Runs this scheduler on the current thread until [`shutdown`] is
    /// called.
    ///
    /// While no fiber is ready the thread blocks, waking when one is
    /// scheduled or when the earliest sleeping fiber is due.
    ///
    /// [`shutdown`]: Self::shutdown
    pub fn run(&self) {
        self.run_while(|| true);
    }

    /// Runs this scheduler on the current thread until `until` completes, or
    /// the scheduler is shut down.
    ///
    /// `until` does not need to be a fiber on this scheduler. If it completes
    /// on another thread, the loop is woken.
    pub fn run_until(&self, until: &dyn Promise) {
        if until.is_complete() {
            return;
        }
        let shared = Arc::downgrade(&self.0);
        let callback = until.core().subscribe(move |_| {
            if let Some(shared) = shared.upgrade() {
                shared.notify();
            }
        });
        self.run_while(|| !until.is_complete());
        if let Some(callback) = callback {
            until.core().unsubscribe(callback);
        }
    }

    /// Runs this scheduler on the current thread until `future` completes,
    /// and returns its outcome.
    ///
    /// # Errors
    ///
    /// The error `future` failed with. If the scheduler is shut down first,
    /// this is a [`Fault::NotFulfilled`].
    pub fn block_on<T, P>(&self, future: &Arc<P>) -> Result<T, Error>
    where
        P: TypedPromise<T>,
    {
        self.wait(&**future)?;
        future.value().map_err(Error::from)
    }

    /// Like [`block_on`](Self::block_on), for futures without a value.
    pub fn wait(&self, future: &dyn Promise) -> Result<(), Error> {
        self.run_until(future);
        match future.status() {
            Status::Fulfilled => Ok(()),
            status if status.is_aborted() => Err(future
                .error()
                .unwrap_or_else(|| Error::from(Fault::NotFulfilled(status)))),
            status => Err(Fault::NotFulfilled(status).into()),
        }
    }

    /// Spawns an `async` body as a coroutine fiber on this scheduler.
    ///
    /// The body receives a [`Cx`] through which it waits on other futures.
    pub fn spawn<F, Fut, T>(&self, body: F) -> Result<Arc<Coroutine<AsyncRoutine<Fut>>>, Fault>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        Coroutine::spawn(self, |cx| AsyncRoutine::new(body(cx)))
    }

    /// Runs `f` on this scheduler's thread, returning a future for its
    /// result.
    pub fn invoke<T, F>(&self, f: F) -> Result<Arc<Proxy<T>>, Fault>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.try_invoke(move || Ok(f()))
    }

    /// Like [`invoke`](Self::invoke), for a fallible `f`.
    pub fn try_invoke<T, F>(&self, f: F) -> Result<Arc<Proxy<T>>, Fault>
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let proxy = Proxy::new(f);
        self.schedule(&proxy)?;
        Ok(proxy)
    }

    /// Stops every running loop on this scheduler after its current tick.
    pub fn shutdown(&self) {
        if !self.0.stopped.swap(true, SeqCst) {
            debug!(scheduler = ?self.0.name, "scheduler shutting down");
        }
        self.0.notify();
        self.0.event.set();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.0.stopped.load(Acquire)
    }

    /// Returns the number of fibers bound to this scheduler that have not yet
    /// been retired.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.ring.is_empty()
    }

    fn run_while(&self, mut proceed: impl FnMut() -> bool) {
        let shared = &*self.0;
        while proceed() && !self.is_shutdown() {
            let epoch = shared.epoch.load(SeqCst);
            let tick = self.tick();
            if tick.did_work() || !proceed() {
                continue;
            }

            let timeout = match tick.next_wakeup {
                Some(due) if due <= shared.sleep_threshold => {
                    thread::yield_now();
                    continue;
                }
                Some(due) => Some(due.saturating_sub(shared.sleep_threshold)),
                None if tick.has_remaining => Some(CONTENDED_RETRY),
                None => None,
            };
            shared.park(epoch, timeout);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

fn retire(consumer: &mut Consumer<'_, PromiseRef>, key: Key, status: Status, tick: &mut Tick) {
    let Some(fiber) = consumer.remove(key) else {
        return;
    };
    tick.completed += 1;
    if status != Status::Throw {
        trace!(?key, ?status, "retired fiber");
        return;
    }

    match fiber.error() {
        Some(error) if error.is_cancelled() => debug!(?key, "retired cancelled fiber"),
        error if fiber.core().was_observed() => debug!(?key, ?error, "retired failed fiber"),
        error => {
            tick.failed += 1;
            warn!(?key, ?error, "fiber failed, and nothing observed its error");
        }
    }
}

// === impl Shared ===

impl Shared {
    pub(crate) fn schedule(self: &Arc<Self>, fiber: &PromiseRef) -> Result<(), Fault> {
        let key = match fiber.core().node.get() {
            Some(node) if node.is_bound_to(self) => node.key,
            Some(_) => return Err(Fault::ForeignScheduler),
            None => self.bind(fiber)?,
        };

        let scheduled = self.ring.schedule(key);
        trace!(?key, ?scheduled, "schedule");
        match scheduled {
            Schedule::Stale => return Ok(()),
            Schedule::Woke => {
                self.epoch.fetch_add(1, SeqCst);
                self.event.set();
            }
            Schedule::Linked | Schedule::AlreadyScheduled => self.notify(),
        }
        Ok(())
    }

    fn bind(self: &Arc<Self>, fiber: &PromiseRef) -> Result<Key, Fault> {
        let core = fiber.core();
        let _binding = core.bind_lock.lock();
        if let Some(node) = core.node.get() {
            return if node.is_bound_to(self) {
                Ok(node.key)
            } else {
                Err(Fault::ForeignScheduler)
            };
        }

        let key = self.ring.insert(fiber.clone()).map_err(|_| Fault::RingFull {
            capacity: self.ring.capacity(),
        })?;
        // Cannot already be set, since `bind_lock` is held.
        let _ = core.node.set(Membership {
            scheduler: Arc::downgrade(self),
            key,
        });
        trace!(?key, scheduler = ?self.name, "bound fiber");
        Ok(key)
    }

    /// Wakes the loop if it is parked.
    fn notify(&self) {
        self.epoch.fetch_add(1, SeqCst);
        if self.parked.load(SeqCst) {
            self.event.set();
        }
    }

    fn park(&self, epoch: usize, timeout: Option<Duration>) {
        self.event.reset();
        self.parked.store(true, SeqCst);
        // Anything scheduled since `epoch` was read either changed the epoch
        // already, or will see `parked` and set the event.
        if self.epoch.load(SeqCst) == epoch && !self.stopped.load(SeqCst) {
            test_trace!(?timeout, "parking");
            self.event.wait(timeout);
        }
        self.parked.store(false, SeqCst);
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("ring", &self.ring)
            .field("parked", &self.parked.load(Relaxed))
            .field("stopped", &self.stopped.load(Relaxed))
            .field("tick_size", &self.tick_size)
            .field("sleep_threshold", &self.sleep_threshold)
            .finish()
    }
}

// === impl Membership ===

impl Membership {
    fn is_bound_to(&self, shared: &Arc<Shared>) -> bool {
        ptr::eq(self.scheduler.as_ptr(), Arc::as_ptr(shared))
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduler
            .upgrade()
            .map(|shared| shared.ring.is_scheduled(self.key))
            .unwrap_or(false)
    }
}

// === impl Builder ===

impl Builder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            name: None,
            capacity: DEFAULT_CAPACITY,
            tick_size: DEFAULT_TICK_SIZE,
            sleep_threshold: DEFAULT_SLEEP_THRESHOLD,
        }
    }

    /// Names the scheduler. The name is recorded in its `tracing` spans.
    ///
    /// By default, schedulers are unnamed.
    #[must_use]
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the number of fibers the scheduler can hold at once.
    ///
    /// By default, this is [`DEFAULT_CAPACITY`].
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    #[must_use]
    pub fn capacity(self, capacity: usize) -> Self {
        assert!(capacity > 0, "a scheduler must have room for one fiber");
        Self { capacity, ..self }
    }

    /// Sets the maximum number of fibers resumed per [`Scheduler::tick`].
    ///
    /// By default, this is [`DEFAULT_TICK_SIZE`].
    ///
    /// # Panics
    ///
    /// If `tick_size` is zero.
    #[must_use]
    pub fn tick_size(self, tick_size: usize) -> Self {
        assert!(tick_size > 0, "a tick must resume at least one fiber");
        Self { tick_size, ..self }
    }

    /// Sets how soon a sleeping fiber must be due for the loop to keep its
    /// thread awake instead of parking it.
    ///
    /// By default, this is [`DEFAULT_SLEEP_THRESHOLD`].
    #[must_use]
    pub fn sleep_threshold(self, sleep_threshold: Duration) -> Self {
        Self {
            sleep_threshold,
            ..self
        }
    }

    #[must_use]
    pub fn build(self) -> Scheduler {
        Scheduler(Arc::new(Shared {
            name: self.name,
            ring: Ring::with_capacity(self.capacity),
            event: Event::new(),
            parked: AtomicBool::new(false),
            epoch: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            tick_size: self.tick_size,
            sleep_threshold: self.sleep_threshold,
        }))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Tick ===

impl Tick {
    /// Returns `true` if this tick resumed or retired any fibers.
    #[must_use]
    pub fn did_work(&self) -> bool {
        self.polled > 0 || self.completed > 0
    }
}

// === impl Event ===

impl Event {
    fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        *self.set.lock() = false;
    }

    fn wait(&self, timeout: Option<Duration>) {
        let mut set = self.set.lock();
        match timeout {
            None => {
                while !*set {
                    self.cond.wait(&mut set);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*set {
                    if self.cond.wait_until(&mut set, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
