//! A one-shot timer service.
//!
//! Each [`Timer`] owns a driver thread, which sleeps until the earliest armed
//! deadline and then runs that deadline's callback. Arming and cancelling are
//! done from any thread, under the same lock the driver takes to fire: for
//! every armed callback, exactly one of firing it and
//! [cancelling](TimerHandle::cancel) it succeeds.
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt, io,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, trace};

mod global;

pub use self::global::{global_timer, set_global_timer, AlreadyInitialized};

type Callback = Box<dyn FnOnce() + Send>;

/// Cancelled deadlines the heap may hold beyond twice the armed count before
/// it is compacted.
const COMPACT_SLACK: usize = 64;

/// A one-shot timer service.
///
/// Dropping a `Timer` stops its driver thread. Callbacks still armed at that
/// point never run.
pub struct Timer {
    shared: Arc<Shared>,
    driver: Option<JoinHandle<()>>,
}

/// A handle to a callback armed with [`Timer::after`].
#[derive(Debug)]
#[must_use = "dropping a `TimerHandle` does not cancel its callback"]
pub struct TimerHandle {
    shared: Weak<Shared>,
    id: u64,
    deadline: Option<Instant>,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    armed: HashMap<u64, Callback>,
    next_id: u64,
    shutdown: bool,
}

// === impl Timer ===

impl Timer {
    /// Starts a new timer.
    ///
    /// # Panics
    ///
    /// If the OS fails to spawn the driver thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Shared::new();
        let driver = {
            let shared = shared.clone();
            thread::spawn(move || shared.drive())
        };
        Self {
            shared,
            driver: Some(driver),
        }
    }

    /// Starts a new timer whose driver thread is called `name`.
    pub fn named(name: impl Into<String>) -> io::Result<Self> {
        let shared = Shared::new();
        let driver = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(name.into())
                .spawn(move || shared.drive())?
        };
        Ok(Self {
            shared,
            driver: Some(driver),
        })
    }

    /// Arms `callback` to run on the driver thread once `duration` has
    /// elapsed.
    ///
    /// A `duration` too long to add to the current instant never elapses.
    /// Its callback stays armed until cancelled, but never runs.
    pub fn after(
        &self,
        duration: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let deadline = Instant::now().checked_add(duration);
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.armed.insert(id, Box::new(callback));
        let Some(deadline) = deadline else {
            drop(state);
            trace!(id, ?duration, "timer armed without a deadline");
            return TimerHandle {
                shared: Arc::downgrade(&self.shared),
                id,
                deadline: None,
            };
        };
        state.deadlines.push(Reverse((deadline, id)));

        // Only a new earliest deadline changes how long the driver sleeps.
        let earliest = state
            .deadlines
            .peek()
            .map_or(true, |Reverse((_, first))| *first == id);
        drop(state);
        if earliest {
            self.shared.cond.notify_one();
        }

        trace!(id, ?duration, "timer armed");
        TimerHandle {
            shared: Arc::downgrade(&self.shared),
            id,
            deadline: Some(deadline),
        }
    }

    /// Returns the number of callbacks that are armed and have not yet run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().armed.len()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(driver) = self.driver.take() {
            // A callback that drops the last handle to its own timer cannot
            // wait for itself to return.
            if driver.thread().id() != thread::current().id() {
                let _ = driver.join();
            }
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Timer")
            .field("pending", &state.armed.len())
            .field("driver", &self.driver.as_ref().map(|d| d.thread().name()))
            .finish()
    }
}

// === impl TimerHandle ===

impl TimerHandle {
    /// Disarms the callback.
    ///
    /// Returns `true` if the callback will now never run, or `false` if it
    /// has already run or been cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared.state.lock();
        let cancelled = state.armed.remove(&self.id).is_some();
        if cancelled {
            state.compact();
        }
        drop(state);
        trace!(id = self.id, cancelled, "timer cancel");
        cancelled
    }

    /// Returns the instant the callback is due, or `None` if it was armed
    /// with a duration that never elapses.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

// === impl Shared ===

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                deadlines: BinaryHeap::new(),
                armed: HashMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        })
    }

    fn drive(&self) {
        debug!("timer driver started");
        let mut state = self.state.lock();
        while !state.shutdown {
            let Some(&Reverse((deadline, id))) = state.deadlines.peek() else {
                self.cond.wait(&mut state);
                continue;
            };

            if deadline > Instant::now() {
                self.cond.wait_until(&mut state, deadline);
                continue;
            }

            state.deadlines.pop();
            // Cancelled callbacks may leave their deadline behind.
            if let Some(callback) = state.armed.remove(&id) {
                trace!(id, "timer fired");
                MutexGuard::unlocked(&mut state, callback);
            }
        }
        debug!("timer driver stopped");
    }
}

// === impl State ===

impl State {
    /// Drops cancelled deadlines once they outnumber the armed callbacks.
    fn compact(&mut self) {
        let Self {
            deadlines, armed, ..
        } = self;
        if deadlines.len() <= armed.len() * 2 + COMPACT_SLACK {
            return;
        }
        let before = deadlines.len();
        deadlines.retain(|Reverse((_, id))| armed.contains_key(id));
        trace!(before, after = deadlines.len(), "timer heap compacted");
    }
}
