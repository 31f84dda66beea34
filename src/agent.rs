//! Objects confined to a thread of their own.
//!
//! An [`Agent`] owns a *receiver*: a value that only the agent's own thread
//! ever touches. Other threads reach the receiver by [sending](Agent::send)
//! closures, which the agent runs one at a time, in the order each sender
//! sent them. A sent closure's result comes back as a [`Proxy`] future.
use crate::{
    error::{Error, Fault},
    future::{self, Promise, PromiseRef, Status, Until},
    proxy::Proxy,
    scheduler::{self, Scheduler},
    util::Backoff,
};
use parking_lot::Mutex;
use std::{
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering::*},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
};
use tracing::{error, info, info_span};

/// The lifecycle of an [`Agent`].
///
/// An agent's status only ever moves forwards, from `Constructing` to
/// `Running` to `Terminated`. An agent disposed while constructing goes
/// straight to `Terminated`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AgentStatus {
    /// The receiver is being built on the agent's thread.
    Constructing = 0,
    /// The agent is running sent closures.
    Running = 1,
    /// The agent has been disposed, or its receiver failed to build.
    Terminated = 2,
}

/// A receiver of type `T`, and the thread that owns it.
pub trait Agent<T: Send + 'static>: Send + Sync {
    fn status(&self) -> AgentStatus;

    /// Sends `f` to run against the receiver on the agent's thread.
    ///
    /// If the agent is still constructing its receiver, this waits for it to
    /// finish first.
    ///
    /// # Errors
    ///
    /// [`Fault::AgentTerminated`] if the agent is terminated.
    fn try_send<V, F>(&self, f: F) -> Result<Arc<Proxy<V>>, Fault>
    where
        F: FnOnce(&mut T) -> Result<V, Error> + Send + 'static,
        V: Send + 'static;

    /// Like [`try_send`](Self::try_send), for an `f` that cannot fail.
    fn send<V, F>(&self, f: F) -> Result<Arc<Proxy<V>>, Fault>
    where
        F: FnOnce(&mut T) -> V + Send + 'static,
        V: Send + 'static,
    {
        self.try_send(move |receiver| Ok(f(receiver)))
    }

    /// Returns a future that fulfils once the agent is running.
    ///
    /// While the agent is constructing, this is a fiber scheduled on
    /// `scheduler` that polls the agent's status, so that a coroutine can
    /// wait for it without blocking its thread.
    ///
    /// # Errors
    ///
    /// [`Fault::AgentTerminated`] if the agent is terminated, or the fault
    /// from scheduling the fiber.
    fn ready(&self, scheduler: &Scheduler) -> Result<PromiseRef, Fault>;

    /// Terminates the agent.
    ///
    /// Closures sent but not yet run by then fail with
    /// [`Fault::AgentTerminated`], and the receiver is dropped on the agent's
    /// thread.
    fn dispose(&self);
}

/// An [`Agent`] running its own [`Scheduler`] on a dedicated OS thread.
///
/// Dropping a `ThreadedAgent` disposes it.
pub struct ThreadedAgent<T> {
    shared: Arc<Shared<T>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Configures a [`ThreadedAgent`].
#[derive(Debug, Clone)]
pub struct Builder {
    name: Option<String>,
    capacity: usize,
}

struct Shared<T> {
    name: Option<String>,
    status: AtomicU8,
    scheduler: Scheduler,
    receiver: Mutex<Option<T>>,
    /// Sent closures that have not yet settled.
    inflight: Mutex<Vec<Weak<dyn Promise>>>,
}

// === impl AgentStatus ===

impl AgentStatus {
    fn from_u8(status: u8) -> Self {
        match status {
            0 => Self::Constructing,
            1 => Self::Running,
            _ => Self::Terminated,
        }
    }
}

// === impl ThreadedAgent ===

impl<T: Send + 'static> ThreadedAgent<T> {
    /// Spawns an agent with the default configuration, whose receiver is
    /// returned by `construct`.
    ///
    /// `construct` runs on the agent's thread. Use [`Builder`] to configure
    /// the agent first.
    pub fn spawn(construct: impl FnOnce() -> T + Send + 'static) -> io::Result<Self> {
        Builder::new().spawn(construct)
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }
}

impl<T: Send + 'static> Agent<T> for ThreadedAgent<T> {
    fn status(&self) -> AgentStatus {
        self.shared.status()
    }

    fn try_send<V, F>(&self, f: F) -> Result<Arc<Proxy<V>>, Fault>
    where
        F: FnOnce(&mut T) -> Result<V, Error> + Send + 'static,
        V: Send + 'static,
    {
        let mut backoff = Backoff::new();
        loop {
            match self.status() {
                AgentStatus::Constructing => backoff.wait(),
                AgentStatus::Running => break,
                AgentStatus::Terminated => return Err(Fault::AgentTerminated),
            }
        }

        let shared = Arc::downgrade(&self.shared);
        let proxy = Proxy::new(move || {
            let shared = shared.upgrade().ok_or(Fault::AgentTerminated)?;
            if shared.status() == AgentStatus::Terminated {
                return Err(Fault::AgentTerminated.into());
            }
            let mut receiver = shared.receiver.lock();
            let receiver = receiver.as_mut().ok_or(Fault::AgentTerminated)?;
            f(receiver)
        });

        {
            let mut inflight = self.shared.inflight.lock();
            inflight.retain(|sent| sent.upgrade().map_or(false, |sent| !sent.is_complete()));
            let erased: PromiseRef = proxy.clone();
            inflight.push(Arc::downgrade(&erased));
        }
        self.shared.scheduler.schedule(&proxy)?;

        // Disposed while scheduling, so the closure may never run.
        if self.status() == AgentStatus::Terminated {
            return Err(Fault::AgentTerminated);
        }
        Ok(proxy)
    }

    fn ready(&self, scheduler: &Scheduler) -> Result<PromiseRef, Fault> {
        match self.status() {
            AgentStatus::Running => Ok(future::fulfilled()),
            AgentStatus::Terminated => Err(Fault::AgentTerminated),
            AgentStatus::Constructing => {
                let shared = Arc::downgrade(&self.shared);
                let until = Until::spawn(scheduler, move || {
                    shared
                        .upgrade()
                        .map_or(true, |shared| shared.status() != AgentStatus::Constructing)
                })?;
                Ok(until)
            }
        }
    }

    fn dispose(&self) {
        self.terminate();
    }
}

impl<T> ThreadedAgent<T> {
    fn terminate(&self) {
        let prev = self.shared.status.swap(AgentStatus::Terminated as u8, AcqRel);
        if prev != AgentStatus::Terminated as u8 {
            info!(agent = ?self.shared.name, "disposing agent");
        }
        self.shared.scheduler.shutdown();

        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        // Disposed from one of its own closures, so the thread exits once
        // that closure returns.
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!(agent = ?self.shared.name, "agent thread panicked");
        }
    }
}

impl<T> Drop for ThreadedAgent<T> {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl<T> fmt::Debug for ThreadedAgent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedAgent")
            .field("name", &self.shared.name)
            .field("status", &self.shared.status())
            .field("scheduler", &self.shared.scheduler)
            .finish()
    }
}

// === impl Shared ===

impl<T: Send + 'static> Shared<T> {
    fn run(&self, construct: impl FnOnce() -> T) {
        let span = info_span!("agent", name = ?self.name);
        let _enter = span.enter();
        info!("constructing receiver");

        match panic::catch_unwind(AssertUnwindSafe(construct)) {
            Ok(receiver) => *self.receiver.lock() = Some(receiver),
            Err(payload) => {
                let error = Error::panicked(payload);
                error!(%error, "receiver construction panicked");
                self.status.store(AgentStatus::Terminated as u8, Release);
                self.scheduler.shutdown();
                return;
            }
        }

        let started = self.status.compare_exchange(
            AgentStatus::Constructing as u8,
            AgentStatus::Running as u8,
            AcqRel,
            Acquire,
        );
        if started.is_ok() {
            info!("agent running");
            self.scheduler.run();
        } else {
            info!("agent disposed while constructing");
        }

        self.fail_inflight();
        drop(self.receiver.lock().take());
        info!("agent terminated");
    }

    fn fail_inflight(&self) {
        let inflight = std::mem::take(&mut *self.inflight.lock());
        let mut failed = 0;
        for sent in inflight.iter().filter_map(Weak::upgrade) {
            if sent.status() == Status::Pending
                && sent.core().throw(Fault::AgentTerminated.into()).is_ok()
            {
                failed += 1;
            }
        }
        if failed > 0 {
            info!(failed, "failed closures sent to a terminated agent");
        }
    }
}

impl<T> Shared<T> {
    fn status(&self) -> AgentStatus {
        AgentStatus::from_u8(self.status.load(Acquire))
    }
}

// === impl Builder ===

impl Builder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            name: None,
            capacity: scheduler::DEFAULT_CAPACITY,
        }
    }

    /// Names the agent. This is the name of its thread and its scheduler.
    #[must_use]
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets how many sent closures the agent can hold before they run.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    #[must_use]
    pub fn capacity(self, capacity: usize) -> Self {
        assert!(capacity > 0, "an agent must have room for one closure");
        Self { capacity, ..self }
    }

    /// Spawns the agent's thread, which builds the receiver with `construct`
    /// and then runs sent closures.
    ///
    /// # Errors
    ///
    /// If the OS fails to spawn the thread.
    pub fn spawn<T, F>(self, construct: F) -> io::Result<ThreadedAgent<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut scheduler = Scheduler::builder().capacity(self.capacity);
        let mut thread = thread::Builder::new();
        if let Some(name) = self.name.as_deref() {
            scheduler = scheduler.name(name);
            thread = thread.name(name.to_owned());
        }

        let shared = Arc::new(Shared {
            name: self.name,
            status: AtomicU8::new(AgentStatus::Constructing as u8),
            scheduler: scheduler.build(),
            receiver: Mutex::new(None),
            inflight: Mutex::new(Vec::new()),
        });
        let handle = {
            let shared = shared.clone();
            thread.spawn(move || shared.run(construct))?
        };

        Ok(ThreadedAgent {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
