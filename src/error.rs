//! Errors.
//!
//! Two kinds of failure flow through this crate:
//!
//! - An [`Error`] is a *domain* error. It is what a future fails with, and it
//!   travels along chains of futures. It is cheaply cloneable, since the same
//!   error may be observed by every future waiting on the failed one.
//! - A [`Fault`] is a *usage* error: asking a future for a value it does not
//!   have, or mutating a future that has already settled. Faults are returned
//!   to the caller immediately and never stored in a future, unless they
//!   escape from a fiber's `resume` and are converted into its error.
use crate::future::Status;
use std::{any::Any, error, fmt, sync::Arc};

/// A cloneable, type-erased error that a future failed with.
#[derive(Clone)]
pub struct Error(Arc<dyn error::Error + Send + Sync + 'static>);

/// The error a future fails with when it is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the future was cancelled")]
pub struct Cancelled;

/// The errors of every failed constituent of a composite future.
///
/// Nested aggregates are flattened, so `errors()` never contains another
/// `Aggregate`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} constituent future(s) failed", .errors.len())]
pub struct Aggregate {
    errors: Vec<Error>,
}

/// A panic caught while running a fiber's invocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invocation panicked: {message}")]
pub struct Panicked {
    message: String,
}

/// A usage error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Fault {
    /// A future's status or error was changed after it became immutable.
    #[error("future is already {0:?}, and cannot be changed")]
    Terminal(Status),

    /// `cancel` was called on a future that does not support cancellation.
    #[error("future does not support cancellation")]
    NotCancellable,

    /// A value was read from a future that is not fulfilled.
    #[error("future is not fulfilled (status: {0:?})")]
    NotFulfilled(Status),

    /// A completed future was resumed.
    #[error("cannot resume a future that is already {0:?}")]
    ResumedTerminal(Status),

    /// A message was sent to an agent that is terminated.
    #[error("agent is terminated")]
    AgentTerminated,

    /// A fiber bound to one scheduler was scheduled on another.
    #[error("fiber is bound to a different scheduler")]
    ForeignScheduler,

    /// A scheduler's ring has no free slots.
    #[error("scheduler is full ({capacity} fibers)")]
    RingFull { capacity: usize },
}

// === impl Error ===

impl Error {
    pub fn new<E>(error: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Returns an error containing only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(Cancelled)
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::new(Panicked { message })
    }

    /// Collects `errors` into a single [`Aggregate`], flattening any nested
    /// aggregates.
    pub(crate) fn aggregate(errors: impl IntoIterator<Item = Error>) -> Self {
        let mut flat = Vec::new();
        for error in errors {
            match error.downcast_ref::<Aggregate>() {
                Some(agg) => flat.extend(agg.errors.iter().cloned()),
                None => flat.push(error),
            }
        }
        Self::new(Aggregate { errors: flat })
    }

    /// Returns `true` if the wrapped error is of type `E`.
    #[must_use]
    pub fn is<E: error::Error + 'static>(&self) -> bool {
        self.0.is::<E>()
    }

    #[must_use]
    pub fn downcast_ref<E: error::Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.is::<Cancelled>()
    }

    #[must_use]
    pub fn as_aggregate(&self) -> Option<&Aggregate> {
        self.downcast_ref::<Aggregate>()
    }

    /// Returns `true` if both handles refer to the same error value.
    #[must_use]
    pub fn ptr_eq(&self, other: &Error) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Self::new(fault)
    }
}

impl From<Cancelled> for Error {
    fn from(cancelled: Cancelled) -> Self {
        Self::new(cancelled)
    }
}

// === impl Aggregate ===

impl Aggregate {
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);
