use super::{Core, Promise, Status};
use crate::{error::Fault, scheduler::Scheduler};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// A fiber that fulfils once a predicate holds.
///
/// The predicate is checked once every time the fiber is resumed, so an
/// `Until` busy-polls its condition at the pace of the scheduler it runs
/// on. Reach for it only when no future reports the condition directly.
pub struct Until {
    core: Core,
    predicate: Mutex<Box<dyn FnMut() -> bool + Send>>,
}

impl Until {
    /// Returns a fiber that fulfils once `predicate` returns `true`.
    ///
    /// If the predicate already holds, the returned future is fulfilled and
    /// never scheduled. Otherwise it is scheduled on `scheduler`.
    pub fn spawn(
        scheduler: &Scheduler,
        predicate: impl FnMut() -> bool + Send + 'static,
    ) -> Result<Arc<Self>, Fault> {
        let this = Arc::new(Self {
            core: Core::cancellable(),
            predicate: Mutex::new(Box::new(predicate)),
        });
        if this.check() {
            return Ok(this);
        }
        scheduler.schedule(&this)?;
        Ok(this)
    }

    fn check(&self) -> bool {
        let holds = (&mut *self.predicate.lock())();
        if holds {
            self.core.try_fulfill();
        }
        holds
    }
}

impl Promise for Until {
    fn core(&self) -> &Core {
        &self.core
    }

    fn resume(&self) -> Result<(), Fault> {
        self.core.resume_default()?;
        if self.core.status() == Status::Pending {
            self.check();
        }
        Ok(())
    }
}

impl fmt::Debug for Until {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Until").field("core", &self.core).finish()
    }
}
