use super::timer::{global_timer, Timer, TimerHandle};
use crate::{
    error::Fault,
    future::{Core, Promise},
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

/// A future that is fulfilled once a duration has elapsed.
///
/// A `Timeout` is armed on a [`Timer`] when it is created. Cancelling it
/// before it fires disarms the timer, and fails the timeout with
/// [`Cancelled`](crate::error::Cancelled).
pub struct Timeout {
    core: Core,
    duration: Duration,
    arm: Mutex<Arm>,
}

enum Arm {
    /// The timer callback may run before `Timer::after` has returned the
    /// handle.
    Arming,
    Armed(TimerHandle),
    Done,
}

impl Timeout {
    /// Returns a timeout on `timer` that fulfils once `duration` has elapsed.
    #[must_use]
    pub fn new(timer: &Timer, duration: Duration) -> Arc<Self> {
        let this = Arc::new(Self {
            core: Core::cancellable(),
            duration,
            arm: Mutex::new(Arm::Arming),
        });

        let weak = Arc::downgrade(&this);
        let handle = timer.after(duration, move || Self::fire(&weak));
        let mut arm = this.arm.lock();
        if let Arm::Arming = *arm {
            *arm = Arm::Armed(handle);
        }
        drop(arm);
        this
    }

    /// Returns a timeout on the [global timer](global_timer).
    #[must_use]
    pub fn after(duration: Duration) -> Arc<Self> {
        Self::new(global_timer(), duration)
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn fire(this: &Weak<Self>) {
        let Some(this) = this.upgrade() else {
            return;
        };
        {
            let mut arm = this.arm.lock();
            if let Arm::Done = *arm {
                return;
            }
            *arm = Arm::Done;
        }
        if this.core.try_fulfill() {
            test_trace!(duration = ?this.duration, "timeout fired");
        }
    }
}

impl Promise for Timeout {
    fn core(&self) -> &Core {
        &self.core
    }

    fn cancel(&self) -> Result<(), Fault> {
        {
            let mut arm = self.arm.lock();
            match std::mem::replace(&mut *arm, Arm::Done) {
                Arm::Armed(handle) => {
                    handle.cancel();
                }
                Arm::Arming => {}
                // Fired first.
                Arm::Done => return Ok(()),
            }
        }
        self.core.cancel()
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("core", &self.core)
            .field("duration", &self.duration)
            .finish()
    }
}
