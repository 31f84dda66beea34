use super::Timer;
use std::sync::OnceLock;

static GLOBAL_TIMER: OnceLock<Timer> = OnceLock::new();

/// Errors returned by [`set_global_timer`].
#[derive(Debug, thiserror::Error)]
#[error("the global timer is already initialized")]
pub struct AlreadyInitialized(());

/// Sets a [`Timer`] as the global default timer.
///
/// The global timer may only be set once, and only before anything has used
/// it. Later calls return an [`AlreadyInitialized`] error, and drop `timer`.
pub fn set_global_timer(timer: Timer) -> Result<(), AlreadyInitialized> {
    GLOBAL_TIMER.set(timer).map_err(|_| AlreadyInitialized(()))
}

/// Returns the global default timer.
///
/// If [`set_global_timer`] has not been called, this starts a new timer the
/// first time it is called.
pub fn global_timer() -> &'static Timer {
    GLOBAL_TIMER.get_or_init(Timer::new)
}
