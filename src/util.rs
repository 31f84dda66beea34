macro_rules! test_trace {
    ($($tt:tt)*) => {
        #[cfg(test)]
        tracing::trace!($($tt)*)
    }
}

/// An exponential backoff for busy-waits on state owned by another thread.
///
/// After a few rounds of spinning, this starts yielding the OS thread rather
/// than burning its timeslice.
#[derive(Debug, Clone, Default)]
pub(crate) struct Backoff {
    exp: u8,
}

impl Backoff {
    const MAX_SPIN_EXPONENT: u8 = 6;

    pub(crate) const fn new() -> Self {
        Self { exp: 0 }
    }

    #[inline]
    pub(crate) fn wait(&mut self) {
        if self.exp <= Self::MAX_SPIN_EXPONENT {
            for _ in 0..(1 << self.exp) {
                std::hint::spin_loop();
            }
            self.exp += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
pub(crate) fn trace_init() -> tracing::dispatcher::DefaultGuard {
    use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt};
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_test_writer()
        .without_time()
        .finish()
        .set_default()
}

#[cfg(test)]
pub(crate) fn assert_send_sync<T: Send + Sync>() {}
