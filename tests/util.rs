#![allow(dead_code)]
use std::time::{Duration, Instant};

pub fn trace_init() {
    use tracing_subscriber::filter::LevelFilter;
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Slack allowed past a deadline for the timer and scheduler threads to wake.
pub const SLACK: Duration = Duration::from_millis(50);

/// Asserts that `elapsed` fell within `[expected, expected + SLACK)`.
#[track_caller]
pub fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected,
        "resolved after {elapsed:?}, before its deadline of {expected:?}"
    );
    assert!(
        elapsed < expected + SLACK,
        "resolved after {elapsed:?}, well past its deadline of {expected:?}"
    );
}
