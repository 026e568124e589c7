// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded spin loop support for polling device state.

use std::time::Duration;
use std::time::Instant;

const SPIN_ATTEMPTS: u64 = 16;
const SLEEP_DURATION: Duration = Duration::from_millis(1);

/// Paces a polling loop.
///
/// This is useful when waiting for some condition (such as a device register
/// to change states) that can only be polled and does not have an
/// interrupt-based notification. The first few calls only yield, after which
/// every call sleeps for a fixed 1ms.
#[derive(Debug, Default)]
pub struct Backoff {
    n: u64,
}

impl Backoff {
    /// Returns a new backoff object, usable for the lifetime of one spin loop.
    pub fn new() -> Self {
        Self { n: 0 }
    }

    /// Yields execution, for longer once the loop has spun a while.
    pub fn back_off(&mut self) {
        if self.n < SPIN_ATTEMPTS {
            std::thread::yield_now();
        } else {
            std::thread::sleep(SLEEP_DURATION);
        }
        self.n += 1;
    }
}

/// Polls `f` until it returns `Some` or `timeout` elapses.
///
/// `f` is always called at least once, and once more after the deadline has
/// passed, so a condition that became true while the caller slept is not
/// reported as a timeout. Returns `None` on timeout.
pub fn poll_until<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    let mut backoff = Backoff::new();
    loop {
        if let Some(v) = f() {
            break Some(v);
        }
        if Instant::now() >= deadline {
            break f();
        }
        backoff.back_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn succeeds_after_a_few_polls() {
        let mut n = 0;
        let r = poll_until(Duration::from_secs(10), || {
            n += 1;
            (n == 3).then_some(n)
        });
        assert_eq!(r, Some(3));
    }

    #[test]
    fn zero_timeout_still_polls() {
        assert_eq!(poll_until(Duration::ZERO, || Some(7)), Some(7));
    }

    #[test]
    fn times_out() {
        let start = Instant::now();
        assert_eq!(poll_until::<()>(Duration::from_millis(20), || None), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
