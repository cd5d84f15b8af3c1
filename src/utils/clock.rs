//! Time sources used for vsync scheduling

use std::{fmt, time::Duration};

use rustix::time::{clock_gettime, ClockId};

/// A monotonic source of time that can also block until a deadline
///
/// Timestamps are durations since an arbitrary, fixed epoch.
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Returns the current time
    fn now(&self) -> Duration;
    /// Blocks the calling thread until `deadline` has passed
    fn sleep_until(&self, deadline: Duration);
}

/// Time source backed by `CLOCK_MONOTONIC`
#[derive(Debug, Default, Clone, Copy)]
pub struct Monotonic;

impl TimeSource for Monotonic {
    #[inline]
    fn now(&self) -> Duration {
        let tp = clock_gettime(ClockId::Monotonic);
        Duration::new(tp.tv_sec as u64, tp.tv_nsec as u32)
    }

    fn sleep_until(&self, deadline: Duration) {
        loop {
            let now = self.now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(deadline - now);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Monotonic, TimeSource};
    use std::time::Duration;

    #[test]
    fn monotonic_sleep_reaches_deadline() {
        let clock = Monotonic;
        let deadline = clock.now() + Duration::from_millis(2);
        clock.sleep_until(deadline);
        assert!(clock.now() >= deadline);
    }
}
