use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time for the sink.
///
/// Rotation windows, backup names and retention cutoffs are all derived from
/// this trait, so swapping in a [`ManualClock`] makes every time-based
/// decision deterministic under test.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Whole seconds since the UNIX epoch.
    fn unix_secs(&self) -> i64 {
        match self.now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs() as i64,
            Err(before) => -(before.duration().as_secs() as i64),
        }
    }
}

/// The default clock, backed by `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
///
/// Intended for tests: construct the sink with a `ManualClock`, then
/// [`advance`](ManualClock::advance) it across a window boundary instead of
/// sleeping through one.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts the clock at `secs` seconds past the UNIX epoch.
    pub fn at_unix(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poison| poison.into_inner());
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        let mut now = self.now.lock().unwrap_or_else(|poison| poison.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at_unix(1_000);
        assert_eq!(clock.unix_secs(), 1_000);

        clock.advance(Duration::from_secs(61));
        assert_eq!(clock.unix_secs(), 1_061);

        clock.set(UNIX_EPOCH + Duration::from_secs(5));
        assert_eq!(clock.unix_secs(), 5);
    }

    #[test]
    fn system_clock_is_roughly_now() {
        let clock = SystemClock;
        let std_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_secs() as i64;
        assert!((clock.unix_secs() - std_now).abs() <= 1);
    }
}
