use chrono::{DateTime, Timelike, Utc};
use std::sync::Mutex;

/// Injectable time source. All window arithmetic in the engine goes through
/// this trait so that expiry behavior can be tested deterministically.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;

    /// Hour of day [0, 24) in the host's local timezone.
    /// Used only by the off-hours signal.
    fn local_hour(&self) -> u32;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_hour(&self) -> u32 {
        chrono::Local::now().hour()
    }
}

/// Hand-driven clock for tests. Starts at a fixed instant and only moves
/// when `advance` is called.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    local_hour: Mutex<u32>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            local_hour: Mutex::new(12),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    /// Pins the local hour reported to the off-hours signal.
    pub fn set_local_hour(&self, hour: u32) {
        *self.local_hour.lock().unwrap() = hour % 24;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn local_hour(&self) -> u32 {
        *self.local_hour.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap());
        let before = clock.now();
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now() - before, chrono::Duration::minutes(5));
    }

    #[test]
    fn test_manual_clock_local_hour() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap());
        clock.set_local_hour(3);
        assert_eq!(clock.local_hour(), 3);
        clock.set_local_hour(27);
        assert_eq!(clock.local_hour(), 3);
    }
}
