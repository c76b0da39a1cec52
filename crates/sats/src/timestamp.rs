//! Points in time and durations, at microsecond precision.

use std::time::{Duration, SystemTime};

/// Microseconds since the Unix epoch. Signed, so pre-1970 instants encode.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Timestamp {
    pub microseconds: i64,
}

impl Timestamp {
    pub const UNIX_EPOCH: Self = Timestamp { microseconds: 0 };

    pub fn from_micros(microseconds: i64) -> Self {
        Timestamp { microseconds }
    }

    pub fn now() -> Self {
        Self::from_systemtime(SystemTime::now())
    }

    pub fn from_systemtime(systime: SystemTime) -> Self {
        match systime.duration_since(SystemTime::UNIX_EPOCH) {
            // UNIX_EPOCH + i64::MAX microseconds is deep in the fourth millennium,
            // so the cast is fine
            Ok(dur) => Self::from_micros(dur.as_micros() as i64),
            Err(before) => Self::from_micros(-(before.duration().as_micros() as i64)),
        }
    }

    pub fn to_systemtime(self) -> SystemTime {
        if self.microseconds >= 0 {
            SystemTime::UNIX_EPOCH + Duration::from_micros(self.microseconds as u64)
        } else {
            SystemTime::UNIX_EPOCH - Duration::from_micros(self.microseconds.unsigned_abs())
        }
    }
}

/// A signed duration in microseconds.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TimeDuration {
    pub microseconds: i64,
}

impl TimeDuration {
    pub const ZERO: Self = TimeDuration { microseconds: 0 };

    pub fn from_micros(microseconds: i64) -> Self {
        TimeDuration { microseconds }
    }

    /// Saturates to `Duration::ZERO` for negative durations.
    pub fn to_duration(self) -> Duration {
        Duration::from_micros(self.microseconds.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemtime_round_trip() {
        let ts = Timestamp::from_micros(1_700_000_000_000_000);
        assert_eq!(Timestamp::from_systemtime(ts.to_systemtime()), ts);
    }

    #[test]
    fn pre_epoch_timestamps_are_negative() {
        let before = SystemTime::UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(Timestamp::from_systemtime(before).microseconds, -1_000_000);
    }
}
