//! RTC-vs-monotonic timestamp source (spec section 9, "RTC vs monotonic clock").
//!
//! Production code reaches for [`SystemClock`]; tests inject [`FixedClock`]
//! or a monotonic-only clock to exercise the RTC-invalid fallback path
//! without waiting on wall-clock time.

use chrono::{DateTime, TimeZone, Utc};
use std::time::{Duration, Instant};

/// An RTC year below this is treated as "not yet set" (spec section 9).
const RTC_VALID_FROM_YEAR: i32 = 2024;

pub trait Clock: Send + Sync {
    /// Current RTC time, if the RTC has been set to a plausible value.
    fn rtc_now(&self) -> Option<DateTime<Utc>>;

    /// Monotonic milliseconds since an arbitrary epoch (process start).
    fn monotonic_millis(&self) -> u64;

    /// Best-effort timestamp for an Observation/payload: RTC when valid,
    /// monotonic fallback otherwise.
    fn timestamp(&self) -> Timestamp {
        match self.rtc_now() {
            Some(dt) => Timestamp::Rtc(dt),
            None => Timestamp::Monotonic(self.monotonic_millis()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    Rtc(DateTime<Utc>),
    Monotonic(u64),
}

impl Timestamp {
    /// `DD/MM/YYYY HH:MM:SS` for RTC, millis-since-boot string otherwise
    /// (spec section 4.7 default-mode payload shape).
    pub fn to_display_string(&self) -> String {
        match self {
            Timestamp::Rtc(dt) => dt.format("%d/%m/%Y %H:%M:%S").to_string(),
            Timestamp::Monotonic(ms) => ms.to_string(),
        }
    }
}

/// Real wall-clock/monotonic clock.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn rtc_now(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        if now.format("%Y").to_string().parse::<i32>().unwrap_or(0) >= RTC_VALID_FROM_YEAR {
            Some(now)
        } else {
            None
        }
    }

    fn monotonic_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Deterministic clock for tests: a fixed RTC value (or none) plus a
/// manually-advanced monotonic counter.
pub struct FixedClock {
    rtc: std::sync::Mutex<Option<DateTime<Utc>>>,
    monotonic: std::sync::Mutex<Duration>,
}

impl FixedClock {
    pub fn rtc_valid_at(year: i32, month: u32, day: u32) -> Self {
        let dt = Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap();
        Self {
            rtc: std::sync::Mutex::new(Some(dt)),
            monotonic: std::sync::Mutex::new(Duration::ZERO),
        }
    }

    pub fn rtc_invalid() -> Self {
        Self {
            rtc: std::sync::Mutex::new(None),
            monotonic: std::sync::Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, delta: Duration) {
        *self.monotonic.lock().unwrap() += delta;
    }

    pub fn set_rtc(&self, dt: Option<DateTime<Utc>>) {
        *self.rtc.lock().unwrap() = dt;
    }
}

impl Clock for FixedClock {
    fn rtc_now(&self) -> Option<DateTime<Utc>> {
        *self.rtc.lock().unwrap()
    }

    fn monotonic_millis(&self) -> u64 {
        self.monotonic.lock().unwrap().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_rtc_falls_back_to_monotonic() {
        let clock = FixedClock::rtc_invalid();
        clock.advance(Duration::from_millis(1500));
        match clock.timestamp() {
            Timestamp::Monotonic(ms) => assert_eq!(ms, 1500),
            Timestamp::Rtc(_) => panic!("expected monotonic fallback"),
        }
    }

    #[test]
    fn valid_rtc_is_preferred() {
        let clock = FixedClock::rtc_valid_at(2025, 6, 1);
        matches!(clock.timestamp(), Timestamp::Rtc(_));
    }
}
