use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use std::sync::Mutex;

/// Source of "now" and of the device-local calendar day
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current calendar day in the device's local time zone
    fn today(&self) -> NaiveDate;
}

/// Wall clock in the local time zone
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Manually driven clock; the calendar day is the UTC date of `now`
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Day boundary shared by every day-scoped record
pub struct DayBoundary;

impl DayBoundary {
    /// True when `today` is a later calendar day than `stored`
    ///
    /// A clock that moved backwards never triggers a reset.
    pub fn has_rolled_over(stored: NaiveDate, today: NaiveDate) -> bool {
        today > stored
    }

    /// Move `stored` forward to `today`, running `reset` once if the day advanced
    pub fn roll<F: FnOnce(NaiveDate)>(stored: &mut NaiveDate, today: NaiveDate, reset: F) -> bool {
        if !Self::has_rolled_over(*stored, today) {
            return false;
        }
        let previous = *stored;
        *stored = today;
        reset(previous);
        true
    }
}
