use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::budget::clock::DayBoundary;

const MILLIS_PER_MINUTE: u64 = 60_000;

/// Upper bound on reported usage, absorbs a stuck playback session
pub const MAX_USED_MINUTES: u32 = 24 * 60;

/// Playback time consumed on one calendar day
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageLedger {
    pub day: NaiveDate,
    pub used_millis: u64,
}

impl UsageLedger {
    pub fn new(day: NaiveDate) -> Self {
        Self { day, used_millis: 0 }
    }

    /// Reset usage if `today` is a later day; returns the finished day's ledger
    pub fn roll_over(&mut self, today: NaiveDate) -> Option<UsageLedger> {
        if !DayBoundary::has_rolled_over(self.day, today) {
            return None;
        }
        Some(std::mem::replace(self, UsageLedger::new(today)))
    }

    pub fn add_used(&mut self, elapsed_millis: u64) {
        self.used_millis = self.used_millis.saturating_add(elapsed_millis);
    }

    pub fn used_minutes(&self) -> u32 {
        let minutes = self.used_millis / MILLIS_PER_MINUTE;
        minutes.min(MAX_USED_MINUTES as u64) as u32
    }

    pub fn is_exceeded(&self, effective_limit_minutes: u32, enabled: bool) -> bool {
        enabled && self.used_minutes() >= effective_limit_minutes
    }

    pub fn remaining_minutes(&self, effective_limit_minutes: u32) -> u32 {
        effective_limit_minutes.saturating_sub(self.used_minutes())
    }

    pub fn clear(&mut self) {
        self.used_millis = 0;
    }

    /// "Used today: HH:MM / HH:MM"
    pub fn display(&self, effective_limit_minutes: u32) -> String {
        let used = self.used_minutes();
        format!(
            "Used today: {:02}:{:02} / {:02}:{:02}",
            used / 60,
            used % 60,
            effective_limit_minutes / 60,
            effective_limit_minutes % 60
        )
    }
}
