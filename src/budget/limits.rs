use serde::{Deserialize, Serialize};

use crate::budget::config::BudgetRules;
use crate::budget::error::{BudgetError, BudgetResult};

/// Parent-configured daily limit
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct DailyLimitConfig {
    /// Minutes per day, persists across days
    pub base_minutes: u32,

    /// Wallet minutes spent into today's limit, cleared at rollover
    #[serde(default)]
    pub applied_minutes: u32,

    /// Whether the limit is enforced at all
    #[serde(default)]
    pub enabled: bool,
}

impl DailyLimitConfig {
    pub fn new(rules: &BudgetRules) -> Self {
        Self {
            base_minutes: rules.default_base_minutes,
            applied_minutes: 0,
            enabled: false,
        }
    }

    pub fn effective_minutes(&self) -> u32 {
        self.base_minutes + self.applied_minutes
    }

    /// Check that `minutes` is a valid base limit under `rules`
    pub fn validate_base(minutes: u32, rules: &BudgetRules) -> BudgetResult<u32> {
        if minutes < 1 || minutes > rules.max_daily_minutes {
            return Err(BudgetError::InvalidRange {
                field: "base limit",
                value: minutes,
            });
        }
        Ok(minutes)
    }

    /// Bring a record loaded from disk back inside the rules
    ///
    /// Returns the applied minutes that had to be dropped to satisfy the cap.
    pub fn normalize(&mut self, rules: &BudgetRules) -> u32 {
        self.base_minutes = self.base_minutes.clamp(1, rules.max_daily_minutes);
        let room = rules.max_daily_minutes - self.base_minutes;
        let excess = self.applied_minutes.saturating_sub(room);
        self.applied_minutes -= excess;
        excess
    }
}
