use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::budget::error::{BudgetError, BudgetResult};

/// Where a wallet entry came from
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    /// Earned by a completed rewarded ad
    Reward,
    /// Given back by the reconciler
    Returned,
}

/// A chunk of earned minutes
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WalletEntry {
    pub earned_at: DateTime<Utc>,
    pub minutes: u32,
    pub source: EntrySource,
}

/// Bonus minutes earned by watching rewarded ads, spent oldest first
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EarnedTimeWallet {
    #[serde(default)]
    pub entries: Vec<WalletEntry>,
}

impl EarnedTimeWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self) -> u32 {
        self.entries
            .iter()
            .fold(0u32, |total, e| total.saturating_add(e.minutes))
    }

    /// Add minutes earned by a rewarded ad
    pub fn credit(&mut self, minutes: u32, at: DateTime<Utc>) {
        self.push(minutes, at, EntrySource::Reward);
    }

    /// Give minutes back to the wallet; not a reward event
    pub fn credit_return(&mut self, minutes: u32, at: DateTime<Utc>) {
        self.push(minutes, at, EntrySource::Returned);
    }

    /// Remove `minutes`, consuming the oldest entries first
    ///
    /// Fails without touching the wallet when the balance is too small.
    pub fn debit(&mut self, minutes: u32) -> BudgetResult<()> {
        let available = self.balance();
        if minutes > available {
            return Err(BudgetError::InsufficientWallet {
                needed: minutes,
                available,
            });
        }

        let mut remaining = minutes;
        self.entries.retain_mut(|entry| {
            if remaining == 0 {
                return true;
            }
            if entry.minutes <= remaining {
                remaining -= entry.minutes;
                false
            } else {
                entry.minutes -= remaining;
                remaining = 0;
                true
            }
        });

        Ok(())
    }

    /// Drop entries older than `ttl`; returns the minutes that expired
    pub fn prune_expired(&mut self, now: DateTime<Utc>, ttl: Option<Duration>) -> u32 {
        let Some(ttl) = ttl else {
            return 0;
        };

        let before = self.balance();
        self.entries.retain(|e| now - e.earned_at < ttl);
        let expired = before - self.balance();

        if expired > 0 {
            debug!("Expired {} wallet minutes", expired);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn push(&mut self, minutes: u32, at: DateTime<Utc>, source: EntrySource) {
        if minutes == 0 {
            return;
        }
        self.entries.push(WalletEntry {
            earned_at: at,
            minutes,
            source,
        });
        self.entries.sort_by_key(|e| e.earned_at);
    }
}
