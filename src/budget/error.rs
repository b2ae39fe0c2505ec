use std::fmt;
use thiserror::Error;

use crate::budget::gate::GuardedAction;

pub type BudgetResult<T> = std::result::Result<T, BudgetError>;

/// Why a rewarded ad did not unlock an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdRefusal {
    /// The ad was closed before the reward was granted
    Dismissed,
    /// The ad did not finish within the configured timeout
    TimedOut,
}

impl fmt::Display for AdRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdRefusal::Dismissed => write!(f, "ad not completed"),
            AdRefusal::TimedOut => write!(f, "ad is taking longer to load, try again in a moment"),
        }
    }
}

/// Every user-facing refusal of the budget engine
///
/// All variants are recoverable. A failed operation leaves the ledger,
/// the wallet and today's usage exactly as they were.
#[derive(Error, Debug)]
pub enum BudgetError {
    #[error("Insufficient wallet time: need {needed} minutes, have {available}")]
    InsufficientWallet { needed: u32, available: u32 },

    #[error("Insufficient earned time: need {needed} minutes, have {available}")]
    InsufficientEarnedTime { needed: u32, available: u32 },

    #[error("Daily cap exceeded: {requested} minutes requested, maximum is {max}")]
    CapExceeded { requested: u32, max: u32 },

    #[error("Invalid {field}: {value}")]
    InvalidRange { field: &'static str, value: u32 },

    #[error("Rewarded ad not granted: {0}")]
    AdNotGranted(AdRefusal),

    #[error("Grant for {actual} cannot be used to {expected}")]
    GrantMismatch {
        expected: GuardedAction,
        actual: GuardedAction,
    },

    #[error("Budget changed while the ad was showing, please try again")]
    StateChanged,

    #[error("Failed to persist budget state")]
    Persistence(#[source] anyhow::Error),
}

impl BudgetError {
    /// True for refusals the parent can fix by watching more ads
    pub fn is_funding_shortfall(&self) -> bool {
        matches!(
            self,
            BudgetError::InsufficientWallet { .. } | BudgetError::InsufficientEarnedTime { .. }
        )
    }
}
