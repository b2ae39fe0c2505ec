//! Daily watch-time budget for the kids video viewer
//!
//! This module provides functionality to:
//! - Track today's playback time against the effective daily limit
//! - Keep a wallet of bonus minutes earned through rewarded ads
//! - Reconcile the wallet whenever the base limit changes
//! - Gate wallet-affecting actions behind a completed ad

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod limits;
pub mod reconciler;
pub mod state;
pub mod usage;
pub mod wallet;

pub use clock::{Clock, DayBoundary, ManualClock, SystemClock};
pub use config::{BudgetConfig, BudgetRules};
pub use engine::{BudgetStatus, ViewingContext, WatchTimeEngine};
pub use error::{AdRefusal, BudgetError, BudgetResult};
pub use gate::{
    AdOutcome, AdProvider, AdScript, AdStatus, GateState, GuardedAction, ReviewerOverride,
    RewardGate, RewardGrant, ScriptedAdProvider, SessionReviewerUnlock,
};
pub use limits::DailyLimitConfig;
pub use reconciler::{LimitReconciler, ReconcileReport, ResetReport};
pub use state::{BudgetStore, DayRecord, JsonFileStore, MemoryStore};
pub use usage::UsageLedger;
pub use wallet::EarnedTimeWallet;
