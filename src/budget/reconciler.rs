//! Pure arithmetic of the budget economy.
//!
//! Every function takes an explicit snapshot of `(base, applied, wallet)`
//! and returns either a plan describing the new values or the refusal.
//! Nothing here touches storage, locks or the clock; the engine applies a
//! plan to a shadow copy of the ledger and persists it in one write.

use std::cmp::Ordering;

use crate::budget::config::BudgetRules;
use crate::budget::error::{BudgetError, BudgetResult};
use crate::budget::limits::DailyLimitConfig;

/// Consistent view of the three reconciled quantities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub base_minutes: u32,
    pub applied_minutes: u32,
    pub wallet_balance: u32,
}

impl BudgetSnapshot {
    pub fn effective_minutes(&self) -> u32 {
        self.base_minutes + self.applied_minutes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseChange {
    Increase,
    Decrease,
    Unchanged,
}

/// Outcome of a base-limit change, before it is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseChangePlan {
    pub change: BaseChange,
    pub new_base: u32,
    pub new_applied: u32,
    /// Minutes taken from the wallet to fund the increase
    pub debit: u32,
    /// Minutes given back to the wallet
    pub returned: u32,
    /// Applied minutes were cut to respect the daily cap
    pub auto_adjusted: bool,
}

impl BaseChangePlan {
    pub fn new_wallet_balance(&self, before: &BudgetSnapshot) -> u32 {
        before.wallet_balance - self.debit + self.returned
    }
}

/// What a committed limit change did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub new_base: u32,
    pub new_applied: u32,
    pub new_wallet_balance: u32,
    pub debited_from_wallet: u32,
    pub returned_to_wallet: u32,
    pub auto_adjusted: bool,
}

impl ReconcileReport {
    pub fn effective_minutes(&self) -> u32 {
        self.new_base + self.new_applied
    }

    /// Human-readable summary for the settings surface
    pub fn summary(&self, max_daily_minutes: u32) -> String {
        let limit = format_minutes(self.new_base);
        let mut message = if self.auto_adjusted {
            format!(
                "Time limit set to {} (effective: {}). Adjusted to fit {}min limit. {} minutes returned to wallet.",
                limit,
                format_minutes(self.effective_minutes()),
                max_daily_minutes,
                self.returned_to_wallet
            )
        } else if self.returned_to_wallet > 0 {
            format!(
                "Time limit set to {}. {} minutes returned to wallet.",
                limit, self.returned_to_wallet
            )
        } else {
            format!("Time limit set to {}", limit)
        };

        if self.debited_from_wallet > 0 {
            message.push_str(&format!(
                " {} minutes paid from wallet.",
                self.debited_from_wallet
            ));
        }
        message
    }
}

/// Applying wallet minutes to today's limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyPlan {
    pub amount: u32,
    pub new_applied: u32,
    pub new_wallet_balance: u32,
}

/// Giving applied minutes back to the wallet to lower the effective limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReducePlan {
    pub new_effective: u32,
    pub new_applied: u32,
    pub returned: u32,
}

/// Drawing the reset cost from the wallet and the applied pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetPlan {
    pub from_wallet: u32,
    pub from_applied: u32,
    pub new_applied: u32,
    pub new_wallet_balance: u32,
}

/// What a committed "reset today's usage" did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetReport {
    pub from_wallet: u32,
    pub from_applied: u32,
    pub new_wallet_balance: u32,
    pub new_applied: u32,
    pub effective_limit: u32,
}

impl ResetReport {
    pub fn summary(&self, base_minutes: u32) -> String {
        let mut message = format!(
            "Daily limit reset. Effective limit: {} minutes (Base: {} + Applied: {}).",
            self.effective_limit, base_minutes, self.new_applied
        );
        match (self.from_wallet, self.from_applied) {
            (0, 0) => {}
            (w, 0) => message.push_str(&format!(" Deducted {} min from wallet.", w)),
            (0, a) => message.push_str(&format!(" Deducted {} min from applied time.", a)),
            (w, a) => message.push_str(&format!(
                " Deducted {} min from wallet and {} min from applied time.",
                w, a
            )),
        }
        message
    }
}

/// Keeps base, applied and wallet consistent
#[derive(Debug, Clone, Copy)]
pub struct LimitReconciler {
    rules: BudgetRules,
}

impl LimitReconciler {
    pub fn new(rules: BudgetRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &BudgetRules {
        &self.rules
    }

    /// Wallet minutes needed to raise the base from `old_base` to `new_base`
    ///
    /// Only the part above the free allowance is paid for.
    pub fn funding_required(&self, old_base: u32, new_base: u32) -> u32 {
        if new_base <= old_base {
            return 0;
        }
        let free = self.rules.default_base_minutes;
        if old_base >= free {
            new_base - old_base
        } else {
            new_base.saturating_sub(free)
        }
    }

    /// Minutes of `base` that were paid for from the wallet
    pub fn paid_portion(&self, base: u32) -> u32 {
        base.saturating_sub(self.rules.default_base_minutes)
    }

    pub fn plan_base_change(
        &self,
        snapshot: &BudgetSnapshot,
        new_base: u32,
    ) -> BudgetResult<BaseChangePlan> {
        let new_base = DailyLimitConfig::validate_base(new_base, &self.rules)?;
        let old_base = snapshot.base_minutes;

        let mut applied = snapshot.applied_minutes;
        let mut debit = 0;
        let mut returned = 0;

        let change = match new_base.cmp(&old_base) {
            Ordering::Greater => {
                debit = self.funding_required(old_base, new_base);
                if debit > snapshot.wallet_balance {
                    return Err(BudgetError::InsufficientWallet {
                        needed: debit,
                        available: snapshot.wallet_balance,
                    });
                }
                BaseChange::Increase
            }
            Ordering::Less => {
                returned += self.paid_portion(old_base).min(old_base - new_base);
                // A base reduction forfeits today's applied bonus back to the wallet
                returned += applied;
                applied = 0;
                BaseChange::Decrease
            }
            Ordering::Equal => BaseChange::Unchanged,
        };

        // With the base unchanged or raised, effective time can only shrink
        // through the cap; that excess comes out of applied and back to the wallet.
        // Lowering effective time at a fixed base is `plan_reduce`.
        let max = self.rules.max_daily_minutes;
        let mut auto_adjusted = false;
        if new_base + applied > max {
            let excess = new_base + applied - max;
            applied -= excess;
            returned += excess;
            auto_adjusted = true;
        }

        Ok(BaseChangePlan {
            change,
            new_base,
            new_applied: applied,
            debit,
            returned,
            auto_adjusted,
        })
    }

    pub fn plan_apply(&self, snapshot: &BudgetSnapshot, amount: u32) -> BudgetResult<ApplyPlan> {
        if amount == 0 {
            return Err(BudgetError::InvalidRange {
                field: "earned time amount",
                value: amount,
            });
        }

        if amount > snapshot.wallet_balance {
            return Err(BudgetError::InsufficientWallet {
                needed: amount,
                available: snapshot.wallet_balance,
            });
        }

        let requested = snapshot.effective_minutes().saturating_add(amount);
        if requested > self.rules.max_daily_minutes {
            return Err(BudgetError::CapExceeded {
                requested,
                max: self.rules.max_daily_minutes,
            });
        }

        Ok(ApplyPlan {
            amount,
            new_applied: snapshot.applied_minutes + amount,
            new_wallet_balance: snapshot.wallet_balance - amount,
        })
    }

    /// Lower the effective limit to `new_effective` without touching the base
    ///
    /// Only applied minutes can be given back, so the target must lie in
    /// `base..current effective`.
    pub fn plan_reduce(
        &self,
        snapshot: &BudgetSnapshot,
        new_effective: u32,
    ) -> BudgetResult<ReducePlan> {
        let out_of_range = BudgetError::InvalidRange {
            field: "effective limit",
            value: new_effective,
        };

        if new_effective < snapshot.base_minutes || new_effective > self.rules.max_daily_minutes {
            return Err(out_of_range);
        }
        if new_effective >= snapshot.effective_minutes() {
            return Err(out_of_range);
        }

        let new_applied = new_effective - snapshot.base_minutes;
        Ok(ReducePlan {
            new_effective,
            new_applied,
            returned: snapshot.applied_minutes - new_applied,
        })
    }

    /// Check the reset precondition without planning the split
    pub fn check_reset(&self, snapshot: &BudgetSnapshot) -> BudgetResult<()> {
        let needed = self.rules.reset_cost_minutes;
        let available = snapshot.wallet_balance.saturating_add(snapshot.applied_minutes);
        if available < needed {
            return Err(BudgetError::InsufficientEarnedTime { needed, available });
        }
        Ok(())
    }

    /// Draw the reset cost from the wallet first, then from applied minutes
    pub fn plan_reset(&self, snapshot: &BudgetSnapshot) -> BudgetResult<ResetPlan> {
        self.check_reset(snapshot)?;

        let cost = self.rules.reset_cost_minutes;
        let from_wallet = snapshot.wallet_balance.min(cost);
        let from_applied = cost - from_wallet;

        Ok(ResetPlan {
            from_wallet,
            from_applied,
            new_applied: snapshot.applied_minutes - from_applied,
            new_wallet_balance: snapshot.wallet_balance - from_wallet,
        })
    }
}

/// "1h 30m" or "45m"
pub fn format_minutes(minutes: u32) -> String {
    if minutes >= 60 {
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else {
        format!("{}m", minutes)
    }
}
