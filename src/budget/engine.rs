use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::budget::clock::Clock;
use crate::budget::config::{validate_config, BudgetConfig};
use crate::budget::error::{BudgetError, BudgetResult};
use crate::budget::gate::{
    AdProvider, AdStatus, GuardedAction, ReviewerOverride, RewardGate, RewardGrant,
};
use crate::budget::reconciler::{
    ApplyPlan, BaseChange, LimitReconciler, ReconcileReport, ResetReport,
};
use crate::budget::state::{BudgetStore, DayRecord, LedgerRecord, UsageRecord};

/// Who is looking at the player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewingContext {
    Kids,
    /// Parents are never limited
    Parent,
}

/// Everything the settings surface shows in one consistent read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetStatus {
    pub day: NaiveDate,
    pub enabled: bool,
    pub base_minutes: u32,
    pub applied_minutes: u32,
    pub effective_minutes: u32,
    pub wallet_balance: u32,
    pub used_minutes: u32,
    pub remaining_minutes: u32,
    pub exceeded: bool,
    pub screen_lock_hours_remaining: i64,
    pub usage_display: String,
}

/// Daily watch-time budget and earned-time wallet
///
/// Economic state (limits, wallet, screen lock) and today's usage sit
/// behind separate locks so playback progress never waits on a
/// reconciliation. When both are needed the ledger is locked first.
pub struct WatchTimeEngine<A> {
    config: BudgetConfig,
    reconciler: LimitReconciler,
    clock: Arc<dyn Clock>,
    store: Arc<dyn BudgetStore>,
    gate: RewardGate<A>,
    ledger: Mutex<LedgerRecord>,
    usage: Mutex<UsageRecord>,
}

impl<A: AdProvider> WatchTimeEngine<A> {
    /// Load persisted state and build the engine
    pub fn open(
        config: BudgetConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn BudgetStore>,
        ads: A,
        reviewer: Arc<dyn ReviewerOverride>,
    ) -> anyhow::Result<Self> {
        validate_config(&config).context("Invalid budget configuration")?;

        let today = clock.today();
        let rules = config.rules;

        let mut ledger = store
            .load_ledger()
            .context("Failed to load budget ledger")?
            .unwrap_or_else(|| LedgerRecord::new(today, &rules));

        let dropped = ledger.limits.normalize(&rules);
        if dropped > 0 {
            warn!(
                "Stored limits exceeded the {} minute cap, returned {} applied minutes to the wallet",
                rules.max_daily_minutes, dropped
            );
            ledger.wallet.credit_return(dropped, clock.now());
        }

        let usage = store
            .load_usage()
            .context("Failed to load usage record")?
            .unwrap_or_else(|| UsageRecord::new(today));

        let gate = RewardGate::new(
            ads,
            reviewer,
            config.gated_actions.clone(),
            config.ad_timeout(),
        );

        Ok(Self {
            reconciler: LimitReconciler::new(rules),
            config,
            clock,
            store,
            gate,
            ledger: Mutex::new(ledger),
            usage: Mutex::new(usage),
        })
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn gate(&self) -> &RewardGate<A> {
        &self.gate
    }

    // Rollover and expiry

    /// Apply any pending day rollover and wallet expiry to both records
    ///
    /// Returns true if anything changed. A second call on the same day is a no-op.
    pub async fn check_rollover(&self) -> bool {
        let mut ledger = self.ledger.lock().await;
        let mut usage = self.usage.lock().await;
        let ledger_changed = self.refresh_ledger(&mut ledger);
        let usage_changed = self.refresh_usage(&mut usage);
        ledger_changed || usage_changed
    }

    fn refresh_ledger(&self, ledger: &mut LedgerRecord) -> bool {
        let today = self.clock.today();
        let rolled = ledger.roll_over(today);
        if rolled {
            info!(
                "New day {}: wallet and applied minutes cleared, base limit stays {} minutes",
                today, ledger.limits.base_minutes
            );
        }

        let expired = ledger
            .wallet
            .prune_expired(self.clock.now(), self.config.wallet_entry_ttl());

        let changed = rolled || expired > 0;
        if changed {
            if let Err(e) = self.store.save_ledger(ledger) {
                warn!("Failed to persist ledger rollover: {:#}", e);
            }
        }
        changed
    }

    fn refresh_usage(&self, usage: &mut UsageRecord) -> bool {
        let today = self.clock.today();
        if !usage.roll_over(today) {
            return false;
        }

        debug!("Usage rolled over to {}", today);
        if let Err(e) = self.store.save_usage(usage) {
            warn!("Failed to persist usage rollover: {:#}", e);
        }
        true
    }

    async fn lock_ledger(&self) -> MutexGuard<'_, LedgerRecord> {
        let mut ledger = self.ledger.lock().await;
        self.refresh_ledger(&mut ledger);
        ledger
    }

    async fn lock_usage(&self) -> MutexGuard<'_, UsageRecord> {
        let mut usage = self.usage.lock().await;
        self.refresh_usage(&mut usage);
        usage
    }

    // Commit helpers. Memory only changes after the store accepted the write.

    fn commit_ledger(&self, current: &mut LedgerRecord, shadow: LedgerRecord) -> BudgetResult<()> {
        self.store
            .save_ledger(&shadow)
            .map_err(BudgetError::Persistence)?;
        *current = shadow;
        Ok(())
    }

    fn commit_both(
        &self,
        ledger: &mut LedgerRecord,
        ledger_shadow: LedgerRecord,
        usage: &mut UsageRecord,
        usage_shadow: UsageRecord,
    ) -> BudgetResult<()> {
        self.store
            .save_ledger(&ledger_shadow)
            .map_err(BudgetError::Persistence)?;

        if let Err(e) = self.store.save_usage(&usage_shadow) {
            if let Err(restore) = self.store.save_ledger(ledger) {
                warn!("Failed to restore ledger after usage write failure: {:#}", restore);
            }
            return Err(BudgetError::Persistence(e));
        }

        *ledger = ledger_shadow;
        *usage = usage_shadow;
        Ok(())
    }

    // Queries

    pub async fn effective_limit_minutes(&self) -> u32 {
        self.lock_ledger().await.limits.effective_minutes()
    }

    pub async fn used_minutes_today(&self) -> u32 {
        self.lock_usage().await.ledger.used_minutes()
    }

    pub async fn wallet_balance(&self) -> u32 {
        self.lock_ledger().await.wallet.balance()
    }

    pub async fn applied_minutes_today(&self) -> u32 {
        self.lock_ledger().await.limits.applied_minutes
    }

    pub async fn is_enabled(&self) -> bool {
        self.lock_ledger().await.limits.enabled
    }

    /// True when a child has used up today's effective limit
    pub async fn is_exceeded(&self, context: ViewingContext) -> bool {
        let (limit, enabled) = {
            let ledger = self.lock_ledger().await;
            (ledger.limits.effective_minutes(), ledger.limits.enabled)
        };
        let enforced = enabled && context == ViewingContext::Kids;
        self.lock_usage().await.ledger.is_exceeded(limit, enforced)
    }

    pub async fn remaining_minutes(&self) -> u32 {
        let limit = self.effective_limit_minutes().await;
        self.lock_usage().await.ledger.remaining_minutes(limit)
    }

    pub async fn status(&self) -> BudgetStatus {
        let ledger = self.lock_ledger().await;
        let usage = self.lock_usage().await;
        let effective = ledger.limits.effective_minutes();

        BudgetStatus {
            day: ledger.day,
            enabled: ledger.limits.enabled,
            base_minutes: ledger.limits.base_minutes,
            applied_minutes: ledger.limits.applied_minutes,
            effective_minutes: effective,
            wallet_balance: ledger.wallet.balance(),
            used_minutes: usage.ledger.used_minutes(),
            remaining_minutes: usage.ledger.remaining_minutes(effective),
            exceeded: usage.ledger.is_exceeded(effective, ledger.limits.enabled),
            screen_lock_hours_remaining: ledger.screen_lock_hours_remaining(self.clock.now()),
            usage_display: usage.ledger.display(effective),
        }
    }

    /// Finished days, most recent first
    pub async fn history(&self, days: usize) -> Vec<DayRecord> {
        let usage = self.lock_usage().await;
        usage.history.iter().take(days).cloned().collect()
    }

    pub async fn is_screen_lock_enabled(&self) -> bool {
        self.lock_ledger().await.screen_lock_enabled(self.clock.now())
    }

    pub async fn screen_lock_remaining_hours(&self) -> i64 {
        self.lock_ledger()
            .await
            .screen_lock_hours_remaining(self.clock.now())
    }

    pub fn ad_status(&self) -> AdStatus {
        self.gate.ad_status()
    }

    // Commands

    /// Record playback progress; never fails
    pub async fn add_used(&self, elapsed_millis: u64) {
        let mut usage = self.lock_usage().await;
        usage.ledger.add_used(elapsed_millis);
        if let Err(e) = self.store.save_usage(&usage) {
            warn!("Failed to persist usage: {:#}", e);
        }
    }

    pub async fn set_enabled(&self, enabled: bool) -> BudgetResult<()> {
        let mut ledger = self.lock_ledger().await;
        let mut shadow = ledger.clone();
        shadow.limits.enabled = enabled;
        self.commit_ledger(&mut ledger, shadow)?;

        info!("Daily limit {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Change the base limit, reconciling applied minutes and the wallet
    ///
    /// Raising the base is paid from the wallet and may need a rewarded ad.
    /// The request is rejected before any ad is shown when the wallet cannot
    /// cover it.
    pub async fn set_base_limit(&self, new_base: u32) -> BudgetResult<ReconcileReport> {
        let preflight = {
            let ledger = self.lock_ledger().await;
            self.reconciler.plan_base_change(&ledger.snapshot(), new_base)
        };
        let preflight = match preflight {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Base limit change to {} rejected: {}", new_base, e);
                return Err(e);
            }
        };

        let grant = match preflight.change {
            BaseChange::Increase => Some(self.gate.unlock(GuardedAction::RaiseBase).await?),
            BaseChange::Decrease | BaseChange::Unchanged => None,
        };

        let result = self.commit_base_change(new_base, preflight.change).await;
        if let Some(grant) = grant {
            self.gate.consume(grant).await;
        }

        match &result {
            Ok(report) => info!("{}", report.summary(self.config.rules.max_daily_minutes)),
            Err(e) => warn!("Base limit change to {} failed: {}", new_base, e),
        }
        result
    }

    async fn commit_base_change(
        &self,
        new_base: u32,
        expected: BaseChange,
    ) -> BudgetResult<ReconcileReport> {
        let mut ledger = self.lock_ledger().await;
        let before = ledger.snapshot();
        let plan = self.reconciler.plan_base_change(&before, new_base)?;

        // An increase must have gone through the gate
        if plan.change != expected {
            return Err(BudgetError::StateChanged);
        }

        let mut shadow = ledger.clone();
        shadow.wallet.debit(plan.debit)?;
        shadow.wallet.credit_return(plan.returned, self.clock.now());
        shadow.limits.base_minutes = plan.new_base;
        shadow.limits.applied_minutes = plan.new_applied;

        let reset_usage =
            plan.change != BaseChange::Unchanged && self.config.reset_usage_on_base_change;
        if reset_usage {
            let mut usage = self.lock_usage().await;
            let mut usage_shadow = usage.clone();
            usage_shadow.ledger.clear();
            self.commit_both(&mut ledger, shadow, &mut usage, usage_shadow)?;
            debug!("Usage reset after base limit change");
        } else if plan.change != BaseChange::Unchanged {
            self.commit_ledger(&mut ledger, shadow)?;
        }

        Ok(ReconcileReport {
            new_base: plan.new_base,
            new_applied: plan.new_applied,
            new_wallet_balance: plan.new_wallet_balance(&before),
            debited_from_wallet: plan.debit,
            returned_to_wallet: plan.returned,
            auto_adjusted: plan.auto_adjusted,
        })
    }

    /// Move `amount` wallet minutes into today's limit
    pub async fn apply_earned_time(&self, amount: u32) -> BudgetResult<ApplyPlan> {
        {
            let ledger = self.lock_ledger().await;
            if let Err(e) = self.reconciler.plan_apply(&ledger.snapshot(), amount) {
                warn!("Applying {} earned minutes rejected: {}", amount, e);
                return Err(e);
            }
        }

        let grant = self.gate.unlock(GuardedAction::ApplyEarned).await?;
        let result = self.commit_apply(amount).await;
        self.gate.consume(grant).await;

        match &result {
            Ok(plan) => info!(
                "Applied {} earned minutes, wallet now {} minutes",
                plan.amount, plan.new_wallet_balance
            ),
            Err(e) => warn!("Applying {} earned minutes failed: {}", amount, e),
        }
        result
    }

    async fn commit_apply(&self, amount: u32) -> BudgetResult<ApplyPlan> {
        let mut ledger = self.lock_ledger().await;
        let plan = self.reconciler.plan_apply(&ledger.snapshot(), amount)?;

        let mut shadow = ledger.clone();
        shadow.wallet.debit(plan.amount)?;
        shadow.limits.applied_minutes = plan.new_applied;
        self.commit_ledger(&mut ledger, shadow)?;

        Ok(plan)
    }

    /// Give applied minutes back to the wallet until the effective limit is `new_effective`
    ///
    /// The base limit stays put. No ad is needed since nothing is spent.
    pub async fn reduce_effective_time(
        &self,
        new_effective: u32,
    ) -> BudgetResult<ReconcileReport> {
        let mut ledger = self.lock_ledger().await;
        let before = ledger.snapshot();
        let plan = match self.reconciler.plan_reduce(&before, new_effective) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Reducing effective limit to {} rejected: {}", new_effective, e);
                return Err(e);
            }
        };

        let mut shadow = ledger.clone();
        shadow.wallet.credit_return(plan.returned, self.clock.now());
        shadow.limits.applied_minutes = plan.new_applied;
        self.commit_ledger(&mut ledger, shadow)?;

        info!(
            "Effective limit reduced to {} minutes, {} minutes returned to wallet",
            plan.new_effective, plan.returned
        );
        Ok(ReconcileReport {
            new_base: before.base_minutes,
            new_applied: plan.new_applied,
            new_wallet_balance: before.wallet_balance + plan.returned,
            debited_from_wallet: 0,
            returned_to_wallet: plan.returned,
            auto_adjusted: false,
        })
    }

    /// Show a rewarded ad and credit the reward on completion
    pub async fn earn_reward(&self) -> BudgetResult<u32> {
        let grant = self.gate.unlock(GuardedAction::EarnReward).await?;
        self.credit_wallet(grant).await
    }

    /// Credit the reward for a completed ad; returns the new balance
    pub async fn credit_wallet(&self, grant: RewardGrant) -> BudgetResult<u32> {
        let actual = grant.action();
        if actual != GuardedAction::EarnReward {
            self.gate.consume(grant).await;
            return Err(BudgetError::GrantMismatch {
                expected: GuardedAction::EarnReward,
                actual,
            });
        }

        let result = self.commit_credit().await;
        self.gate.consume(grant).await;

        if let Ok(balance) = result {
            info!(
                "Credited {} minutes to wallet, balance {} minutes",
                self.config.rules.reward_minutes, balance
            );
        }
        result
    }

    async fn commit_credit(&self) -> BudgetResult<u32> {
        let mut ledger = self.lock_ledger().await;
        let mut shadow = ledger.clone();
        shadow
            .wallet
            .credit(self.config.rules.reward_minutes, self.clock.now());
        self.commit_ledger(&mut ledger, shadow)?;
        Ok(ledger.wallet.balance())
    }

    /// Spend earned time to give the child a fresh day
    ///
    /// The cost comes out of the wallet first and then out of applied
    /// minutes. The base limit is kept and today's usage goes back to zero.
    pub async fn reset_today(&self) -> BudgetResult<ResetReport> {
        {
            let ledger = self.lock_ledger().await;
            if let Err(e) = self.reconciler.check_reset(&ledger.snapshot()) {
                warn!("Daily reset rejected: {}", e);
                return Err(e);
            }
        }

        let grant = self.gate.unlock(GuardedAction::ResetDay).await?;
        let result = self.commit_reset().await;
        self.gate.consume(grant).await;

        match &result {
            Ok(report) => info!("{}", report.summary(self.config.rules.default_base_minutes)),
            Err(e) => warn!("Daily reset failed: {}", e),
        }
        result
    }

    async fn commit_reset(&self) -> BudgetResult<ResetReport> {
        let mut ledger = self.lock_ledger().await;
        let mut usage = self.lock_usage().await;

        // Re-checked against fresh state; the ad may have taken a while
        let plan = self.reconciler.plan_reset(&ledger.snapshot())?;

        let mut shadow = ledger.clone();
        shadow.wallet.debit(plan.from_wallet)?;
        shadow.limits.applied_minutes = plan.new_applied;

        let mut usage_shadow = usage.clone();
        usage_shadow.ledger.clear();

        let effective_limit = shadow.limits.effective_minutes();
        self.commit_both(&mut ledger, shadow, &mut usage, usage_shadow)?;

        Ok(ResetReport {
            from_wallet: plan.from_wallet,
            from_applied: plan.from_applied,
            new_wallet_balance: plan.new_wallet_balance,
            new_applied: plan.new_applied,
            effective_limit,
        })
    }

    /// Turn on the kids screen-lock feature for a day; returns when it lapses
    pub async fn enable_screen_lock(&self) -> BudgetResult<DateTime<Utc>> {
        let grant = self.gate.unlock(GuardedAction::LockScreen).await?;
        let result = self.commit_screen_lock().await;
        self.gate.consume(grant).await;

        if let Ok(expires) = &result {
            info!("Screen lock enabled until {}", expires);
        }
        result
    }

    async fn commit_screen_lock(&self) -> BudgetResult<DateTime<Utc>> {
        let mut ledger = self.lock_ledger().await;
        let now = self.clock.now();

        let mut shadow = ledger.clone();
        shadow.screen_lock_granted_at = Some(now);
        self.commit_ledger(&mut ledger, shadow)?;

        Ok(now + ledger.screen_lock_remaining(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::clock::ManualClock;
    use crate::budget::config::BudgetRules;
    use crate::budget::error::AdRefusal;
    use crate::budget::gate::{
        AdOutcome, AdScript, GateState, ScriptedAdProvider, SessionReviewerUnlock,
    };
    use crate::budget::state::MemoryStore;
    use chrono::{Duration, TimeZone};
    use std::future::Future;
    use std::pin::Pin;

    type Engine = WatchTimeEngine<Arc<ScriptedAdProvider>>;

    struct Harness {
        engine: Engine,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        ads: Arc<ScriptedAdProvider>,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 16, 10, 0, 0).unwrap()
    }

    fn ledger(base: u32, applied: u32, wallet: u32) -> LedgerRecord {
        let mut record = LedgerRecord::new(start().date_naive(), &BudgetRules::default());
        record.limits.base_minutes = base;
        record.limits.applied_minutes = applied;
        record.limits.enabled = true;
        record.wallet.credit(wallet, start());
        record
    }

    fn harness_with(
        config: BudgetConfig,
        seed: Option<LedgerRecord>,
        script: AdScript,
        reviewer: bool,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(MemoryStore::with_records(seed, None));
        let ads = Arc::new(ScriptedAdProvider::always(script));
        let engine = WatchTimeEngine::open(
            config,
            clock.clone(),
            store.clone(),
            ads.clone(),
            Arc::new(SessionReviewerUnlock::new(reviewer)),
        )
        .unwrap();

        Harness {
            engine,
            clock,
            store,
            ads,
        }
    }

    fn harness(seed: LedgerRecord) -> Harness {
        harness_with(BudgetConfig::default(), Some(seed), AdScript::Grant, false)
    }

    async fn triple<A: AdProvider>(engine: &WatchTimeEngine<A>) -> (u32, u32, u32) {
        let status = engine.status().await;
        (status.base_minutes, status.applied_minutes, status.wallet_balance)
    }

    fn stored(store: &MemoryStore) -> (u32, u32, u32) {
        let record = store.ledger().unwrap();
        (
            record.limits.base_minutes,
            record.limits.applied_minutes,
            record.wallet.balance(),
        )
    }

    type Hook = Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Grants every ad, running a queued hook while the next one is on screen
    #[derive(Default)]
    struct InterleavedAdProvider {
        during_ad: std::sync::Mutex<Option<Hook>>,
    }

    impl InterleavedAdProvider {
        fn during_next_ad(&self, hook: impl Future<Output = ()> + Send + 'static) {
            *self.during_ad.lock().unwrap() = Some(Box::pin(hook));
        }
    }

    impl AdProvider for InterleavedAdProvider {
        fn is_rewarded_ad_ready(&self) -> bool {
            true
        }

        fn is_ad_currently_loading(&self) -> bool {
            false
        }

        fn request_rewarded_ad(&self) -> impl Future<Output = AdOutcome> + Send {
            let hook = self.during_ad.lock().unwrap().take();
            async move {
                if let Some(hook) = hook {
                    hook.await;
                }
                AdOutcome::Granted
            }
        }
    }

    type InterleavedEngine = WatchTimeEngine<Arc<InterleavedAdProvider>>;

    fn interleaved(
        config: BudgetConfig,
        seed: LedgerRecord,
    ) -> (Arc<InterleavedEngine>, Arc<InterleavedAdProvider>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_records(Some(seed), None));
        let ads = Arc::new(InterleavedAdProvider::default());
        let engine = WatchTimeEngine::open(
            config,
            Arc::new(ManualClock::new(start())),
            store.clone(),
            ads.clone(),
            Arc::new(SessionReviewerUnlock::new(false)),
        )
        .unwrap();
        (Arc::new(engine), ads, store)
    }

    #[tokio::test]
    async fn test_fresh_engine_defaults() {
        let h = harness_with(BudgetConfig::default(), None, AdScript::Grant, false);
        assert_eq!(h.engine.effective_limit_minutes().await, 60);
        assert_eq!(h.engine.wallet_balance().await, 0);
        assert!(!h.engine.is_enabled().await);
        assert!(!h.engine.is_screen_lock_enabled().await);
    }

    #[tokio::test]
    async fn test_raise_without_wallet_rejected_before_ad() {
        let h = harness(ledger(60, 0, 0));

        let err = h.engine.set_base_limit(90).await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::InsufficientWallet { needed: 30, available: 0 }
        ));
        assert_eq!(h.ads.requests(), 0);
        assert_eq!(triple(&h.engine).await, (60, 0, 0));
    }

    #[tokio::test]
    async fn test_raise_funded_by_wallet() {
        let h = harness(ledger(60, 0, 30));

        let report = h.engine.set_base_limit(90).await.unwrap();
        assert_eq!(report.new_base, 90);
        assert_eq!(report.new_wallet_balance, 0);
        assert_eq!(report.debited_from_wallet, 30);
        assert_eq!(h.ads.requests(), 1);

        assert_eq!(triple(&h.engine).await, (90, 0, 0));
        assert_eq!(h.engine.effective_limit_minutes().await, 90);

        let stored = h.store.ledger().unwrap();
        assert_eq!(stored.limits.base_minutes, 90);
        assert_eq!(stored.wallet.balance(), 0);
        assert_eq!(
            h.engine.gate().state(GuardedAction::RaiseBase).await,
            GateState::Locked
        );
    }

    #[tokio::test]
    async fn test_lower_base_returns_paid_and_applied() {
        let h = harness(ledger(90, 20, 10));

        let report = h.engine.set_base_limit(60).await.unwrap();
        assert_eq!(report.returned_to_wallet, 50);
        assert!(!report.auto_adjusted);
        assert_eq!(h.ads.requests(), 0);
        assert_eq!(triple(&h.engine).await, (60, 0, 60));
    }

    #[tokio::test]
    async fn test_apply_over_cap_rejected() {
        let h = harness(ledger(170, 0, 50));

        let err = h.engine.apply_earned_time(20).await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::CapExceeded { requested: 190, max: 180 }
        ));
        assert_eq!(h.ads.requests(), 0);
        assert_eq!(triple(&h.engine).await, (170, 0, 50));
    }

    #[tokio::test]
    async fn test_apply_earned_time() {
        let h = harness(ledger(60, 0, 45));

        let plan = h.engine.apply_earned_time(30).await.unwrap();
        assert_eq!(plan.new_applied, 30);
        assert_eq!(triple(&h.engine).await, (60, 30, 15));
        assert_eq!(h.engine.effective_limit_minutes().await, 90);
    }

    #[tokio::test]
    async fn test_reduce_effective_time_returns_applied() {
        let h = harness(ledger(60, 45, 15));

        let report = h.engine.reduce_effective_time(80).await.unwrap();
        assert_eq!(report.new_base, 60);
        assert_eq!(report.new_applied, 20);
        assert_eq!(report.returned_to_wallet, 25);
        assert_eq!(report.new_wallet_balance, 40);
        assert_eq!(report.effective_minutes(), 80);
        assert_eq!(h.ads.requests(), 0);

        assert_eq!(triple(&h.engine).await, (60, 20, 40));
        assert_eq!(stored(&h.store), (60, 20, 40));
    }

    #[tokio::test]
    async fn test_reduce_effective_time_rejected_leaves_state() {
        let h = harness(ledger(60, 45, 15));

        for target in [59, 105, 150] {
            let err = h.engine.reduce_effective_time(target).await.unwrap_err();
            assert!(matches!(err, BudgetError::InvalidRange { .. }));
        }
        assert_eq!(triple(&h.engine).await, (60, 45, 15));
        assert_eq!(stored(&h.store), (60, 45, 15));

        h.store.set_fail_ledger_writes(true);
        let err = h.engine.reduce_effective_time(80).await.unwrap_err();
        assert!(matches!(err, BudgetError::Persistence(_)));
        assert_eq!(triple(&h.engine).await, (60, 45, 15));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut config = BudgetConfig::default();
        config.rules.max_daily_minutes = 0;

        let result = WatchTimeEngine::open(
            config,
            Arc::new(ManualClock::new(start())),
            Arc::new(MemoryStore::with_records(Some(ledger(60, 0, 0)), None)),
            Arc::new(ScriptedAdProvider::always(AdScript::Grant)),
            Arc::new(SessionReviewerUnlock::new(false)),
        );
        let err = match result {
            Ok(_) => panic!("engine opened with a zero daily maximum"),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("max_daily_minutes"));
    }

    #[tokio::test]
    async fn test_exceeded_at_limit() {
        let h = harness(ledger(60, 0, 0));

        h.engine.add_used(59 * 60_000).await;
        assert!(!h.engine.is_exceeded(ViewingContext::Kids).await);

        h.engine.add_used(60_000).await;
        assert!(h.engine.is_exceeded(ViewingContext::Kids).await);
        assert!(!h.engine.is_exceeded(ViewingContext::Parent).await);
        assert_eq!(h.engine.remaining_minutes().await, 0);

        h.engine.set_enabled(false).await.unwrap();
        assert!(!h.engine.is_exceeded(ViewingContext::Kids).await);
    }

    #[tokio::test]
    async fn test_earn_reward_credits_wallet() {
        let h = harness(ledger(60, 0, 0));

        assert_eq!(h.engine.earn_reward().await.unwrap(), 15);
        assert_eq!(h.engine.earn_reward().await.unwrap(), 30);
        assert_eq!(h.ads.requests(), 2);
    }

    #[tokio::test]
    async fn test_dismissed_ad_credits_nothing() {
        let h = harness_with(
            BudgetConfig::default(),
            Some(ledger(60, 0, 0)),
            AdScript::Dismiss,
            false,
        );

        let err = h.engine.earn_reward().await.unwrap_err();
        assert!(matches!(err, BudgetError::AdNotGranted(AdRefusal::Dismissed)));
        assert_eq!(h.engine.wallet_balance().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_ad_times_out() {
        let h = harness_with(
            BudgetConfig::default(),
            Some(ledger(60, 0, 30)),
            AdScript::Hang,
            false,
        );

        let err = h.engine.set_base_limit(90).await.unwrap_err();
        assert!(matches!(err, BudgetError::AdNotGranted(AdRefusal::TimedOut)));
        assert_eq!(triple(&h.engine).await, (60, 0, 30));
    }

    #[tokio::test]
    async fn test_reviewer_skips_ads() {
        let h = harness_with(
            BudgetConfig::default(),
            Some(ledger(60, 0, 0)),
            AdScript::Dismiss,
            true,
        );

        assert_eq!(h.engine.earn_reward().await.unwrap(), 15);
        assert_eq!(h.ads.requests(), 0);
    }

    #[tokio::test]
    async fn test_foreign_grant_cannot_credit_wallet() {
        let h = harness(ledger(60, 0, 0));

        let grant = h.engine.gate().unlock(GuardedAction::ResetDay).await.unwrap();
        let err = h.engine.credit_wallet(grant).await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::GrantMismatch {
                expected: GuardedAction::EarnReward,
                actual: GuardedAction::ResetDay
            }
        ));
        assert_eq!(h.engine.wallet_balance().await, 0);
        assert_eq!(
            h.engine.gate().state(GuardedAction::ResetDay).await,
            GateState::Locked
        );
    }

    #[tokio::test]
    async fn test_reset_rejected_before_ad() {
        let h = harness(ledger(60, 20, 30));

        let err = h.engine.reset_today().await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::InsufficientEarnedTime { needed: 60, available: 50 }
        ));
        assert_eq!(h.ads.requests(), 0);
    }

    #[tokio::test]
    async fn test_reset_draws_wallet_then_applied() {
        let h = harness(ledger(60, 45, 30));
        h.engine.add_used(100 * 60_000).await;
        assert!(h.engine.is_exceeded(ViewingContext::Kids).await);

        let report = h.engine.reset_today().await.unwrap();
        assert_eq!(report.from_wallet, 30);
        assert_eq!(report.from_applied, 30);
        assert_eq!(report.effective_limit, 75);

        assert_eq!(triple(&h.engine).await, (60, 15, 0));
        assert_eq!(h.engine.used_minutes_today().await, 0);
        assert!(!h.engine.is_exceeded(ViewingContext::Kids).await);
    }

    #[tokio::test]
    async fn test_base_change_resets_usage() {
        let h = harness(ledger(60, 0, 30));
        h.engine.add_used(20 * 60_000).await;

        h.engine.set_base_limit(90).await.unwrap();
        assert_eq!(h.engine.used_minutes_today().await, 0);
    }

    #[tokio::test]
    async fn test_base_change_keeps_usage_when_configured() {
        let config = BudgetConfig {
            reset_usage_on_base_change: false,
            ..BudgetConfig::default()
        };
        let h = harness_with(config, Some(ledger(60, 0, 30)), AdScript::Grant, false);
        h.engine.add_used(20 * 60_000).await;

        h.engine.set_base_limit(90).await.unwrap();
        assert_eq!(h.engine.used_minutes_today().await, 20);
    }

    #[tokio::test]
    async fn test_rollover_clears_day_scoped_state_once() {
        let h = harness(ledger(90, 20, 45));
        h.engine.add_used(42 * 60_000).await;

        h.clock.advance(Duration::days(1));
        assert!(h.engine.check_rollover().await);
        assert!(!h.engine.check_rollover().await);

        assert_eq!(triple(&h.engine).await, (90, 0, 0));
        assert_eq!(h.engine.used_minutes_today().await, 0);

        let history = h.engine.history(7).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].date, start().date_naive());
        assert_eq!(history[0].used_minutes, 42);
    }

    #[tokio::test]
    async fn test_wallet_entries_expire() {
        let h = harness(ledger(60, 0, 0));
        h.engine.earn_reward().await.unwrap();

        h.clock.advance(Duration::hours(7));
        assert_eq!(h.engine.wallet_balance().await, 15);

        h.clock.advance(Duration::hours(1));
        assert_eq!(h.engine.wallet_balance().await, 0);
    }

    #[tokio::test]
    async fn test_failed_ledger_write_changes_nothing() {
        let h = harness(ledger(60, 0, 30));
        h.store.set_fail_ledger_writes(true);

        let err = h.engine.set_base_limit(90).await.unwrap_err();
        assert!(matches!(err, BudgetError::Persistence(_)));
        assert_eq!(triple(&h.engine).await, (60, 0, 30));
        assert_eq!(
            h.engine.gate().state(GuardedAction::RaiseBase).await,
            GateState::Locked
        );
    }

    #[tokio::test]
    async fn test_failed_usage_write_restores_ledger() {
        let h = harness(ledger(60, 0, 60));
        h.engine.add_used(10 * 60_000).await;
        h.store.set_fail_usage_writes(true);

        let err = h.engine.reset_today().await.unwrap_err();
        assert!(matches!(err, BudgetError::Persistence(_)));

        assert_eq!(triple(&h.engine).await, (60, 0, 60));
        assert_eq!(h.engine.used_minutes_today().await, 10);
        assert_eq!(h.store.ledger().unwrap().wallet.balance(), 60);
    }

    #[tokio::test]
    async fn test_screen_lock_grant_lasts_a_day() {
        let h = harness(ledger(60, 0, 0));

        let expires = h.engine.enable_screen_lock().await.unwrap();
        assert_eq!(expires, start() + Duration::hours(24));
        assert!(h.engine.is_screen_lock_enabled().await);

        h.clock.advance(Duration::minutes(20 * 60 + 30));
        assert_eq!(h.engine.screen_lock_remaining_hours().await, 4);
        assert_eq!(h.engine.status().await.screen_lock_hours_remaining, 4);

        h.clock.advance(Duration::hours(5));
        assert!(!h.engine.is_screen_lock_enabled().await);
    }

    #[tokio::test]
    async fn test_raise_replanned_after_wallet_drained_during_ad() {
        let (engine, ads, store) = interleaved(BudgetConfig::default(), ledger(60, 0, 30));
        let other = engine.clone();
        ads.during_next_ad(async move {
            other.apply_earned_time(30).await.unwrap();
        });

        let err = engine.set_base_limit(90).await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::InsufficientWallet { needed: 30, available: 0 }
        ));

        assert_eq!(triple(&engine).await, (60, 30, 0));
        assert_eq!(stored(&store), (60, 30, 0));
        assert_eq!(
            engine.gate().state(GuardedAction::RaiseBase).await,
            GateState::Locked
        );
    }

    #[tokio::test]
    async fn test_raise_refused_when_base_moved_during_ad() {
        let (engine, ads, store) = interleaved(BudgetConfig::default(), ledger(60, 0, 60));
        let other = engine.clone();
        ads.during_next_ad(async move {
            other.set_base_limit(120).await.unwrap();
        });

        // 90 is now below the base, so the paid increase no longer applies
        let err = engine.set_base_limit(90).await.unwrap_err();
        assert!(matches!(err, BudgetError::StateChanged));

        assert_eq!(triple(&engine).await, (120, 0, 0));
        assert_eq!(stored(&store), (120, 0, 0));
        assert_eq!(
            engine.gate().state(GuardedAction::RaiseBase).await,
            GateState::Locked
        );
    }

    #[tokio::test]
    async fn test_reset_rechecked_after_ad() {
        let config = BudgetConfig {
            reset_usage_on_base_change: false,
            ..BudgetConfig::default()
        };
        let (engine, ads, store) = interleaved(config, ledger(60, 0, 60));
        engine.add_used(10 * 60_000).await;

        let other = engine.clone();
        ads.during_next_ad(async move {
            other.set_base_limit(90).await.unwrap();
        });

        let err = engine.reset_today().await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::InsufficientEarnedTime { needed: 60, available: 30 }
        ));

        assert_eq!(triple(&engine).await, (90, 0, 30));
        assert_eq!(stored(&store), (90, 0, 30));
        assert_eq!(engine.used_minutes_today().await, 10);
        assert_eq!(store.usage().unwrap().ledger.used_minutes(), 10);
        assert_eq!(
            engine.gate().state(GuardedAction::ResetDay).await,
            GateState::Locked
        );
    }

    #[tokio::test]
    async fn test_apply_rechecked_after_concurrent_apply() {
        let (engine, ads, store) = interleaved(BudgetConfig::default(), ledger(150, 0, 45));
        let other = engine.clone();
        ads.during_next_ad(async move {
            other.apply_earned_time(20).await.unwrap();
        });

        let err = engine.apply_earned_time(20).await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::CapExceeded { requested: 190, max: 180 }
        ));

        assert_eq!(triple(&engine).await, (150, 20, 25));
        assert_eq!(stored(&store), (150, 20, 25));
        assert_eq!(
            engine.gate().state(GuardedAction::ApplyEarned).await,
            GateState::Locked
        );
    }

    #[tokio::test]
    async fn test_open_restores_cap_on_bad_record() {
        let mut seed = ledger(150, 0, 0);
        seed.limits.applied_minutes = 50;
        let h = harness(seed);

        assert_eq!(triple(&h.engine).await, (150, 30, 20));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_usage_and_rewards_interleave() {
        let h = harness(ledger(60, 0, 0));
        let engine = Arc::new(h.engine);

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move { engine.add_used(60_000).await }));
        }
        for _ in 0..8 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                engine.earn_reward().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(engine.used_minutes_today().await, 40);
        assert_eq!(engine.wallet_balance().await, 120);
    }
}
