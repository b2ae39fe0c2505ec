use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::budget::error::{AdRefusal, BudgetError, BudgetResult};

/// Operations that may need a completed rewarded ad before they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardedAction {
    /// Turn on the kids screen-lock feature
    LockScreen,
    /// Raise the base daily limit
    RaiseBase,
    /// Move wallet minutes into today's limit
    ApplyEarned,
    /// Reset today's usage
    ResetDay,
    /// Credit reward minutes to the wallet
    EarnReward,
}

impl fmt::Display for GuardedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardedAction::LockScreen => "lock screen",
            GuardedAction::RaiseBase => "raise base limit",
            GuardedAction::ApplyEarned => "apply earned time",
            GuardedAction::ResetDay => "reset today",
            GuardedAction::EarnReward => "earn reward",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdOutcome {
    Granted,
    Dismissed,
}

/// The ad network, as seen by the reward gate
pub trait AdProvider: Send + Sync {
    fn is_rewarded_ad_ready(&self) -> bool;

    fn is_ad_currently_loading(&self) -> bool;

    /// Show a rewarded ad, loading it first if needed
    fn request_rewarded_ad(&self) -> impl Future<Output = AdOutcome> + Send;
}

impl<T: AdProvider> AdProvider for Arc<T> {
    fn is_rewarded_ad_ready(&self) -> bool {
        (**self).is_rewarded_ad_ready()
    }

    fn is_ad_currently_loading(&self) -> bool {
        (**self).is_ad_currently_loading()
    }

    fn request_rewarded_ad(&self) -> impl Future<Output = AdOutcome> + Send {
        (**self).request_rewarded_ad()
    }
}

/// Operational escape hatch for store reviewers and testing
pub trait ReviewerOverride: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Session-only reviewer unlock; never persisted
#[derive(Debug, Default)]
pub struct SessionReviewerUnlock {
    active: AtomicBool,
}

impl SessionReviewerUnlock {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
        }
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl ReviewerOverride for SessionReviewerUnlock {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantSource {
    /// A rewarded ad completed
    Ad,
    /// The reviewer override was active
    Reviewer,
    /// The action is not gated under the current policy
    NotRequired,
}

/// Single-use permission to run one guarded action
///
/// Only the gate can mint one. It is consumed by value, so a single ad
/// view never funds two operations.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a grant unlocks exactly one action"]
pub struct RewardGrant {
    action: GuardedAction,
    source: GrantSource,
}

impl RewardGrant {
    pub fn action(&self) -> GuardedAction {
        self.action
    }

    pub fn source(&self) -> GrantSource {
        self.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStatus {
    pub ready: bool,
    pub loading: bool,
}

/// Decides whether an action needs a rewarded ad and runs the ad when it does
pub struct RewardGate<A> {
    ads: A,
    reviewer: Arc<dyn ReviewerOverride>,
    gated: Vec<GuardedAction>,
    timeout: Duration,
    states: Mutex<HashMap<GuardedAction, GateState>>,
}

impl<A: AdProvider> RewardGate<A> {
    pub fn new(
        ads: A,
        reviewer: Arc<dyn ReviewerOverride>,
        gated: Vec<GuardedAction>,
        timeout: Duration,
    ) -> Self {
        Self {
            ads,
            reviewer,
            gated,
            timeout,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Earning wallet time is always gated
    pub fn requires_ad(&self, action: GuardedAction) -> bool {
        action == GuardedAction::EarnReward || self.gated.contains(&action)
    }

    pub fn ad_status(&self) -> AdStatus {
        AdStatus {
            ready: self.ads.is_rewarded_ad_ready(),
            loading: self.ads.is_ad_currently_loading(),
        }
    }

    pub async fn state(&self, action: GuardedAction) -> GateState {
        self.states
            .lock()
            .await
            .get(&action)
            .copied()
            .unwrap_or(GateState::Locked)
    }

    /// Obtain a grant for `action`, showing a rewarded ad if the policy asks for one
    ///
    /// A dismissed or timed-out ad leaves the gate locked.
    pub async fn unlock(&self, action: GuardedAction) -> BudgetResult<RewardGrant> {
        if self.reviewer.is_active() {
            debug!("Reviewer override active, skipping ad for {}", action);
            return Ok(RewardGrant {
                action,
                source: GrantSource::Reviewer,
            });
        }

        if !self.requires_ad(action) {
            return Ok(RewardGrant {
                action,
                source: GrantSource::NotRequired,
            });
        }

        let status = self.ad_status();
        if !status.ready {
            debug!(
                "Rewarded ad not ready for {} (loading: {}), waiting up to {:?}",
                action, status.loading, self.timeout
            );
        }

        let outcome = tokio::time::timeout(self.timeout, self.ads.request_rewarded_ad()).await;
        match outcome {
            Ok(AdOutcome::Granted) => {
                self.states.lock().await.insert(action, GateState::Unlocked);
                info!("Rewarded ad granted for {}", action);
                Ok(RewardGrant {
                    action,
                    source: GrantSource::Ad,
                })
            }
            Ok(AdOutcome::Dismissed) => {
                warn!("Rewarded ad dismissed for {}", action);
                Err(BudgetError::AdNotGranted(AdRefusal::Dismissed))
            }
            Err(_) => {
                warn!("Rewarded ad for {} timed out after {:?}", action, self.timeout);
                Err(BudgetError::AdNotGranted(AdRefusal::TimedOut))
            }
        }
    }

    /// Spend a grant once its action has run; the gate locks again
    pub async fn consume(&self, grant: RewardGrant) {
        if grant.source == GrantSource::Ad {
            self.states.lock().await.insert(grant.action, GateState::Locked);
        }
    }
}

/// Scripted ad outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdScript {
    Grant,
    Dismiss,
    /// Never completes; exercises the timeout
    Hang,
}

/// Ad provider that replays a script, for the CLI and for tests
#[derive(Debug)]
pub struct ScriptedAdProvider {
    queue: std::sync::Mutex<VecDeque<AdScript>>,
    fallback: AdScript,
    requests: AtomicUsize,
}

impl ScriptedAdProvider {
    /// Every request resolves to `outcome`
    pub fn always(outcome: AdScript) -> Self {
        Self::with_queue(Vec::new(), outcome)
    }

    /// Play `queue` in order, then `fallback` forever
    pub fn with_queue(queue: Vec<AdScript>, fallback: AdScript) -> Self {
        Self {
            queue: std::sync::Mutex::new(queue.into()),
            fallback,
            requests: AtomicUsize::new(0),
        }
    }

    /// Number of ads shown so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> AdScript {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.pop_front().unwrap_or(self.fallback)
    }
}

impl AdProvider for ScriptedAdProvider {
    fn is_rewarded_ad_ready(&self) -> bool {
        true
    }

    fn is_ad_currently_loading(&self) -> bool {
        false
    }

    fn request_rewarded_ad(&self) -> impl Future<Output = AdOutcome> + Send {
        let script = self.next_script();
        async move {
            match script {
                AdScript::Grant => AdOutcome::Granted,
                AdScript::Dismiss => AdOutcome::Dismissed,
                AdScript::Hang => std::future::pending::<AdOutcome>().await,
            }
        }
    }
}
