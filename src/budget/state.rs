use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

use crate::budget::clock::DayBoundary;
use crate::budget::config::BudgetRules;
use crate::budget::limits::DailyLimitConfig;
use crate::budget::reconciler::BudgetSnapshot;
use crate::budget::usage::UsageLedger;
use crate::budget::wallet::EarnedTimeWallet;

/// Current state version
const STATE_VERSION: &str = "1.0";

/// Days of usage history kept
pub const HISTORY_DAYS: usize = 90;

/// Hours a screen-lock grant stays valid
pub const SCREEN_LOCK_GRANT_HOURS: i64 = 24;

const LEDGER_FILE: &str = "ledger.json";
const USAGE_FILE: &str = "usage.json";

/// Economic state: limits, wallet and the screen-lock grant
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LedgerRecord {
    pub version: String,
    /// Day the day-scoped fields belong to
    pub day: NaiveDate,
    #[serde(flatten)]
    pub limits: DailyLimitConfig,
    #[serde(default)]
    pub wallet: EarnedTimeWallet,
    #[serde(default)]
    pub screen_lock_granted_at: Option<DateTime<Utc>>,
}

impl LedgerRecord {
    pub fn new(today: NaiveDate, rules: &BudgetRules) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            day: today,
            limits: DailyLimitConfig::new(rules),
            wallet: EarnedTimeWallet::new(),
            screen_lock_granted_at: None,
        }
    }

    /// Clear the wallet and applied minutes if `today` is a new day
    ///
    /// The base limit and the screen-lock grant survive the rollover.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        let wallet = &mut self.wallet;
        let limits = &mut self.limits;
        DayBoundary::roll(&mut self.day, today, |_| {
            wallet.clear();
            limits.applied_minutes = 0;
        })
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            base_minutes: self.limits.base_minutes,
            applied_minutes: self.limits.applied_minutes,
            wallet_balance: self.wallet.balance(),
        }
    }

    pub fn screen_lock_enabled(&self, now: DateTime<Utc>) -> bool {
        self.screen_lock_remaining(now) > Duration::zero()
    }

    pub fn screen_lock_remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.screen_lock_granted_at {
            Some(granted_at) => {
                let expires = granted_at + Duration::hours(SCREEN_LOCK_GRANT_HOURS);
                (expires - now).max(Duration::zero())
            }
            None => Duration::zero(),
        }
    }

    /// Whole hours left on the grant, counting a partly elapsed hour as left
    pub fn screen_lock_hours_remaining(&self, now: DateTime<Utc>) -> i64 {
        match self.screen_lock_granted_at {
            Some(granted_at) if self.screen_lock_enabled(now) => {
                let elapsed = (now - granted_at).num_hours();
                (SCREEN_LOCK_GRANT_HOURS - elapsed).clamp(0, SCREEN_LOCK_GRANT_HOURS)
            }
            _ => 0,
        }
    }
}

/// Today's usage plus the archive of finished days
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub version: String,
    #[serde(flatten)]
    pub ledger: UsageLedger,
    #[serde(default)]
    pub history: Vec<DayRecord>,
}

impl UsageRecord {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            ledger: UsageLedger::new(today),
            history: Vec::new(),
        }
    }

    /// Archive the finished day and start a fresh one
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        match self.ledger.roll_over(today) {
            Some(finished) => {
                self.add_record(DayRecord {
                    date: finished.day,
                    used_minutes: finished.used_minutes(),
                });
                true
            }
            None => false,
        }
    }

    /// Add a day record, most recent first
    pub fn add_record(&mut self, record: DayRecord) {
        self.history.insert(0, record);

        if self.history.len() > HISTORY_DAYS {
            self.history.truncate(HISTORY_DAYS);
        }
    }
}

/// Day record in history
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DayRecord {
    pub date: NaiveDate,
    pub used_minutes: u32,
}

/// Durable storage for the two budget records
///
/// A successful save must be durable before it returns.
pub trait BudgetStore: Send + Sync {
    fn load_ledger(&self) -> Result<Option<LedgerRecord>>;

    fn save_ledger(&self, record: &LedgerRecord) -> Result<()>;

    fn load_usage(&self) -> Result<Option<UsageRecord>>;

    fn save_usage(&self, record: &UsageRecord) -> Result<()>;
}

trait VersionedRecord: Serialize + DeserializeOwned {
    fn version(&self) -> &str;
}

impl VersionedRecord for LedgerRecord {
    fn version(&self) -> &str {
        &self.version
    }
}

impl VersionedRecord for UsageRecord {
    fn version(&self) -> &str {
        &self.version
    }
}

/// JSON files in one directory, each replaced atomically
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    pub fn usage_path(&self) -> PathBuf {
        self.dir.join(USAGE_FILE)
    }
}

fn load_record<T: VersionedRecord>(path: &Path) -> Result<Option<T>> {
    let Some(content) = crate::platform::read_if_exists(path)? else {
        return Ok(None);
    };

    let record: T = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

    if record.version() != STATE_VERSION {
        warn!(
            "State file {} version mismatch (expected {}, got {}). Creating new state.",
            path.display(),
            STATE_VERSION,
            record.version()
        );
        return Ok(None);
    }

    Ok(Some(record))
}

fn save_record<T: VersionedRecord>(path: &Path, record: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(record).context("Failed to serialize state")?;

    crate::platform::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write state file: {}", path.display()))
}

impl BudgetStore for JsonFileStore {
    fn load_ledger(&self) -> Result<Option<LedgerRecord>> {
        load_record(&self.ledger_path())
    }

    fn save_ledger(&self, record: &LedgerRecord) -> Result<()> {
        save_record(&self.ledger_path(), record)
    }

    fn load_usage(&self) -> Result<Option<UsageRecord>> {
        load_record(&self.usage_path())
    }

    fn save_usage(&self, record: &UsageRecord) -> Result<()> {
        save_record(&self.usage_path(), record)
    }
}

/// In-process store, with switchable write failures for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: Mutex<Option<LedgerRecord>>,
    usage: Mutex<Option<UsageRecord>>,
    fail_ledger_writes: AtomicBool,
    fail_usage_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(ledger: Option<LedgerRecord>, usage: Option<UsageRecord>) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            usage: Mutex::new(usage),
            ..Self::default()
        }
    }

    pub fn set_fail_ledger_writes(&self, fail: bool) {
        self.fail_ledger_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_usage_writes(&self, fail: bool) {
        self.fail_usage_writes.store(fail, Ordering::SeqCst);
    }

    /// Last ledger record written
    pub fn ledger(&self) -> Option<LedgerRecord> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Last usage record written
    pub fn usage(&self) -> Option<UsageRecord> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl BudgetStore for MemoryStore {
    fn load_ledger(&self) -> Result<Option<LedgerRecord>> {
        Ok(self.ledger())
    }

    fn save_ledger(&self, record: &LedgerRecord) -> Result<()> {
        if self.fail_ledger_writes.load(Ordering::SeqCst) {
            anyhow::bail!("ledger write refused");
        }
        *self.ledger.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        Ok(())
    }

    fn load_usage(&self) -> Result<Option<UsageRecord>> {
        Ok(self.usage())
    }

    fn save_usage(&self, record: &UsageRecord) -> Result<()> {
        if self.fail_usage_writes.load(Ordering::SeqCst) {
            anyhow::bail!("usage write refused");
        }
        *self.usage.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        Ok(())
    }
}
