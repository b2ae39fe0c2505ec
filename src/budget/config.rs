use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::gate::GuardedAction;

/// Main watch-budget configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BudgetConfig {
    /// Economic rules of the daily budget
    #[serde(default)]
    pub rules: BudgetRules,

    /// Hours before an earned wallet entry expires (null disables expiry)
    #[serde(default = "default_wallet_ttl")]
    pub wallet_entry_ttl_hours: Option<u32>,

    /// Zero today's usage when the base limit changes
    #[serde(default = "default_true")]
    pub reset_usage_on_base_change: bool,

    /// Seconds to wait for a rewarded ad before giving up
    #[serde(default = "default_ad_timeout")]
    pub ad_timeout_secs: u64,

    /// Actions that require a completed rewarded ad
    #[serde(default = "default_gated_actions")]
    pub gated_actions: Vec<GuardedAction>,

    /// Directory holding ledger.json and usage.json
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            rules: BudgetRules::default(),
            wallet_entry_ttl_hours: default_wallet_ttl(),
            reset_usage_on_base_change: true,
            ad_timeout_secs: default_ad_timeout(),
            gated_actions: default_gated_actions(),
            state_dir: None,
        }
    }
}

impl BudgetConfig {
    pub fn wallet_entry_ttl(&self) -> Option<chrono::Duration> {
        self.wallet_entry_ttl_hours
            .map(|hours| chrono::Duration::hours(hours as i64))
    }

    pub fn ad_timeout(&self) -> Duration {
        Duration::from_secs(self.ad_timeout_secs)
    }
}

/// Minute amounts that drive the budget economy
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct BudgetRules {
    /// Free daily allowance; base minutes above it were wallet-funded
    #[serde(default = "default_base")]
    pub default_base_minutes: u32,

    /// Hard cap on base + applied minutes
    #[serde(default = "default_max_daily")]
    pub max_daily_minutes: u32,

    /// Minutes credited per completed rewarded ad
    #[serde(default = "default_reward")]
    pub reward_minutes: u32,

    /// Earned minutes consumed by "reset today's usage"
    #[serde(default = "default_reset_cost")]
    pub reset_cost_minutes: u32,
}

impl Default for BudgetRules {
    fn default() -> Self {
        Self {
            default_base_minutes: default_base(),
            max_daily_minutes: default_max_daily(),
            reward_minutes: default_reward(),
            reset_cost_minutes: default_reset_cost(),
        }
    }
}

fn default_base() -> u32 {
    60
}

fn default_max_daily() -> u32 {
    180
}

fn default_reward() -> u32 {
    15
}

fn default_reset_cost() -> u32 {
    60
}

fn default_wallet_ttl() -> Option<u32> {
    Some(8)
}

fn default_ad_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_gated_actions() -> Vec<GuardedAction> {
    vec![
        GuardedAction::LockScreen,
        GuardedAction::RaiseBase,
        GuardedAction::ApplyEarned,
        GuardedAction::ResetDay,
    ]
}

/// Load configuration from YAML file
pub fn load_config(path: &Path) -> Result<BudgetConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: BudgetConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load configuration, falling back to defaults when the file is missing
pub fn load_config_or_default(path: &Path) -> Result<BudgetConfig> {
    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(BudgetConfig::default());
    }
    load_config(path)
}

/// Save configuration to YAML file
pub fn save_config(path: &Path, config: &BudgetConfig) -> Result<()> {
    validate_config(config)?;

    let content = serde_yaml::to_string(config)
        .context("Failed to serialize config to YAML")?;

    crate::platform::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &BudgetConfig) -> Result<()> {
    validate_rules(&config.rules).context("Invalid budget rules")?;

    if config.ad_timeout_secs == 0 {
        anyhow::bail!("ad_timeout_secs must be greater than zero");
    }

    if config.wallet_entry_ttl_hours == Some(0) {
        anyhow::bail!("wallet_entry_ttl_hours must be greater than zero (use null to disable expiry)");
    }

    if config.gated_actions.contains(&GuardedAction::EarnReward) {
        anyhow::bail!("earn_reward is always gated and cannot be listed in gated_actions");
    }

    Ok(())
}

fn validate_rules(rules: &BudgetRules) -> Result<()> {
    if rules.max_daily_minutes == 0 || rules.max_daily_minutes > 24 * 60 {
        anyhow::bail!(
            "max_daily_minutes must be between 1 and 1440, got {}",
            rules.max_daily_minutes
        );
    }

    if rules.default_base_minutes < 1 || rules.default_base_minutes > rules.max_daily_minutes {
        anyhow::bail!(
            "default_base_minutes must be between 1 and {}, got {}",
            rules.max_daily_minutes,
            rules.default_base_minutes
        );
    }

    if rules.reward_minutes == 0 {
        anyhow::bail!("reward_minutes must be greater than zero");
    }

    if rules.reset_cost_minutes > rules.max_daily_minutes {
        anyhow::bail!(
            "reset_cost_minutes ({}) cannot exceed max_daily_minutes ({})",
            rules.reset_cost_minutes,
            rules.max_daily_minutes
        );
    }

    Ok(())
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = include_str!("../../example-budget-config.yaml");
