use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use watch_budget::budget::config::{load_config_or_default, EXAMPLE_CONFIG};
use watch_budget::budget::reconciler::format_minutes;
use watch_budget::budget::{
    AdScript, BudgetConfig, BudgetError, JsonFileStore, ScriptedAdProvider,
    SessionReviewerUnlock, SystemClock, WatchTimeEngine,
};
use watch_budget::platform;

use crate::commands::utils::format_duration;

pub type CliEngine = WatchTimeEngine<ScriptedAdProvider>;

/// Resolve the config file path, falling back to the per-user location
pub fn resolve_config_path(config: Option<PathBuf>) -> Result<PathBuf> {
    match config {
        Some(path) => Ok(path),
        None => platform::get_config_path(),
    }
}

/// Load configuration and on-disk state into an engine
pub fn open_engine(
    config_path: &Path,
    state_dir: Option<PathBuf>,
    ad: AdScript,
    reviewer: bool,
) -> Result<CliEngine> {
    let config = load_config_or_default(config_path)
        .with_context(|| format!("Failed to load configuration: {}", config_path.display()))?;

    let state_dir = match state_dir.or_else(|| config.state_dir.clone()) {
        Some(dir) => dir,
        None => platform::get_state_dir()?,
    };
    tracing::debug!("Using state directory {}", state_dir.display());

    let store = JsonFileStore::new(state_dir);
    WatchTimeEngine::open(
        config,
        Arc::new(SystemClock),
        Arc::new(store),
        ScriptedAdProvider::always(ad),
        Arc::new(SessionReviewerUnlock::new(reviewer)),
    )
}

/// Initialize a new budget configuration file
pub fn init(output: Option<PathBuf>, force: bool) -> Result<()> {
    let output_path = resolve_config_path(output)?;

    if output_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}\nUse --force to overwrite",
            output_path.display()
        );
    }

    platform::atomic_write(&output_path, EXAMPLE_CONFIG.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", output_path.display()))?;

    let config: BudgetConfig =
        serde_yaml::from_str(EXAMPLE_CONFIG).context("Example configuration is invalid")?;

    println!("✓ Created budget configuration file: {}", output_path.display());
    println!("\nDefault base limit: {}", format_minutes(config.rules.default_base_minutes));
    println!("Daily maximum: {}", format_minutes(config.rules.max_daily_minutes));
    println!("\nEdit this file to change the rules. See the comments for details.");

    Ok(())
}

/// Show today's budget
pub async fn status(engine: &CliEngine) -> Result<()> {
    let status = engine.status().await;
    let ads = engine.ad_status();

    println!("\n=== Watch Budget for {} ===\n", status.day);

    println!(
        "Daily limit: {}",
        if status.enabled { "enforced" } else { "off" }
    );
    println!("  Base:      {}", format_minutes(status.base_minutes));
    println!("  Applied:   {}", format_minutes(status.applied_minutes));
    println!("  Effective: {}", format_minutes(status.effective_minutes));
    println!();
    println!("{}", status.usage_display);
    println!("  Remaining: {}", format_minutes(status.remaining_minutes));
    if status.exceeded {
        println!("  Status: 🔒 LIMIT REACHED");
    } else {
        println!("  Status: ✓ Watching allowed");
    }
    println!();
    println!("Wallet: {} minutes", status.wallet_balance);

    if status.screen_lock_hours_remaining > 0 {
        println!("Screen lock: on ({}h left)", status.screen_lock_hours_remaining);
    } else {
        println!("Screen lock: off");
    }

    println!(
        "Rewarded ad: {}",
        if ads.ready {
            "ready"
        } else if ads.loading {
            "loading"
        } else {
            "unavailable"
        }
    );

    Ok(())
}

pub async fn set_enabled(engine: &CliEngine, enabled: bool) -> Result<()> {
    engine.set_enabled(enabled).await?;

    if enabled {
        println!("✓ Daily limit enabled ({})", format_minutes(engine.effective_limit_minutes().await));
    } else {
        println!("✓ Daily limit disabled");
    }

    Ok(())
}

pub async fn set_base(engine: &CliEngine, minutes: u32) -> Result<()> {
    let report = engine
        .set_base_limit(minutes)
        .await
        .map_err(|e| with_hint(e, engine))?;

    println!(
        "✓ {}",
        report.summary(engine.config().rules.max_daily_minutes)
    );
    println!("  Wallet: {} minutes", report.new_wallet_balance);

    Ok(())
}

pub async fn apply(engine: &CliEngine, minutes: u32) -> Result<()> {
    let plan = engine
        .apply_earned_time(minutes)
        .await
        .map_err(|e| with_hint(e, engine))?;

    println!("✓ Applied {} earned minutes to today's limit", plan.amount);
    println!(
        "  Effective limit: {}",
        format_minutes(engine.effective_limit_minutes().await)
    );
    println!("  Wallet: {} minutes", plan.new_wallet_balance);

    Ok(())
}

pub async fn reduce(engine: &CliEngine, minutes: u32) -> Result<()> {
    let report = engine.reduce_effective_time(minutes).await?;

    println!(
        "✓ Effective limit lowered to {}. {} minutes returned to wallet.",
        format_minutes(report.effective_minutes()),
        report.returned_to_wallet
    );
    println!("  Wallet: {} minutes", report.new_wallet_balance);

    Ok(())
}

pub async fn earn(engine: &CliEngine, count: u32) -> Result<()> {
    let reward = engine.config().rules.reward_minutes;

    for _ in 0..count {
        let balance = engine.earn_reward().await?;
        println!("✓ Earned {} minutes (wallet: {} minutes)", reward, balance);
    }

    Ok(())
}

pub async fn reset_today(engine: &CliEngine) -> Result<()> {
    let report = engine
        .reset_today()
        .await
        .map_err(|e| with_hint(e, engine))?;

    let base = engine.status().await.base_minutes;
    println!("✓ {}", report.summary(base));
    println!("  Wallet: {} minutes", report.new_wallet_balance);

    Ok(())
}

pub async fn record(engine: &CliEngine, minutes: u64) -> Result<()> {
    engine.add_used(minutes.saturating_mul(60_000)).await;

    let status = engine.status().await;
    println!("✓ Recorded {} minutes", minutes);
    println!("  {}", status.usage_display);
    if status.exceeded {
        println!("  Daily limit reached");
    }

    Ok(())
}

pub async fn lock_screen(engine: &CliEngine) -> Result<()> {
    let expires = engine.enable_screen_lock().await?;
    let remaining = expires - chrono::Utc::now();

    println!("✓ Screen lock enabled for {}", format_duration(remaining));
    println!("  Expires: {}", expires.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"));

    Ok(())
}

/// Show usage history
pub async fn history(engine: &CliEngine, days: usize) -> Result<()> {
    let records = engine.history(days).await;

    println!("\n=== Usage History ===\n");

    if records.is_empty() {
        println!("No usage history found");
        return Ok(());
    }

    for record in records {
        println!("{}  {}", record.date, format_minutes(record.used_minutes));
    }

    Ok(())
}

fn with_hint(err: BudgetError, engine: &CliEngine) -> anyhow::Error {
    if err.is_funding_shortfall() {
        let reward = engine.config().rules.reward_minutes;
        anyhow::Error::new(err).context(format!(
            "Watch a rewarded ad with `watch-budget earn` to add {} minutes",
            reward
        ))
    } else {
        err.into()
    }
}
