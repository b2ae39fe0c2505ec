use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use watch_budget::budget::AdScript;

/// Watch-time budget manager
///
/// Inspects and changes the daily watch-time limit and the earned-time
/// wallet of the kids video viewer.
#[derive(Parser, Debug)]
#[command(name = "watch-budget")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the ledger and usage records
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Outcome of any rewarded ad shown during this command
    #[arg(long, value_enum, default_value_t = AdChoice::Watch, global = true)]
    pub ad: AdChoice,

    /// Skip rewarded ads (reviewer unlock, this invocation only)
    #[arg(long, global = true)]
    pub reviewer: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// How the rewarded ad plays out
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdChoice {
    /// Watch the ad to the end
    Watch,
    /// Close the ad early
    Skip,
    /// The ad never loads
    Stall,
}

impl From<AdChoice> for AdScript {
    fn from(choice: AdChoice) -> Self {
        match choice {
            AdChoice::Watch => AdScript::Grant,
            AdChoice::Skip => AdScript::Dismiss,
            AdChoice::Stall => AdScript::Hang,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example configuration file
    Init {
        /// Output file (defaults to the per-user config path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Show today's budget
    Status,
    /// Enforce the daily limit
    Enable,
    /// Stop enforcing the daily limit
    Disable,
    /// Change the base daily limit
    SetBase {
        /// New base limit in minutes
        minutes: u32,
    },
    /// Move earned minutes from the wallet into today's limit
    Apply {
        /// Minutes to apply
        minutes: u32,
    },
    /// Give applied minutes back to the wallet, lowering today's limit
    Reduce {
        /// New effective limit in minutes
        minutes: u32,
    },
    /// Watch rewarded ads to earn wallet minutes
    Earn {
        /// Number of ads to watch
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,
    },
    /// Spend earned time to reset today's usage
    ResetToday,
    /// Record playback time
    Record {
        /// Minutes watched
        minutes: u64,
    },
    /// Turn on the kids screen lock for a day
    LockScreen,
    /// Show usage of previous days
    History {
        /// Number of days to show
        #[arg(short, long, default_value = "7")]
        days: usize,
    },
}
