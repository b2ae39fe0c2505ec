use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use commands::budget;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    commands::init_logging(args.verbose);

    let config_path = budget::resolve_config_path(args.config)?;

    if let Commands::Init { output, force } = args.command {
        return budget::init(output.or(Some(config_path)), force);
    }

    let engine = budget::open_engine(
        &config_path,
        args.state_dir,
        args.ad.into(),
        args.reviewer,
    )?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match args.command {
            Commands::Init { .. } => Ok(()),
            Commands::Status => budget::status(&engine).await,
            Commands::Enable => budget::set_enabled(&engine, true).await,
            Commands::Disable => budget::set_enabled(&engine, false).await,
            Commands::SetBase { minutes } => budget::set_base(&engine, minutes).await,
            Commands::Apply { minutes } => budget::apply(&engine, minutes).await,
            Commands::Reduce { minutes } => budget::reduce(&engine, minutes).await,
            Commands::Earn { count } => budget::earn(&engine, count).await,
            Commands::ResetToday => budget::reset_today(&engine).await,
            Commands::Record { minutes } => budget::record(&engine, minutes).await,
            Commands::LockScreen => budget::lock_screen(&engine).await,
            Commands::History { days } => budget::history(&engine, days).await,
        }
    })
}
