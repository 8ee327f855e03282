//! trailsync CLI - inspect and drain the offline statement queue
//!
//! Configuration comes from `TRAILSYNC_*` environment variables (a `.env`
//! file is honoured); `--db-path` overrides the queue location.

mod cli;
mod commands;
mod error;


use std::time::Duration;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::{load_config, open_engine};
use crate::commands::completions::run_completions;
use crate::commands::enqueue::run_enqueue;
use crate::commands::failed::run_failed;
use crate::commands::peek::run_peek;
use crate::commands::progress::run_progress;
use crate::commands::reset::run_reset;
use crate::commands::status::{run_stats, run_status};
use crate::commands::sync::{run_sync, run_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "trailsync=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let config = load_config(cli.db_path)?;
    if let Commands::Watch {
        check_url,
        check_interval,
    } = cli.command
    {
        return run_watch(config, check_url, Duration::from_secs(check_interval.max(1))).await;
    }

    let engine = open_engine(config)?;
    match cli.command {
        Commands::Enqueue {
            statement,
            priority,
            partition,
        } => run_enqueue(
            &engine,
            statement.as_deref(),
            priority.into(),
            partition.as_deref(),
        )?,
        Commands::Status { json } => run_status(&engine, json)?,
        Commands::Stats { json } => run_stats(&engine, json)?,
        Commands::Peek { limit, json } => run_peek(&engine, limit, json)?,
        Commands::Failed { command } => run_failed(&engine, command)?,
        Commands::Sync { json } => run_sync(&engine, json).await?,
        Commands::Progress { json } => run_progress(&engine, json)?,
        Commands::Reset { yes } => run_reset(&engine, yes)?,
        Commands::Watch { .. } | Commands::Completions { .. } => {}
    }

    Ok(())
}
