use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use trailsync_core::Priority;

#[derive(Parser)]
#[command(name = "trailsync")]
#[command(about = "Inspect and drain the offline learning-statement queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local queue database (overrides TRAILSYNC_DB_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue one statement (JSON argument, or piped on stdin)
    #[command(alias = "add")]
    Enqueue {
        /// Statement JSON
        statement: Option<String>,
        /// Scheduling band
        #[arg(short, long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
        /// Tenant/organisation partition
        #[arg(long, value_name = "KEY")]
        partition: Option<String>,
    },
    /// Show sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show queue and dead-letter counts
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the next statements in delivery order without removing them
    Peek {
        /// Number of statements to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and act on dead-lettered statements
    Failed {
        #[command(subcommand)]
        command: FailedCommands,
    },
    /// Run one sync cycle against the configured collector
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing in the background until interrupted
    Watch {
        /// URL polled to detect connectivity (defaults to the collector URL)
        #[arg(long, value_name = "URL")]
        check_url: Option<String>,
        /// Seconds between connectivity checks
        #[arg(long, default_value = "10")]
        check_interval: u64,
    },
    /// List cached progress not yet confirmed by the collector
    Progress {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every queued statement, dead letter and cached progress row
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum FailedCommands {
    /// List dead-lettered statements
    List {
        /// Only statements nobody has reviewed yet
        #[arg(long)]
        unreviewed: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a dead-lettered statement as reviewed
    Review {
        /// Statement ID
        id: String,
    },
    /// Move a dead-lettered statement back to the queue with a fresh retry budget
    Retry {
        /// Statement ID
        id: String,
    },
    /// Permanently delete a dead-lettered statement
    Delete {
        /// Statement ID
        id: String,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PriorityArg {
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::High => Self::High,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::Low => Self::Low,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
