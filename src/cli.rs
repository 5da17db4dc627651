use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reshelf::types::DedupeMode;

/// Library maintenance CLI: reconcile fetched episode lists and merge duplicates
#[derive(Parser)]
#[command(name = "reshelf")]
#[command(about = "Reconciles episode lists and merges duplicate works", long_about = None)]
pub struct Cli {
    /// Config file (defaults to config.toml in the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// sqlite URL, overrides the config file
    #[arg(long, global = true)]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a work to the library
    AddWork {
        #[arg(long)]
        source: i64,
        #[arg(long)]
        url: String,
        #[arg(long)]
        title: String,
        /// Add it as a favorite
        #[arg(long)]
        favorite: bool,
    },
    /// List works
    Works {
        #[arg(long)]
        favorites: bool,
    },
    /// List the episodes of a work
    Episodes {
        #[arg(long)]
        work: i64,
    },
    /// Apply a fetched episode list (JSON array) to a work
    Sync {
        #[arg(long)]
        work: i64,
        #[arg(long)]
        input: PathBuf,
        /// Treat the fetch as user initiated
        #[arg(long)]
        manual: bool,
        /// The source keeps no remote list; an empty input is allowed
        #[arg(long)]
        offline: bool,
    },
    /// Fold duplicate favorited works of the same source into the oldest one
    Merge {
        /// Work whose episodes identify the duplicates
        #[arg(long)]
        work: i64,
    },
    /// Attach a work to a merge container
    Link {
        #[arg(long)]
        container: i64,
        #[arg(long)]
        work: i64,
        /// Lower values win when deduplicating by priority
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Set how a merge container collapses duplicate episodes
    Mode {
        #[arg(long)]
        container: i64,
        /// none, priority, most-episodes or highest-episode-number
        mode: DedupeMode,
    },
    /// Show the merged episode list of a container
    View {
        #[arg(long)]
        container: i64,
    },
}
