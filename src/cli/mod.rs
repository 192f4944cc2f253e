use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
mod eval;
mod query;
mod server;
use tracing_appender::non_blocking::WorkerGuard;

use crate::config::state_dir;

pub fn register_tracing(daemonized: bool) -> Result<Option<WorkerGuard>> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_env(tracing_subscriber::EnvFilter::DEFAULT_ENV)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shellcue=info"))
    };

    if daemonized {
        let dir = state_dir();
        std::fs::create_dir_all(&dir)?;
        let file_appender = tracing_appender::rolling::daily(dir, "daemon.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_env_filter(filter())
            .init();
        return Ok(Some(guard));
    }

    // stdout belongs to the shell integration
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter())
        .init();

    Ok(None)
}

/// Context-aware command suggestions from your shell history
#[derive(Parser, Debug)]
#[clap(name = "shellcue", version = crate::GIT_VERSION)]
pub struct Cli {
    /// Config file. Defaults to $SHELLCUE_CONFIG or ~/.shellcue/config.toml
    #[clap(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the suggestion daemon
    Daemon(DaemonOptions),

    /// Suggest completions for a partial command
    Suggest {
        /// What has been typed so far
        #[clap(default_value = "")]
        partial: String,

        /// Working directory to suggest for. Defaults to the current one.
        #[clap(long, value_name = "DIR")]
        cwd: Option<String>,

        /// Recently run commands, oldest first. May be repeated.
        #[clap(long = "history", value_name = "CMD")]
        history: Vec<String>,

        /// Say where each suggestion came from.
        #[clap(long)]
        explain: bool,
    },

    /// Record a finished command
    Log {
        #[clap(short = 'x', long, default_value = "0", allow_hyphen_values = true)]
        exit_code: i32,

        /// Wall-clock seconds the command took.
        #[clap(short, long)]
        duration: Option<f64>,

        #[clap(long, value_name = "DIR")]
        cwd: Option<String>,

        #[clap(long, value_name = "ID")]
        session: Option<String>,

        /// The command line as typed.
        command: String,
    },

    /// Full-text search over history
    Search {
        query: String,

        /// Show only N rows
        #[clap(short = 'n', long, default_value = "20", value_name = "N")]
        limit: usize,

        /// Only commands run in DIR or below.
        #[clap(long = "in", value_name = "DIR")]
        indir: Option<String>,

        /// Print a table with time, directory and exit status.
        #[clap(long)]
        full: bool,

        /// Don't print header.
        #[clap(long = "no-header")]
        nh: bool,
    },

    /// Commands you habitually run back to back
    Sequences {
        #[clap(short = 'n', long, default_value = "20", value_name = "N")]
        limit: usize,
    },

    /// Show what was run around a history entry
    Context {
        id: i64,

        #[clap(short, long, default_value = "5")]
        window: usize,
    },

    /// Show daemon status
    Status,

    /// Stop the daemon
    Stop,

    /// Print the bash integration (use eval "$(shellcue init)")
    Init,
}

#[derive(Args, Debug)]
pub struct DaemonOptions {
    /// Become a daemon
    #[clap(long)]
    pub daemonize: bool,
}

pub use query::client_main;
pub use server::server_main;
