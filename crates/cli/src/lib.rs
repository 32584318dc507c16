//! `jobwatch` command-line interface.
//!
//! - `jobwatch watch --tenant <uuid> --api <url>` follows a tenant's jobs on a
//!   remote backend, polling at `--poll-ms`.
//! - `jobwatch watch --demo` runs against an in-process store with a simulated
//!   worker and a push feed, submitting a few sample jobs.
//!
//! Engine settings come from `JOBWATCH_*` variables (a `.env` file is loaded
//! first); flags override them.

pub mod render;
pub mod watch;

use clap::{Parser, Subcommand};

use jobwatch_engine::EngineConfig;

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(version, about = "Track asynchronous training and prediction jobs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Follow a tenant's jobs and notifications.
    Watch(watch::WatchArgs),
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    match cli.command {
        Commands::Watch(args) => watch::execute(args, config).await,
    }
}
