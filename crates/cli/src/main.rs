use anyhow::Result;
use clap::Parser;

use jobwatch_cli::Cli;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    jobwatch_observability::init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(jobwatch_cli::run(cli))
}
