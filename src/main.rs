mod bootstrap;
mod cli;
mod config;
mod discovery;
mod env;
mod layout;
mod logging;
mod runnable;
mod runner;
mod state;
mod supervisor;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    logging::init_tracing(cli.verbose);
    cli.execute().await
}
