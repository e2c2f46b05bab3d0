//! Courier - unified CLI entrypoint.
//!
//! Usage:
//!   courier replay --config config/courier.toml --script script.json
//!   courier check-config --config config/courier.toml

use anyhow::Result;
use clap::Parser;
use courier::cli::commands::{run_check_config, run_replay};
use courier::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay(args) => run_replay(args),
        Commands::CheckConfig(args) => run_check_config(args),
    }
}
