//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Courier - AMQP consumer delivery control plane.
#[derive(Parser)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Courier message delivery sessions and diagnostic tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a scripted command stream against in-memory sessions
    Replay(ReplayArgs),

    /// Validate a configuration file
    CheckConfig(CheckConfigArgs),
}

// -----------------------------------------------------------------------------
// Replay command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ReplayArgs {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// JSON script: an array of publish/command/acknowledge/close steps
    #[arg(short, long, value_name = "PATH")]
    pub script: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Override the configured log level (e.g. `courier=debug`)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Output format for replay results.
#[derive(clap::ValueEnum, Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON objects, one per line
    #[default]
    Json,
    /// Indented JSON, one document per step
    Pretty,
}

// -----------------------------------------------------------------------------
// Check-config command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/courier.toml")]
    pub config: PathBuf,
}
