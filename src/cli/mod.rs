//! Courier CLI - command-line interface.
//!
//! Provides a single binary entry point for:
//! - `courier replay` - Run a scripted command stream against in-memory sessions
//! - `courier check-config` - Validate a configuration file

mod args;
pub mod commands;

pub use args::{CheckConfigArgs, Cli, Commands, OutputFormat, ReplayArgs};
