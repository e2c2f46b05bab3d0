//! CLI command implementations.

mod check_config;
mod replay;

pub use check_config::run_check_config;
pub use replay::{load_script, replay_script, run_replay, ScriptStep};
