//! Operations and observability.
//!
//! - `telemetry` - Tracing subscriber setup and runtime log-level control

pub mod telemetry;

pub use telemetry::*;
