//! AMQP message-class consumer workload.
//!
//! This module wires the delivery primitives from [`crate::messaging`] into a
//! per-session state machine driven by message-class commands:
//! - Command parsing (`commands`) and validation/routing (`handler`)
//! - Session state: subscriptions, credit, prefetch, delivery records
//! - Outbound transfers and acquire results (`delivery`)
//! - Reply codes and connection-fatal classification (`errors`)
//! - An async driver that owns a session on a tokio task

pub mod commands;
pub mod delivery;
pub mod driver;
pub mod errors;
pub mod handler;
pub mod session;

pub use self::commands::{CommandOutcome, MessageCommand};
pub use self::delivery::{ChannelProxy, Delivery, Proxy, ProxyEvent, RecordingProxy};
pub use self::driver::{DriverError, SessionClient, SessionDriver};
pub use self::errors::{ErrorCode, SessionError, SessionResult};
pub use self::handler::MessageHandler;
pub use self::session::{Session, SubscribeRequest};
