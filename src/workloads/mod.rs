//! Protocol workloads built on the delivery primitives.
//!
//! Currently supported workloads:
//! - AMQP: message-class consumer sessions (subscribe, flow control,
//!   acquire/release/reject, recover).

pub mod amqp;
