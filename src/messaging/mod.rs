//! Protocol-agnostic delivery primitives.
//!
//! - `ranges` - Sequence ranges and their flat wire form
//! - `flow` - Per-consumer message and byte credit
//! - `prefetch` - Session-wide prefetch window
//! - `consumers` - Consumer tag registry and subscriptions
//! - `acquisition` - Delivery records and the acquire/release/reject lifecycle
//! - `dispatch` - Dispatch requests between queues and sessions
//! - `queue` - Queue collaborator contract and in-memory queue

pub mod acquisition;
pub mod consumers;
pub mod dispatch;
pub mod flow;
pub mod prefetch;
pub mod queue;
pub mod ranges;

pub use acquisition::*;
pub use consumers::*;
pub use dispatch::*;
pub use flow::*;
pub use prefetch::*;
pub use queue::*;
pub use ranges::*;
