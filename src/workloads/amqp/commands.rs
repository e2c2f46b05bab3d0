//! Message-class commands as received from the peer.
//!
//! Fields keep their wire representation (raw mode codes, flat transfer
//! lists); the handler validates them before anything reaches the session.

use crate::messaging::{FieldTable, RangeSet};
use serde::{Deserialize, Serialize};

/// Every verb of the message class a consumer session can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum MessageCommand {
    Subscribe {
        queue: String,
        /// Consumer tag; empty asks the session to generate one.
        #[serde(default)]
        destination: String,
        #[serde(default)]
        no_local: bool,
        #[serde(default = "default_confirm_mode")]
        confirm_mode: u8,
        #[serde(default)]
        acquire_mode: u8,
        #[serde(default)]
        exclusive: bool,
        #[serde(default)]
        filter: FieldTable,
    },
    Cancel {
        destination: String,
    },
    Get {
        queue: String,
        destination: String,
        #[serde(default)]
        no_ack: bool,
    },
    Flow {
        destination: String,
        unit: u8,
        value: u32,
    },
    FlowMode {
        destination: String,
        mode: u8,
    },
    Flush {
        destination: String,
    },
    Stop {
        destination: String,
    },
    Acquire {
        transfers: Vec<u64>,
        #[serde(default)]
        mode: u8,
    },
    Release {
        transfers: Vec<u64>,
    },
    Reject {
        transfers: Vec<u64>,
        #[serde(default)]
        code: u16,
        #[serde(default)]
        text: String,
    },
    Recover {
        #[serde(default)]
        requeue: bool,
    },
    Qos {
        #[serde(default)]
        prefetch_size: u32,
        #[serde(default)]
        prefetch_count: u16,
        #[serde(default)]
        global: bool,
    },

    // Reference transfer verbs, retired.
    Open,
    Append,
    Close,
    Checkpoint,
    Resume,
    Offset,

    Ok,
    Empty,
}

fn default_confirm_mode() -> u8 {
    1
}

impl MessageCommand {
    pub fn name(&self) -> &'static str {
        match self {
            MessageCommand::Subscribe { .. } => "subscribe",
            MessageCommand::Cancel { .. } => "cancel",
            MessageCommand::Get { .. } => "get",
            MessageCommand::Flow { .. } => "flow",
            MessageCommand::FlowMode { .. } => "flow_mode",
            MessageCommand::Flush { .. } => "flush",
            MessageCommand::Stop { .. } => "stop",
            MessageCommand::Acquire { .. } => "acquire",
            MessageCommand::Release { .. } => "release",
            MessageCommand::Reject { .. } => "reject",
            MessageCommand::Recover { .. } => "recover",
            MessageCommand::Qos { .. } => "qos",
            MessageCommand::Open => "open",
            MessageCommand::Append => "append",
            MessageCommand::Close => "close",
            MessageCommand::Checkpoint => "checkpoint",
            MessageCommand::Resume => "resume",
            MessageCommand::Offset => "offset",
            MessageCommand::Ok => "ok",
            MessageCommand::Empty => "empty",
        }
    }
}

/// Result of a successfully handled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed,
    /// `get`: whether a message was delivered.
    Delivered(bool),
    /// `acquire`: the transfers actually acquired, also sent to the peer.
    Acquired(RangeSet),
}
