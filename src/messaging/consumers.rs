//! Session consumer registry.
//!
//! Maps consumer tags to live [`Subscription`]s. Tags are unique within a
//! session while the subscription lives and may be reused once it is
//! cancelled.

use crate::messaging::queue::{FieldTable, QueueHandle};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Acquire mode, wire codes `0 = pre-acquired`, `1 = not acquired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Messages are acquired as they are delivered.
    PreAcquired,
    /// Messages are delivered unacquired and must be acquired explicitly.
    NotAcquired,
}

impl AcquireMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::PreAcquired),
            1 => Some(Self::NotAcquired),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            AcquireMode::PreAcquired => 0,
            AcquireMode::NotAcquired => 1,
        }
    }
}

/// Confirm mode, wire codes `0 = none`, `1 = acknowledgement required`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    NotRequired,
    Required,
}

impl ConfirmMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::NotRequired),
            1 => Some(Self::Required),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ConfirmMode::NotRequired => 0,
            ConfirmMode::Required => 1,
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self, ConfirmMode::Required)
    }
}

/// Correlation key threaded through every transfer to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeliveryToken {
    pub destination: String,
    pub confirm_mode: u8,
    pub acquire_mode: u8,
}

impl DeliveryToken {
    pub fn new(destination: impl Into<String>, confirm_mode: u8, acquire_mode: u8) -> Self {
        Self {
            destination: destination.into(),
            confirm_mode,
            acquire_mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live consumer on a queue.
#[derive(Clone)]
pub struct Subscription {
    pub tag: String,
    pub queue: QueueHandle,
    /// Identity under which the session is registered with the queue.
    pub listener_id: String,
    pub token: DeliveryToken,
    pub acquire_mode: AcquireMode,
    pub confirm_mode: ConfirmMode,
    pub exclusive: bool,
    pub no_local: bool,
    pub filter: FieldTable,
    /// Last queue position browsed by a not-acquiring consumer.
    pub browse_cursor: Option<u64>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("tag", &self.tag)
            .field("queue", &self.queue.name())
            .field("acquire_mode", &self.acquire_mode)
            .field("confirm_mode", &self.confirm_mode)
            .field("exclusive", &self.exclusive)
            .field("no_local", &self.no_local)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Consumer tags must be unique: {0}")]
    DuplicateTag(String),
}

/// Tag to subscription map, remembering registration order.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    subscriptions: HashMap<String, Subscription>,
    order: Vec<String>,
    tag_prefix: String,
    generated: u64,
}

impl ConsumerRegistry {
    pub fn new(tag_prefix: impl Into<String>) -> Self {
        Self {
            tag_prefix: tag_prefix.into(),
            ..Self::default()
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.subscriptions.contains_key(tag)
    }

    /// Next free generated tag.
    pub fn generate_tag(&mut self) -> String {
        loop {
            self.generated += 1;
            let tag = format!("{}-{}", self.tag_prefix, self.generated);
            if !self.contains(&tag) {
                return tag;
            }
        }
    }

    pub fn insert(&mut self, subscription: Subscription) -> Result<(), RegistryError> {
        if self.contains(&subscription.tag) {
            return Err(RegistryError::DuplicateTag(subscription.tag));
        }
        self.order.push(subscription.tag.clone());
        self.subscriptions
            .insert(subscription.tag.clone(), subscription);
        Ok(())
    }

    pub fn remove(&mut self, tag: &str) -> Option<Subscription> {
        let removed = self.subscriptions.remove(tag)?;
        self.order.retain(|t| t != tag);
        Some(removed)
    }

    pub fn get(&self, tag: &str) -> Option<&Subscription> {
        self.subscriptions.get(tag)
    }

    pub fn get_mut(&mut self, tag: &str) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(tag)
    }

    /// Tags consuming from `queue`, in registration order.
    pub fn tags_for_queue(&self, queue: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|tag| {
                self.subscriptions
                    .get(*tag)
                    .is_some_and(|s| s.queue.name() == queue)
            })
            .cloned()
            .collect()
    }

    /// All tags in registration order.
    pub fn tags(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
