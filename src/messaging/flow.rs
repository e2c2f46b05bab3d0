//! Credit-based flow control for subscriptions.
//!
//! Every subscription owns a [`CreditState`] with a message counter and a byte
//! counter. Two disciplines exist:
//! - credit mode: `flow` grants are one-shot and only a later grant refills
//! - window mode: `flow` sizes a window and completed deliveries return their
//!   share of it
//!
//! A counter value of [`UNLIMITED_CREDIT`] is never decremented.

use std::collections::HashMap;
use thiserror::Error;

/// Credit value that disables a counter.
pub const UNLIMITED_CREDIT: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Wire codes
// ---------------------------------------------------------------------------

/// Replenishment discipline, wire codes `0 = credit`, `1 = window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowMode {
    #[default]
    Credit,
    Window,
}

impl FlowMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Credit),
            1 => Some(Self::Window),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowMode::Credit => "credit",
            FlowMode::Window => "window",
        }
    }
}

/// Credit unit, wire codes `0 = message`, `1 = byte`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditUnit {
    Message,
    Byte,
}

impl CreditUnit {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Message),
            1 => Some(Self::Byte),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Credit State
// ---------------------------------------------------------------------------

/// Flow-control counters for one subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreditState {
    mode: FlowMode,
    message_credit: u32,
    byte_credit: u32,
    /// Byte credit only gates delivery once the peer has granted some.
    byte_limited: bool,
    stopped: bool,
}

impl CreditState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> FlowMode {
        self.mode
    }

    pub fn message_credit(&self) -> u32 {
        self.message_credit
    }

    pub fn byte_credit(&self) -> u32 {
        self.byte_credit
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Switch discipline. Both counters restart from zero.
    pub fn set_mode(&mut self, mode: FlowMode) {
        self.mode = mode;
        self.message_credit = 0;
        self.byte_credit = 0;
        self.byte_limited = false;
    }

    /// Add credit in the given unit and resume a stopped consumer.
    pub fn grant(&mut self, unit: CreditUnit, value: u32) {
        match unit {
            CreditUnit::Message => {
                self.message_credit = add_credit(self.message_credit, value);
            }
            CreditUnit::Byte => {
                self.byte_credit = add_credit(self.byte_credit, value);
                self.byte_limited = true;
            }
        }
        self.stopped = false;
    }

    /// Whether a message of `size` bytes may be delivered now.
    pub fn can_deliver(&self, size: u64) -> bool {
        if self.stopped || self.message_credit == 0 {
            return false;
        }
        if self.byte_limited
            && self.byte_credit != UNLIMITED_CREDIT
            && u64::from(self.byte_credit) < size
        {
            return false;
        }
        true
    }

    /// Debit one delivery of `size` bytes. Refuses rather than underflowing.
    pub fn try_consume(&mut self, size: u64) -> bool {
        if !self.can_deliver(size) {
            return false;
        }
        if self.message_credit != UNLIMITED_CREDIT {
            self.message_credit -= 1;
        }
        if self.byte_limited && self.byte_credit != UNLIMITED_CREDIT {
            self.byte_credit -= size as u32;
        }
        true
    }

    /// Return the share of a completed delivery to the window.
    ///
    /// No-op in credit mode.
    pub fn replenish(&mut self, size: u64) {
        if self.mode != FlowMode::Window {
            return;
        }
        self.message_credit = add_credit(self.message_credit, 1);
        if self.byte_limited {
            let size = u32::try_from(size).unwrap_or(UNLIMITED_CREDIT - 1);
            self.byte_credit = add_credit(self.byte_credit, size);
        }
    }

    /// Drop all remaining credit.
    pub fn exhaust(&mut self) {
        self.message_credit = 0;
        self.byte_credit = 0;
    }

    /// Halt delivery, keeping the accumulated credit.
    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

/// Saturating add that never lands on the unlimited sentinel by accident.
fn add_credit(current: u32, value: u32) -> u32 {
    if current == UNLIMITED_CREDIT || value == UNLIMITED_CREDIT {
        return UNLIMITED_CREDIT;
    }
    current.saturating_add(value).min(UNLIMITED_CREDIT - 1)
}

// ---------------------------------------------------------------------------
// Credit Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("unknown destination {0}")]
    UnknownDestination(String),
}

/// Per-session map of consumer tag to [`CreditState`].
#[derive(Debug, Clone, Default)]
pub struct CreditLedger {
    consumers: HashMap<String, CreditState>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a consumer with zeroed credit.
    pub fn open(&mut self, destination: &str) {
        self.consumers
            .insert(destination.to_string(), CreditState::new());
    }

    /// Stop tracking a consumer.
    pub fn close(&mut self, destination: &str) -> Option<CreditState> {
        self.consumers.remove(destination)
    }

    pub fn state(&self, destination: &str) -> Option<&CreditState> {
        self.consumers.get(destination)
    }

    pub fn grant(&mut self, destination: &str, unit: CreditUnit, value: u32) -> Result<(), FlowError> {
        self.state_mut(destination)?.grant(unit, value);
        Ok(())
    }

    pub fn set_mode(&mut self, destination: &str, mode: FlowMode) -> Result<(), FlowError> {
        self.state_mut(destination)?.set_mode(mode);
        Ok(())
    }

    pub fn exhaust(&mut self, destination: &str) -> Result<(), FlowError> {
        self.state_mut(destination)?.exhaust();
        Ok(())
    }

    pub fn stop(&mut self, destination: &str) -> Result<(), FlowError> {
        self.state_mut(destination)?.stop();
        Ok(())
    }

    /// Whether `destination` could take a message of `size` bytes.
    pub fn can_deliver(&self, destination: &str, size: u64) -> bool {
        self.consumers
            .get(destination)
            .is_some_and(|state| state.can_deliver(size))
    }

    /// Debit one delivery; unknown destinations are refused.
    pub fn try_consume(&mut self, destination: &str, size: u64) -> bool {
        self.consumers
            .get_mut(destination)
            .is_some_and(|state| state.try_consume(size))
    }

    /// Window replenishment after a delivery completes.
    pub fn replenish(&mut self, destination: &str, size: u64) {
        if let Some(state) = self.consumers.get_mut(destination) {
            state.replenish(size);
        }
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    fn state_mut(&mut self, destination: &str) -> Result<&mut CreditState, FlowError> {
        self.consumers
            .get_mut(destination)
            .ok_or_else(|| FlowError::UnknownDestination(destination.to_string()))
    }
}
