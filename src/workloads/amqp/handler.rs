//! Command router for the message class.
//!
//! Turns each [`MessageCommand`] into one call on the [`Session`], after
//! checking its arguments. Invalid arguments fail before any state changes.
//! A successful command is followed by a delivery pass for every queue that
//! asked for one.

use super::commands::{CommandOutcome, MessageCommand};
use super::errors::{SessionError, SessionResult};
use super::session::{Session, SubscribeRequest};
use crate::messaging::{
    decode_ranges, AcquireMode, ConfirmMode, CreditUnit, FieldTable, FlowMode, PrefetchLimits,
};
use tracing::{debug, warn};

const REFERENCES_RETIRED: &str = "References no longer supported";
const OK_RETIRED: &str = "Message.Ok no longer supported";

#[derive(Debug)]
pub struct MessageHandler {
    session: Session,
}

impl MessageHandler {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Handle one command from the peer.
    pub fn handle(&mut self, command: MessageCommand) -> SessionResult<CommandOutcome> {
        let name = command.name();
        debug!(session = %self.session.id(), command = name, "handling command");
        let result = self.route(command);
        match &result {
            Ok(_) => {
                self.session.dispatch_pending();
            }
            Err(err) if err.is_connection_fatal() => {
                warn!(
                    session = %self.session.id(),
                    command = name,
                    code = err.code(),
                    error = %err,
                    "connection-fatal command error"
                );
            }
            Err(err) => {
                debug!(
                    session = %self.session.id(),
                    command = name,
                    code = err.code(),
                    error = %err,
                    "command failed"
                );
            }
        }
        result
    }

    /// Acknowledge acquired transfers (the session's completion path).
    pub fn acknowledge(&mut self, transfers: &[u64]) -> SessionResult<()> {
        let transfers = decode_ranges(transfers)?;
        self.session.acknowledge(&transfers);
        self.session.dispatch_pending();
        Ok(())
    }

    fn route(&mut self, command: MessageCommand) -> SessionResult<CommandOutcome> {
        match command {
            MessageCommand::Subscribe {
                queue,
                destination,
                no_local,
                confirm_mode,
                acquire_mode,
                exclusive,
                filter,
            } => {
                let request = SubscribeRequest {
                    queue,
                    destination,
                    no_local,
                    confirm_mode: parse_confirm_mode(confirm_mode)?,
                    acquire_mode: parse_acquire_mode(acquire_mode)?,
                    exclusive,
                    filter: validate_filter(filter)?,
                };
                self.session.subscribe(request)?;
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::Cancel { destination } => {
                self.session.cancel(&destination);
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::Get {
                queue,
                destination,
                no_ack,
            } => {
                let delivered = self.session.get(&queue, &destination, no_ack)?;
                Ok(CommandOutcome::Delivered(delivered))
            }
            MessageCommand::Flow {
                destination,
                unit,
                value,
            } => {
                let unit = CreditUnit::from_code(unit).ok_or_else(|| {
                    SessionError::invalid("unit", format!("Invalid value for unit {unit}"))
                })?;
                self.session.flow(&destination, unit, value)?;
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::FlowMode { destination, mode } => {
                let mode = FlowMode::from_code(mode).ok_or_else(|| {
                    SessionError::invalid("mode", format!("Invalid value for mode {mode}"))
                })?;
                self.session.set_flow_mode(&destination, mode)?;
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::Flush { destination } => {
                self.session.flush(&destination)?;
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::Stop { destination } => {
                self.session.stop(&destination)?;
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::Acquire { transfers, mode: _ } => {
                let transfers = decode_ranges(&transfers)?;
                Ok(CommandOutcome::Acquired(self.session.acquire(&transfers)))
            }
            MessageCommand::Release { transfers } => {
                let transfers = decode_ranges(&transfers)?;
                self.session.release(&transfers);
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::Reject {
                transfers,
                code,
                text,
            } => {
                let transfers = decode_ranges(&transfers)?;
                self.session.reject(&transfers, code, &text);
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::Recover { requeue } => {
                self.session.recover(requeue);
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::Qos {
                prefetch_size,
                prefetch_count,
                global: _,
            } => {
                self.session.qos(PrefetchLimits::new(
                    u32::from(prefetch_count),
                    u64::from(prefetch_size),
                ));
                Ok(CommandOutcome::Completed)
            }
            MessageCommand::Open
            | MessageCommand::Append
            | MessageCommand::Close
            | MessageCommand::Checkpoint
            | MessageCommand::Resume
            | MessageCommand::Offset => Err(SessionError::NotImplemented(REFERENCES_RETIRED)),
            MessageCommand::Ok => Err(SessionError::NotImplemented(OK_RETIRED)),
            MessageCommand::Empty => Err(SessionError::Internal("Impossible".into())),
        }
    }
}

fn parse_confirm_mode(code: u8) -> SessionResult<ConfirmMode> {
    ConfirmMode::from_code(code).ok_or_else(|| {
        SessionError::invalid("confirm_mode", format!("Invalid value for confirm mode {code}"))
    })
}

fn parse_acquire_mode(code: u8) -> SessionResult<AcquireMode> {
    AcquireMode::from_code(code).ok_or_else(|| {
        SessionError::invalid("acquire_mode", format!("Invalid value for acquire mode {code}"))
    })
}

fn validate_filter(filter: FieldTable) -> SessionResult<FieldTable> {
    if filter.keys().any(|key| key.is_empty()) {
        return Err(SessionError::invalid("filter", "filter keys must be non-empty"));
    }
    Ok(filter)
}
