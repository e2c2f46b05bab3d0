//! AMQP reply codes and session errors.
//!
//! Every failure a session can report to its peer carries an AMQP reply code.
//! Some of them close the whole connection; the rest only fail the command.

use crate::messaging::{FlowError, QueueError, RangeError, RegistryError};
use thiserror::Error;

/// AMQP 0-10 reply codes used by the message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// The named queue or destination does not exist.
    NotFound = 404,
    /// The resource is held exclusively by another consumer.
    ResourceLocked = 405,
    /// A command argument had an invalid value.
    InvalidArgument = 502,
    /// The command conflicts with existing session state.
    NotAllowed = 530,
    /// The command is recognized but not supported.
    NotImplemented = 540,
    /// The broker reached a state it should never be in.
    InternalError = 541,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            404 => Some(Self::NotFound),
            405 => Some(Self::ResourceLocked),
            502 => Some(Self::InvalidArgument),
            530 => Some(Self::NotAllowed),
            540 => Some(Self::NotImplemented),
            541 => Some(Self::InternalError),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Connection-level codes close the connection, not just the command.
    pub fn is_connection_fatal(self) -> bool {
        matches!(
            self,
            Self::InvalidArgument | Self::NotImplemented | Self::InternalError
        )
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::ResourceLocked => "resource locked",
            Self::InvalidArgument => "invalid argument",
            Self::NotAllowed => "not allowed",
            Self::NotImplemented => "not implemented",
            Self::InternalError => "internal error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.as_u16())
    }
}

/// Errors raised while handling a message-class command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("Consumer tags must be unique: {0}")]
    ConflictingConsumer(String),
    #[error("resource locked: {0}")]
    ResourceLocked(String),
    #[error("{0}")]
    NotImplemented(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::ConflictingConsumer(_) => ErrorCode::NotAllowed,
            Self::ResourceLocked(_) => ErrorCode::ResourceLocked,
            Self::NotImplemented(_) => ErrorCode::NotImplemented,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn code(&self) -> u16 {
        self.error_code().as_u16()
    }

    pub fn is_connection_fatal(&self) -> bool {
        self.error_code().is_connection_fatal()
    }
}

impl From<RangeError> for SessionError {
    fn from(err: RangeError) -> Self {
        Self::invalid("transfers", err.to_string())
    }
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateTag(tag) => Self::ConflictingConsumer(tag),
        }
    }
}

impl From<QueueError> for SessionError {
    fn from(err: QueueError) -> Self {
        Self::ResourceLocked(err.to_string())
    }
}

impl From<FlowError> for SessionError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::UnknownDestination(destination) => {
                Self::NotFound(format!("destination {destination}"))
            }
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::ResourceLocked,
            ErrorCode::InvalidArgument,
            ErrorCode::NotAllowed,
            ErrorCode::NotImplemented,
            ErrorCode::InternalError,
        ] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(200), None);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::invalid("unit", "bad").is_connection_fatal());
        assert!(SessionError::NotImplemented("References no longer supported").is_connection_fatal());
        assert!(SessionError::Internal("Impossible".into()).is_connection_fatal());
        assert!(!SessionError::NotFound("q".into()).is_connection_fatal());
        assert!(!SessionError::ConflictingConsumer("c1".into()).is_connection_fatal());
        assert!(!SessionError::ResourceLocked("q".into()).is_connection_fatal());
    }

    #[test]
    fn test_conversions_keep_codes() {
        let odd: SessionError = RangeError::OddLength { len: 3 }.into();
        assert_eq!(odd.code(), 502);
        assert!(odd.to_string().contains("odd number of elements"));

        let dup: SessionError = RegistryError::DuplicateTag("c1".into()).into();
        assert_eq!(dup.code(), 530);
        assert_eq!(dup.to_string(), "Consumer tags must be unique: c1");

        let missing: SessionError = FlowError::UnknownDestination("c9".into()).into();
        assert_eq!(missing.code(), 404);

        let locked: SessionError = QueueError::ExclusivelyHeld("q".into()).into();
        assert_eq!(locked.code(), 405);
    }
}
