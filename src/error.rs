//! Error types shared by the codec, the provider and the session layer.

use thiserror::Error;

use crate::protocol::{Architecture, BreakpointRegister, Handle};
use crate::session::Opcode;

/// Stable error codes. These travel in the `status` field of error frames.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TruncatedRecord = 1,
    InvalidEnumValue = 2,
    ArchitectureMismatch = 3,
    InvalidHandle = 4,
    InvalidConfiguration = 5,
    RegisterInUse = 6,
    OutOfOrderContinuation = 7,
    UnsupportedInstruction = 8,
    SessionClosed = 9,
    TransportFailure = 10,
    NotAttached = 11,
    InvalidLength = 12,
    Cancelled = 13,
    Backend = 14,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 14] = [
        ErrorKind::TruncatedRecord,
        ErrorKind::InvalidEnumValue,
        ErrorKind::ArchitectureMismatch,
        ErrorKind::InvalidHandle,
        ErrorKind::InvalidConfiguration,
        ErrorKind::RegisterInUse,
        ErrorKind::OutOfOrderContinuation,
        ErrorKind::UnsupportedInstruction,
        ErrorKind::SessionClosed,
        ErrorKind::TransportFailure,
        ErrorKind::NotAttached,
        ErrorKind::InvalidLength,
        ErrorKind::Cancelled,
        ErrorKind::Backend,
    ];

    /// Look up a kind by its wire code
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| *k as u16 == code)
    }

    /// Errors after which the server tears the session down
    pub fn is_session_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::OutOfOrderContinuation | ErrorKind::TransportFailure
        )
    }

    /// Errors the controller may retry with corrected input
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidHandle
                | ErrorKind::InvalidConfiguration
                | ErrorKind::RegisterInUse
                | ErrorKind::UnsupportedInstruction
                | ErrorKind::NotAttached
                | ErrorKind::Backend
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("truncated {record}: need {expected} bytes, got {actual}")]
    TruncatedRecord {
        record: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid {field} value {value:#x}")]
    InvalidEnumValue { field: &'static str, value: u32 },

    #[error("invalid {field} length {length}")]
    InvalidLength { field: &'static str, length: i64 },

    #[error("register snapshot is {found}, session target is {expected}")]
    ArchitectureMismatch {
        expected: Architecture,
        found: Architecture,
    },

    #[error("handle {0} does not resolve")]
    InvalidHandle(Handle),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{register} already in use on thread {thread}")]
    RegisterInUse {
        thread: Handle,
        register: BreakpointRegister,
    },

    #[error("{0}")]
    OutOfOrderContinuation(&'static str),

    #[error("no decode rule matches bytes at {address:#x}")]
    UnsupportedInstruction { address: u64 },

    #[error("session closed")]
    SessionClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("no debugger attached to this session")]
    NotAttached,

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),

    /// An error reported by the remote end, reconstructed from an error frame
    #[error("{kind}: {message}")]
    Remote { kind: ErrorKind, message: String },
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::TruncatedRecord { .. } => ErrorKind::TruncatedRecord,
            ProtocolError::InvalidEnumValue { .. } => ErrorKind::InvalidEnumValue,
            ProtocolError::InvalidLength { .. } => ErrorKind::InvalidLength,
            ProtocolError::ArchitectureMismatch { .. } => ErrorKind::ArchitectureMismatch,
            ProtocolError::InvalidHandle(_) => ErrorKind::InvalidHandle,
            ProtocolError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            ProtocolError::RegisterInUse { .. } => ErrorKind::RegisterInUse,
            ProtocolError::OutOfOrderContinuation(_) => ErrorKind::OutOfOrderContinuation,
            ProtocolError::UnsupportedInstruction { .. } => ErrorKind::UnsupportedInstruction,
            ProtocolError::SessionClosed => ErrorKind::SessionClosed,
            ProtocolError::Cancelled => ErrorKind::Cancelled,
            ProtocolError::NotAttached => ErrorKind::NotAttached,
            ProtocolError::TransportFailure(_) | ProtocolError::Io(_) => {
                ErrorKind::TransportFailure
            }
            ProtocolError::Backend(_) => ErrorKind::Backend,
            ProtocolError::Remote { kind, .. } => *kind,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A failure as seen by the controller: which operation failed, and why
#[derive(Error, Debug)]
#[error("{op} failed: {kind}: {message}")]
pub struct OperationError {
    pub op: Opcode,
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(op: Opcode, err: &ProtocolError) -> Self {
        let message = match err {
            ProtocolError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            op,
            kind: err.kind(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_code(kind as u16), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(999), None);
    }

    #[test]
    fn test_error_classes() {
        assert!(ErrorKind::OutOfOrderContinuation.is_session_fatal());
        assert!(ErrorKind::TransportFailure.is_session_fatal());
        assert!(ErrorKind::RegisterInUse.is_recoverable());
        assert!(!ErrorKind::RegisterInUse.is_session_fatal());
    }

    #[test]
    fn test_operation_error_names_operation() {
        let err = OperationError::new(
            Opcode::SetBreakpoint,
            &ProtocolError::InvalidConfiguration("execute needs size 1".into()),
        );
        let text = err.to_string();
        assert!(text.contains("SetBreakpoint"));
        assert!(text.contains("InvalidConfiguration"));
    }
}
