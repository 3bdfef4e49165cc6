//! Error types for the mock search backend
//!
//! Every error here is fatal to the test that triggered it. The mock never
//! retries or recovers: its purpose is to surface protocol deviations
//! immediately and synchronously to the caller.

use thiserror::Error;

use crate::ledger::CursorHandle;

pub type Result<T> = std::result::Result<T, MockError>;

/// Why a handle is no longer live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    /// Never registered on this instance
    NeverRegistered,
    /// Queue drained by ordinary processing
    Exhausted,
    /// Discarded by an explicit cancellation
    Cancelled,
}

impl std::fmt::Display for DeadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadReason::NeverRegistered => f.write_str("never registered"),
            DeadReason::Exhausted => f.write_str("exhausted"),
            DeadReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MockError {
    #[error("Protocol violation on cursor {handle}: {diff}")]
    ProtocolViolation { handle: CursorHandle, diff: String },

    #[error("Protocol violation on plan exchange: {diff}")]
    PlanViolation { diff: String },

    #[error("Unknown cursor {handle} ({reason})")]
    UnknownCursor { handle: CursorHandle, reason: DeadReason },

    #[error("Premature cancellation of cursor {handle}: {remaining} mandatory step(s) unconsumed")]
    PrematureCancellation { handle: CursorHandle, remaining: usize },

    #[error("Unused history: {0}")]
    UnusedHistory(String),

    #[error("Unexpected command on host '{host}': {request}")]
    UnexpectedCommand { host: String, request: String },

    #[error("Cursor {0} is already registered and still open")]
    CursorExists(CursorHandle),

    #[error("Cursor id 0 is reserved for exhaustion")]
    ReservedCursorId,

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    // Host routing
    #[error("Host '{0}' already exists")]
    HostExists(String),

    #[error("Host '{0}' not found")]
    HostNotFound(String),

    #[error("Host '{0}' is in use and cannot be dropped")]
    HostInUse(String),

    #[error("Invalid host name: {0}")]
    InvalidHostName(String),

    #[error("No host attached")]
    NoHostAttached,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MockError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            MockError::ProtocolViolation { .. } | MockError::PlanViolation { .. } => "PROTOCOL_VIOLATION",
            MockError::UnknownCursor { .. } => "UNKNOWN_CURSOR",
            MockError::PrematureCancellation { .. } => "PREMATURE_CANCELLATION",
            MockError::UnusedHistory(_) => "UNUSED_HISTORY",
            MockError::UnexpectedCommand { .. } => "UNEXPECTED_COMMAND",
            MockError::CursorExists(_) => "CURSOR_EXISTS",
            MockError::ReservedCursorId => "RESERVED_CURSOR_ID",
            MockError::InvalidScript(_) => "INVALID_SCRIPT",
            MockError::HostExists(_) => "HOST_EXISTS",
            MockError::HostNotFound(_) => "HOST_NOT_FOUND",
            MockError::HostInUse(_) => "HOST_IN_USE",
            MockError::InvalidHostName(_) => "INVALID_HOST_NAME",
            MockError::NoHostAttached => "NO_HOST_ATTACHED",
            MockError::InvalidRequest(_) => "INVALID_REQUEST",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True for the protocol failures a test author must fix.
    pub fn is_protocol_failure(&self) -> bool {
        matches!(
            self,
            MockError::ProtocolViolation { .. }
                | MockError::PlanViolation { .. }
                | MockError::UnknownCursor { .. }
                | MockError::PrematureCancellation { .. }
                | MockError::UnusedHistory(_)
        )
    }
}
