use thiserror::Error;

use crate::state::{ConnectionState, FailureReason};

/// Errors that can occur when working with a ring session
#[derive(Error, Debug)]
pub enum RingError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter or transport backend is present
    #[error("No Bluetooth link available")]
    LinkUnavailable,

    /// Device not found during scanning
    #[error("Ring device not found")]
    DeviceNotFound,

    /// A session is already running on this supervisor
    #[error("A ring session is already active")]
    SessionActive,

    /// The session reached a terminal failure
    #[error("Session failed: {0}")]
    SessionFailed(FailureReason),

    /// The session cannot accept commands in its current state
    #[error("Session not ready: {state}")]
    NotReady {
        /// State the session was in when the request was made
        state: ConnectionState,
    },

    /// Command or connection step timeout
    #[error("Timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The transport refused a command write
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// Generic transport failure reported by a backend
    #[error("Transport error: {0}")]
    Transport(String),

    /// Device disconnected
    #[error("Device disconnected")]
    Disconnected,

    /// The operation was discarded because the session was torn down
    #[error("Operation cancelled by session teardown")]
    Cancelled,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The transport backend has no way to perform the operation
    #[error("Not supported by this transport: {0}")]
    Unsupported(&'static str),
}

/// Result type for ring operations
pub type Result<T> = std::result::Result<T, RingError>;

impl RingError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::LinkUnavailable
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::Transport(_)
        )
    }

    /// Check if this error is recoverable by retrying the same operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::CommandRejected(_)
            | Self::Transport(_)
            | Self::Ble(_)
            | Self::NotReady { .. } => true,
            Self::SessionFailed(reason) => reason.is_retryable(),
            _ => false,
        }
    }
}
