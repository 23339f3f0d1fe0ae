//! Error types for the firehose client.

use firehose_protocol::{BlockIntegrityError, ProtocolError};
use thiserror::Error;

/// Boxed error returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for client operations.
pub type FirehoseResult<T> = Result<T, FirehoseError>;

/// Errors that can occur while streaming.
#[derive(Error, Debug)]
pub enum FirehoseError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether reconnecting may succeed.
        retryable: bool,
    },

    /// A message could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    /// A block did not hash to its declared CID.
    #[error(transparent)]
    BlockIntegrity(#[from] BlockIntegrityError),

    /// The application's event handler failed.
    #[error("event handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The cursor store failed to record a position.
    #[error("cursor update failed: {0}")]
    Cursor(#[source] BoxError),

    /// No message arrived within the idle timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to firehose")]
    NotConnected,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl FirehoseError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Wraps an application handler failure.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Self::Handler(err.into())
    }

    /// Returns true if reconnecting (from the last cursor) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FirehoseError::Transport { retryable, .. } => *retryable,
            FirehoseError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if the error ends the streaming session.
    ///
    /// Everything else is scoped to a single message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FirehoseError::Transport { .. }
                | FirehoseError::Timeout
                | FirehoseError::NotConnected
                | FirehoseError::InvalidStateTransition { .. }
        )
    }
}
