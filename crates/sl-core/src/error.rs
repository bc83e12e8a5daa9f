//! # RelayError
//!
//! Centralized error handling for the Staffline relay core.
//! Maps transport and storage failures to actionable error types.

use thiserror::Error;

use crate::models::UserId;

/// Failures reported by a [`crate::traits::ChatTransport`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel, message or user no longer exists on the platform.
    #[error("{0} not found")]
    NotFound(String),

    /// The platform refused the call (e.g. the user closed their DMs).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Anything else: rate limits, timeouts, malformed responses.
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }
}

/// The primary error type for all sl-core operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Resource not found (e.g., Thread, Block entry)
    #[error("{0} not found with ID {1}")]
    NotFound(String, String),

    /// A relay message could not reach the recipient's private channel.
    /// Callers use this to tell the operator the message was not delivered.
    #[error("message could not be delivered to {recipient}: {source}")]
    Undeliverable {
        recipient: UserId,
        #[source]
        source: TransportError,
    },

    /// The thread finished closing while the operation was in flight.
    #[error("thread for recipient {0} is closed")]
    ThreadClosed(UserId),

    /// Validation failure (e.g., negative close delay, malformed duration)
    #[error("validation error: {0}")]
    Validation(String),

    /// Startup recovery has not finished; the event should be redelivered.
    #[error("relay is still starting")]
    NotReady,

    /// The persistent store did not answer the startup probe.
    #[error("storage is unreachable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Infrastructure failure surfaced by a storage port.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A specialized Result type for relay logic.
pub type Result<T> = std::result::Result<T, RelayError>;
