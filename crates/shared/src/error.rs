//! Shared error types for the transport layer.

use std::time::Duration;

use thiserror::Error;

/// Failure to turn an inbound payload into a [`crate::Message`].
///
/// These are always recoverable: the offending payload is logged and dropped
/// and the channel keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error("payload has no string `type` field")]
    MissingType,
    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("invalid binary frame: {0}")]
    InvalidBinary(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidJson(err.to_string())
    }
}

/// Error returned by transport operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// A write was attempted while the channel is down. The value was queued.
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The underlying socket, frame or bridge channel failed.
    #[error("channel error: {0}")]
    Channel(String),
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("subscriber failed: {0}")]
    Subscriber(String),
    /// The remote peer answered `success: false`.
    #[error("{operation} failed: {message}")]
    RemoteOperation { operation: String, message: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    pub fn channel(msg: impl Into<String>) -> Self {
        TransportError::Channel(msg.into())
    }

    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError::RemoteOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is about connectivity rather than the request itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected | TransportError::Channel(_) | TransportError::Timeout(_)
        )
    }
}
