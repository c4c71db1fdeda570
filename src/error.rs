//! Error types for the live-query client.

use crate::types::RequestId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Main error type for client operations.
#[derive(Debug, Error)]
pub enum LiveQueryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Client is closed")]
    Closed,

    #[error("Circuit breaker is open (retry in {retry_in:?})")]
    CircuitOpen { retry_in: Option<Duration> },

    #[error("Handshake not acknowledged within {0:?}")]
    HandshakeTimeout(Duration),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Event queue is not running")]
    QueueNotRunning,

    #[error("Event queue is already running")]
    QueueAlreadyRunning,

    #[error("Processing error: {0}")]
    Processing(String),
}

impl From<serde_json::Error> for LiveQueryError {
    fn from(e: serde_json::Error) -> Self {
        LiveQueryError::Serialization(e.to_string())
    }
}

/// A server-side rejection scoped to one subscription.
///
/// Delivered to that subscription's error callbacks; never fatal to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionError {
    pub request_id: RequestId,
    /// Server error code, when the server supplied one.
    pub code: Option<i64>,
    pub message: String,
    /// Whether the server suggested the client may retry.
    pub reconnect: bool,
}

impl SubscriptionError {
    pub fn new(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            code: None,
            message: message.into(),
            reconnect: false,
        }
    }
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(
                f,
                "subscription {} failed: {} (code {})",
                self.request_id, self.message, code
            ),
            None => write!(f, "subscription {} failed: {}", self.request_id, self.message),
        }
    }
}

impl std::error::Error for SubscriptionError {}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, LiveQueryError>;
