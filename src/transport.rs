//! Transport seam.
//!
//! The socket implementation lives outside this crate. A [`Transport`] opens
//! one [`Connection`] per attempt and pushes everything that happens on it
//! into the channel it was handed.

use crate::config::TlsVersion;
use crate::error::Result;
use crossbeam_channel::Sender;
use std::fmt;
use std::time::Duration;

/// Why a link closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub message: String,
    /// Close code, if the transport has one (1000 = normal, 1006 = abnormal).
    pub code: Option<u16>,
}

impl DisconnectReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One inbound text frame.
    Message(String),
    /// Answer to a ping.
    Pong,
    /// Protocol or I/O error; the link may still be open.
    Error(String),
    /// The link is gone.
    Closed(DisconnectReason),
}

/// Parameters for opening a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub tls_min_version: Option<TlsVersion>,
    pub tls_max_version: Option<TlsVersion>,
    pub timeout: Duration,
}

/// An open link.
pub trait Connection: Send + Sync {
    fn send_text(&self, text: &str) -> Result<()>;

    fn send_ping(&self) -> Result<()>;

    /// Close the link. Must be idempotent.
    fn close(&self);
}

/// Opens links to the live-query endpoint.
pub trait Transport: Send + Sync {
    /// Open a link, or fail with [`LiveQueryError::Connection`](crate::LiveQueryError::Connection).
    fn connect(&self, request: &ConnectRequest, events: Sender<TransportEvent>) -> Result<Box<dyn Connection>>;
}
