//! Error taxonomy for the messaging core.
//!
//! Four families matter for recovery:
//!
//! - [`ClientError::Transport`] - socket-level failure, triggers reconnect
//! - [`ClientError::Delivery`] - a send attempt failed, triggers pipeline retry
//! - [`ClientError::ReconciliationConflict`] - ack for an unknown temp id,
//!   logged and treated as a new server message
//! - [`ClientError::Protocol`] - malformed frame, dropped and counted
//!
//! None of them is fatal to the connection. Terminal delivery failure is
//! expressed as a `failed` message status, never as an error value.

// Rust guideline compliant 2026-02

use crate::model::{SendErrorCode, TempId};

/// Errors produced by the messaging core.
#[derive(Debug)]
pub enum ClientError {
    /// Socket-level failure (connect refused, read/write error, stream end).
    Transport(String),
    /// A send attempt failed on every configured route.
    Delivery(String),
    /// An acknowledgement referenced a temp id with no local record.
    ReconciliationConflict(TempId),
    /// Frame could not be decoded.
    Protocol(String),
    /// HTTP collaborator answered with a non-success status.
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },
    /// Invalid configuration value.
    Config(String),
    /// The session or connection was closed.
    Closed,
}

impl ClientError {
    /// Whether retrying the failed operation can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Delivery(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::ReconciliationConflict(_) | Self::Protocol(_) => true,
            Self::Config(_) | Self::Closed => false,
        }
    }

    /// Classify a failed send attempt.
    ///
    /// Delivery errors only carry text, so their cause is read from the
    /// `HTTP <status>:` prefix the REST route writes, or from keywords.
    pub fn send_error_code(&self) -> SendErrorCode {
        match self {
            Self::Transport(_) | Self::Closed => SendErrorCode::NotConnected,
            Self::Http { status, .. } => SendErrorCode::from_status(*status),
            Self::Protocol(_) => SendErrorCode::PayloadInvalid,
            Self::Delivery(msg) => delivery_error_code(msg),
            Self::ReconciliationConflict(_) | Self::Config(_) => SendErrorCode::Unknown,
        }
    }
}

fn delivery_error_code(msg: &str) -> SendErrorCode {
    let msg = msg.to_ascii_lowercase();
    if let Some(status) = msg
        .strip_prefix("http ")
        .and_then(|rest| rest.split(':').next())
        .and_then(|code| code.trim().parse::<u16>().ok())
    {
        return SendErrorCode::from_status(status);
    }
    if msg.contains("timed out") || msg.contains("timeout") {
        SendErrorCode::Timeout
    } else if msg.contains("rate limit") {
        SendErrorCode::RateLimit
    } else if ["not connected", "no delivery route", "outbound buffer", "connection lost"]
        .iter()
        .any(|needle| msg.contains(needle))
    {
        SendErrorCode::NotConnected
    } else {
        SendErrorCode::Unknown
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Delivery(msg) => write!(f, "Delivery failed: {msg}"),
            Self::ReconciliationConflict(temp_id) => {
                write!(f, "No local record for acknowledged temp id {temp_id}")
            }
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Http { status, message } => write!(f, "HTTP {status}: {message}"),
            Self::Config(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Delivery(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, ClientError>;
