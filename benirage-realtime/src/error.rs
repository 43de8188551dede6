//! Connectivity error taxonomy.
//!
//! Every failure that crosses the transport boundary is tagged with an
//! [`ErrorKind`] at the point where it is produced (HTTP status, socket
//! error variant, client timeout), so callers never have to inspect
//! human-readable messages to decide how to react.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a connectivity failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Socket could not be opened, DNS failed, connection reset
    NetworkError,
    /// Request or handshake exceeded its deadline
    Timeout,
    /// Backend rejected our credentials (401/403)
    Unauthorized,
    /// Backend reachable but not serving (502/503/5xx)
    ServiceUnavailable,
    /// Session cookie could not be stored or read back
    CookieError,
    /// Anything we could not classify
    Unknown,
}

impl ErrorKind {
    /// Stable snake_case identifier, used in logs and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::CookieError => "cookie_error",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => {
                "Unable to reach the server. Please check your internet connection."
            }
            ErrorKind::Timeout => "The server is taking too long to respond. Please try again.",
            ErrorKind::Unauthorized => "Your session has expired. Please sign in again.",
            ErrorKind::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again shortly."
            }
            ErrorKind::CookieError => {
                "Session storage is unavailable. Please enable cookies for this site."
            }
            ErrorKind::Unknown => "An unexpected connection error occurred.",
        }
    }

    /// Map an HTTP status code onto the taxonomy.
    ///
    /// Returns `None` for statuses that are not failures (1xx-3xx).
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            100..=399 => None,
            401 | 403 => Some(ErrorKind::Unauthorized),
            408 | 504 => Some(ErrorKind::Timeout),
            500..=599 => Some(ErrorKind::ServiceUnavailable),
            _ => Some(ErrorKind::Unknown),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by the realtime or data backend, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn cookie(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CookieError, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Build an error from a failed HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = ErrorKind::from_status(status).unwrap_or(ErrorKind::Unknown);
        let detail = body.trim();
        if detail.is_empty() {
            Self::new(kind, format!("HTTP {status}"))
        } else {
            Self::new(kind, format!("HTTP {status}: {detail}"))
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::timeout(e.to_string());
        }
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), "");
        }
        if e.is_connect() || e.is_request() {
            return Self::network(e.to_string());
        }
        Self::unknown(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(response) => Self::from_status(response.status().as_u16(), ""),
            WsError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                Self::timeout(io.to_string())
            }
            WsError::Io(io) => Self::network(io.to_string()),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::network("realtime socket closed")
            }
            WsError::Tls(tls) => Self::network(tls.to_string()),
            other => Self::unknown(other.to_string()),
        }
    }
}
