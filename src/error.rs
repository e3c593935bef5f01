//! Error types for the WebSocket session core

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// The connect URL could not be used (missing host, bad scheme, ...)
    InvalidUrl(&'static str),
    /// The requested protocol version is not one this endpoint speaks
    UnsupportedVersion(u16),
    /// The server's Sec-WebSocket-Accept was absent or did not match
    InvalidServerKey,
    /// I/O error from the underlying transport
    Transport(io::Error),
    /// An operation that requires an open session was issued elsewhere
    NotOpened,
    /// Protocol violation detected by the frame decoder
    Protocol {
        /// What was violated
        reason: &'static str,
        /// Close code to reflect to the peer, when one applies
        code: Option<u16>,
    },
    /// The frame encoder rejected a frame (e.g. oversized control payload)
    Encoder(&'static str),
    /// The upgrade exchange itself was malformed
    HandshakeFailed(&'static str),
}

impl Error {
    /// Protocol close code carried by this error, if any
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::Protocol { code, .. } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidUrl(msg) => write!(f, "invalid URL: {}", msg),
            Error::UnsupportedVersion(v) => write!(f, "unsupported protocol version: {}", v),
            Error::InvalidServerKey => write!(f, "invalid server key"),
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::NotOpened => write!(f, "not opened"),
            Error::Protocol { reason, code } => {
                if let Some(code) = code {
                    write!(f, "protocol error: {} (close code {})", reason, code)
                } else {
                    write!(f, "protocol error: {}", reason)
                }
            }
            Error::Encoder(msg) => write!(f, "encoder error: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

/// Close frame code and reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code is valid per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_close_codes() {
        assert!(CloseReason::is_valid_code(1000));
        assert!(CloseReason::is_valid_code(1002));
        assert!(CloseReason::is_valid_code(3000));
        assert!(CloseReason::is_valid_code(4999));
        assert!(!CloseReason::is_valid_code(999));
        assert!(!CloseReason::is_valid_code(1004));
        assert!(!CloseReason::is_valid_code(1005));
        assert!(!CloseReason::is_valid_code(1006));
        assert!(!CloseReason::is_valid_code(2999));
        assert!(!CloseReason::is_valid_code(5000));
    }

    #[test]
    fn test_display() {
        let err = Error::Protocol {
            reason: "bad frame",
            code: Some(1002),
        };
        assert_eq!(err.to_string(), "protocol error: bad frame (close code 1002)");
        assert_eq!(Error::InvalidServerKey.to_string(), "invalid server key");
    }
}
