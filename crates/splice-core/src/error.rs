//! Error types for splice-core
//!
//! Centralized error handling using `thiserror` for ergonomic error definitions.

use crate::modifier::ParseError;
use crate::tcp::TcpState;
use std::time::Duration;
use thiserror::Error;

/// Main error type for splice-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Frame parsing failed
    #[error("Frame parsing error: {message}")]
    FrameParse {
        /// Detailed error message
        message: String,
        /// Offset in the frame where the error occurred
        offset: Option<usize>,
    },

    /// Frame is too small to hold the header being parsed
    #[error("Frame too small: expected at least {expected} bytes, got {actual}")]
    FrameTooSmall {
        /// Minimum expected size
        expected: usize,
        /// Actual frame size
        actual: usize,
    },

    /// Operation is not valid in the socket's current state
    #[error("Cannot {operation} a socket in state {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the socket was in
        state: TcpState,
    },

    /// A blocking operation did not complete in time
    #[error("Timed out after {after:?} waiting to {operation}")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Time waited
        after: Duration,
    },

    /// Connection establishment failed
    #[error("Connection to {peer} failed: {reason}")]
    ConnectFailed {
        /// Remote endpoint
        peer: String,
        /// Failure reason
        reason: String,
    },

    /// The peer reset the connection
    #[error("Connection reset by peer")]
    ConnectionReset,

    /// The stream was closed locally
    #[error("Stream closed")]
    StreamClosed,

    /// Message parsing inside a stream failed
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Body decoding failed
    #[error("Content decoding failed for '{encoding}': {message}")]
    Decode {
        /// Content encoding that failed
        encoding: String,
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// Invalid port number
    #[error("Invalid port number: {port} (must be 1-65535)")]
    InvalidPort {
        /// The invalid port
        port: u32,
    },

    /// Handler failed while processing a frame
    #[error("Handler '{handler}' failed: {message}")]
    Handler {
        /// Name of the handler that failed
        handler: String,
        /// Error message
        message: String,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Hex decoding error
    #[error("Hex decoding error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a frame parse error
    pub fn frame_parse(message: impl Into<String>) -> Self {
        Self::FrameParse {
            message: message.into(),
            offset: None,
        }
    }

    /// Create a frame parse error with offset
    pub fn frame_parse_at(message: impl Into<String>, offset: usize) -> Self {
        Self::FrameParse {
            message: message.into(),
            offset: Some(offset),
        }
    }

    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a connect failure
    pub fn connect_failed(peer: impl ToString, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    /// Ensure `len` bytes are available
    pub(crate) fn ensure_len(data: &[u8], expected: usize) -> Result<()> {
        if data.len() < expected {
            return Err(Self::FrameTooSmall {
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        let kind = match &err {
            Error::ConnectionReset => ErrorKind::ConnectionReset,
            Error::StreamClosed => ErrorKind::ConnectionAborted,
            Error::Timeout { .. } => ErrorKind::TimedOut,
            Error::InvalidState { .. } => ErrorKind::NotConnected,
            _ => ErrorKind::Other,
        };
        match err {
            Error::Io(io) => io,
            other => std::io::Error::new(kind, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::frame_parse("Invalid header");
        assert!(err.to_string().contains("Invalid header"));

        let err = Error::InvalidState {
            operation: "send on",
            state: TcpState::Listen,
        };
        assert!(err.to_string().contains("Listen"));
    }

    #[test]
    fn test_error_with_offset() {
        let err = Error::frame_parse_at("Invalid byte", 42);
        match err {
            Error::FrameParse { offset, .. } => assert_eq!(offset, Some(42)),
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_into_io_error_kind() {
        let io: std::io::Error = Error::ConnectionReset.into();
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionReset);

        let io: std::io::Error = Error::StreamClosed.into();
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionAborted);
    }
}
