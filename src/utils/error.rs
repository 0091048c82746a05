//! The `error` module defines the error type used throughout `mqrelay`.
//!
//! Configuration errors decide the process exit status, protocol and
//! transport errors scoped to a single connection close only that
//! connection, and bind or fatal transport errors stop the relay.

use thiserror::Error;

/// Errors raised while resolving configuration or relaying messages.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The argument count was neither 2 nor 4.
    #[error("missing arguments")]
    MissingArguments,
    /// An argument was present but not acceptable.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// Runtime settings were loaded but are out of range.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    /// Runtime settings could not be loaded.
    #[error("failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),
    /// One of the two endpoints could not be bound.
    #[error("failed to bind {endpoint} to {url}: {source}")]
    Bind {
        endpoint: &'static str,
        url: String,
        #[source]
        source: std::io::Error,
    },
    /// A wire payload carried no frames.
    #[error("message has no frames")]
    EmptyMessage,
    /// A frame header or body ran past the end of the payload.
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    TruncatedFrame { needed: usize, available: usize },
    /// A backend message was not a subscribe/unsubscribe control frame.
    #[error("malformed control frame: {0}")]
    MalformedControl(String),
    /// A WebSocket frame type the protocol does not use.
    #[error("unsupported websocket frame: {0}")]
    UnsupportedFrame(&'static str),
    /// The WebSocket handshake did not finish in time.
    #[error("websocket handshake timed out")]
    HandshakeTimeout,
    /// WebSocket transport error on a single connection.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Unrecoverable I/O failure of a listening endpoint.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl RelayError {
    /// Process exit status for an error that ends the relay.
    pub fn exit_code(&self) -> u8 {
        match self {
            RelayError::InvalidArguments(_) => 2,
            _ => 1,
        }
    }

    /// Whether the error came from the positional arguments, in which case
    /// the usage summary is printed after the diagnostic.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            RelayError::MissingArguments | RelayError::InvalidArguments(_)
        )
    }
}
