// ABOUTME: Error taxonomy for the client
// ABOUTME: Maps transport, protocol, timing and audio failures to one enum

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the client.
///
/// `Network`, `Protocol` and `Timeout` are session-fatal but recoverable: the
/// controller tears the session down and reconnects. `UnsupportedCodec` and
/// `Sink` end the session the same way; a fresh session re-negotiates the
/// codec from scratch.
#[derive(Debug, Error)]
pub enum Error {
    /// Connect, read or write failure, or remote close.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed frame or body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unanswered requests accumulated past the session limit.
    #[error("no response from server for {0:?}")]
    Timeout(Duration),

    /// The server announced a codec this build cannot decode.
    #[error("codec not supported: {0:?}")]
    UnsupportedCodec(String),

    /// Audio device failure.
    #[error("audio sink error: {0}")]
    Sink(String),

    /// Invariant violation; a bug in this crate. Construct via
    /// [`Error::internal`], which panics in debug builds.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// An invariant violation. Debug builds panic at the offending site;
    /// release builds fail the session and let the controller reconnect.
    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug_assert!(false, "internal error: {msg}");
        Error::Internal(msg)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
