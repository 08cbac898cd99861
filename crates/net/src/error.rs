//! Errors raised by the duet host and client

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer hung up, or the connection task is gone
    #[error("Connection closed")]
    ConnectionClosed,

    /// Malformed frame or an envelope out of sequence
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Hello refused by the host (bad token, host full)
    #[error("Host refused the connection: {0}")]
    Rejected(String),

    #[error("Not connected")]
    NotConnected,

    /// The host answered a request with `Response::Error`
    #[error("Server error: {0}")]
    Remote(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),
}
