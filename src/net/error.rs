use std::io;

use thiserror::Error;

/// Failures below the status line: nothing came back from the peer that
/// could be classified.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to {host}: {reason}")]
    Connect { host: String, reason: String },
    #[error("connection to {host} lost: {reason}")]
    ConnectionLost { host: String, reason: String },
    #[error("stream to {host} failed: {reason}")]
    Stream { host: String, reason: String },
    #[error("call to {host} timed out")]
    TimedOut { host: String },
    #[error("no route to {host}")]
    NoRoute { host: String },
    #[error("reply from {host} has no status")]
    NoStatus { host: String },
    #[error("reply of {size} bytes exceeds the frame limit")]
    TooLarge { size: usize },
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
