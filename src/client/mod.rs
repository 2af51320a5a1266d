// ABOUTME: Host-side session drivers and their shared error type

pub mod terminal;
pub mod transfer;

use std::io;

use thiserror::Error;

use crate::queue::QueueError;
use crate::record::PayloadError;

pub use terminal::run_terminal_session;
pub use transfer::{run_download, run_upload};

/// Errors surfaced by the client drivers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Local validation failed before anything was sent.
    #[error("{0}")]
    InvalidRequest(String),

    /// The server answered a transfer request with `KO`.
    #[error("server refused transfer: {0}")]
    Refused(String),

    /// The server closed the connection before the session finished.
    #[error("server closed the connection unexpectedly")]
    ConnectionClosed,

    /// The peer sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<PayloadError> for ClientError {
    fn from(err: PayloadError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result type alias for client driver operations.
pub type ClientResult<T> = Result<T, ClientError>;
