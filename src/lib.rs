pub mod client;
pub mod queue;
pub mod record;
pub mod server;
pub mod signal;
pub mod term;
pub mod vsock;


// Re-export the frame layer for direct access
pub use queue::{FrameQueue, QueueError, Receive};
pub use record::{Record, RecordType, WindowSize};

// Re-export the main driver APIs for easy access
pub use client::{ClientError, ClientResult, run_download, run_terminal_session, run_upload};
pub use server::{Server, Session, SessionError, SessionMode};

/// Error returned by binary-level glue.
///
/// The library surfaces typed errors (`QueueError`, `SessionError`,
/// `ClientError`); the binaries collapse them into a boxed error for
/// their `main` plumbing.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for vsock-shell operations.
pub type Result<T> = std::result::Result<T, Error>;
