// ABOUTME: Crate-wide error taxonomy for adapter and worker operations
// ABOUTME: Distinguishes device-side failures (timeout, disconnect) from caller and worker faults

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by adapters and their workers.
///
/// Device-side conditions (`Timeout`, `Disconnected`) are recoverable: the
/// adapter stays usable after them. `Worker` indicates an internal fault or an
/// unresponsive worker thread and is never used for device timeouts.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport endpoint could not be opened (bad address, connection
    /// refused, missing serial port).
    #[error("failed to open {endpoint}: {source}")]
    Open {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// A transport write failed or the endpoint disappeared mid-write.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// A transport read failed for a reason other than timeout or disconnect.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// The endpoint closed the connection (empty read or OS-level reset).
    #[error("endpoint disconnected")]
    Disconnected,

    /// No qualifying data arrived within the response window and the timeout
    /// action is [`TimeoutAction::Error`](crate::timeout::TimeoutAction).
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The caller misused the API (uninitialized descriptor, read on a closed
    /// adapter, invalid stop-condition override, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal worker fault, or the worker did not acknowledge a command
    /// within the guard window. Distinct from device timeouts.
    #[error("worker failure: {0}")]
    Worker(String),
}

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, Error>;
