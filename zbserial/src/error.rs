//! Error types for zbserial.

use std::io;
use thiserror::Error;

/// Result type for zbserial operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for zbserial operations.
///
/// Watcher failures and partial enumeration failures are not represented here:
/// they are reported through the log and, for the watcher, a
/// [`PortEvent::Error`](crate::PortEvent::Error) notification.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation requires an open port.
    #[error("Port is not open")]
    NotOpen,

    /// The OS refused to hand out or set up the port handle.
    #[error("Cannot open port {port}: {source}")]
    OpenFailure {
        /// Identifier that was being opened.
        port: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A read or write failed at the OS level. The port has been closed.
    #[error("Transfer failed: {0}")]
    Transfer(#[source] io::Error),

    /// Pushing the control block to a live handle failed.
    #[error("Cannot apply port settings: {0}")]
    Configure(#[source] io::Error),

    /// Data bits outside the supported 5..=8 range.
    #[error("Unsupported data bits: {0} (expected 5-8)")]
    InvalidDataBits(u8),

    /// Any other I/O error (restoring settings on close, spawning the watcher).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
