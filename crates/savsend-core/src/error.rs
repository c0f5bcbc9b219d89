//! Error types for savsend sessions
//!
//! Every failure is surfaced at the session boundary; neither the transfer
//! engine nor a block device retries internally. A retry is always a fresh,
//! user-initiated session.
//!
//! # Error Kinds
//!
//! - **Config**: missing or unparseable endpoint configuration (fatal, before any session)
//! - **Device**: detection, read or commit failure on the save chip
//! - **Connect**: resolution or connection failure (device untouched)
//! - **Transfer**: the channel closed or failed mid-transfer
//!
//! # Example
//!
//! ```no_run
//! use savsend_core::Error;
//!
//! fn report(err: &Error) {
//!     eprintln!("{}", err.status_message());
//!     if err.device_state_undefined() {
//!         eprintln!("The save chip must be restored again before use.");
//!     }
//! }
//! ```

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::engine::Direction;

/// Coarse classification of a session failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Endpoint configuration missing or invalid
    Config,
    /// Save chip detection, read or write failed
    Device,
    /// Endpoint could not be resolved or connected
    Connect,
    /// Channel failed mid-transfer
    Transfer,
    /// Transfer stopped through a cancel token
    Cancelled,
}

/// Endpoint and settings configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Endpoint file could not be read
    #[error("cannot read endpoint file {}: {source}", path.display())]
    Read {
        /// File that was opened
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// First line (hostname) missing or blank
    #[error("missing server hostname on line 1")]
    MissingHost,

    /// Second line (port) missing or blank
    #[error("missing server port on line 2")]
    MissingPort,

    /// Port is not a decimal number in 1..=65535
    #[error("invalid server port {0:?}: expected a decimal number between 1 and 65535")]
    InvalidPort(String),

    /// Any other invalid setting
    #[error("{0}")]
    Invalid(Cow<'static, str>),
}

/// Save chip (block device) errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Chip probe returned a negative type code
    #[error("unrecognised device type {0}")]
    InvalidKind(i32),

    /// Chip probe reported no storage
    #[error("device reports zero size")]
    EmptyDevice,

    /// Chip returned fewer bytes than its reported size
    #[error("device returned {actual} bytes, expected {expected}")]
    ShortRead {
        /// Detected size
        expected: usize,
        /// Bytes actually read
        actual: usize,
    },

    /// Image to write does not match the chip size
    #[error("image of {actual} bytes does not match device size {expected}")]
    SizeMismatch {
        /// Detected size
        expected: usize,
        /// Size of the supplied image
        actual: usize,
    },

    /// Erase or write failed part way through
    #[error("write failed after erase started: {0}")]
    Write(String),

    /// Other I/O failure while probing or reading
    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Returns true if the chip may have been modified before the failure
    #[must_use]
    pub fn touched_device(&self) -> bool {
        matches!(self, DeviceError::Write(_))
    }
}

/// Endpoint resolution and connection errors
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Endpoint value cannot be used (e.g. port 0)
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(Cow<'static, str>),

    /// Host name lookup failed
    #[error("cannot resolve {host}: {reason}")]
    Resolve {
        /// Host that was looked up
        host: String,
        /// Resolver message
        reason: String,
    },

    /// Host name resolved to nothing
    #[error("{host} did not resolve to any address")]
    NoAddress {
        /// Host that was looked up
        host: String,
    },

    /// TCP connect was refused or failed
    #[error("connection to {addr} failed: {source}")]
    Connect {
        /// Resolved address
        addr: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// TCP connect did not complete in time
    #[error("connection to {addr} timed out after {timeout:?}")]
    Timeout {
        /// Resolved address
        addr: SocketAddr,
        /// Configured limit
        timeout: Duration,
    },
}

/// Why a transfer stopped before the blob was complete
#[derive(Debug, Error)]
pub enum TransferFailure {
    /// A call moved zero bytes: the peer closed the stream
    #[error("channel closed by peer")]
    Closed,

    /// The channel reported an error
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The channel claimed more bytes than were requested
    #[error("channel reported {reported} bytes for a {requested}-byte request")]
    Overreport {
        /// Bytes requested
        requested: usize,
        /// Bytes claimed by the channel
        reported: usize,
    },

    /// A single call made no progress within the configured I/O timeout
    #[error("no progress from peer for {0:?}")]
    Timeout(Duration),

    /// The cancel token was set
    #[error("transfer cancelled")]
    Cancelled,
}

/// A transfer that ended in the `Failed` state
///
/// `offset` counts only the bytes moved before the failing call.
#[derive(Debug, Error)]
#[error("{direction} failed after {offset} of {size} bytes: {cause}")]
pub struct TransferError {
    /// Direction of the failed transfer
    pub direction: Direction,
    /// Bytes moved before the failure
    pub offset: usize,
    /// Total blob size
    pub size: usize,
    /// What went wrong
    #[source]
    pub cause: TransferFailure,
}

impl TransferError {
    /// Returns true if the failure came from a cancel token
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, TransferFailure::Cancelled)
    }
}

/// Top-level session error
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Device detection or read error (device untouched)
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Erase/write of a received image failed
    #[error("device commit failed: {0}")]
    Commit(#[source] DeviceError),

    /// Endpoint could not be reached
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Transfer failed mid-stream
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl Error {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Device(_) | Error::Commit(_) => ErrorKind::Device,
            Error::Connect(_) => ErrorKind::Connect,
            Error::Transfer(e) if e.is_cancelled() => ErrorKind::Cancelled,
            Error::Transfer(_) => ErrorKind::Transfer,
        }
    }

    /// Returns true if the save chip may be erased or partially written
    ///
    /// Only a failed commit can leave the chip in this state. The user must
    /// run a restore again before relying on the device.
    #[must_use]
    pub fn device_state_undefined(&self) -> bool {
        matches!(self, Error::Commit(e) if e.touched_device())
    }

    /// Human-readable status line for the user
    ///
    /// Each error kind produces a distinct message.
    #[must_use]
    pub fn status_message(&self) -> String {
        match self {
            Error::Config(e) => format!("Error reading configuration: {e}"),
            Error::Device(e) => format!("Error determining save chip: {e}"),
            Error::Commit(e) if e.touched_device() => format!(
                "WRITE FAILED: the save chip may be erased or partially written ({e}). \
                 Run the restore again before using the card."
            ),
            Error::Commit(e) => format!("Restore rejected, save chip untouched: {e}"),
            Error::Connect(e) => format!("Error connecting to server: {e}"),
            Error::Transfer(e) if e.is_cancelled() => format!(
                "Transfer cancelled after {} of {} bytes",
                e.offset, e.size
            ),
            Error::Transfer(e) => match e.direction {
                Direction::Send => format!(
                    "Error during send: {e}. The server copy is incomplete and must be discarded."
                ),
                Direction::Receive => {
                    format!("Error during recv: {e}. The save chip was not modified.")
                }
            },
        }
    }
}

/// Result type for savsend operations
pub type Result<T> = std::result::Result<T, Error>;
