//! # savsend Core
//!
//! Dump and restore the save memory of a storage chip over a network stream.
//!
//! This crate provides:
//! - [`StorageBlob`], the fixed-size chip image
//! - [`TransferEngine`], a chunked send/receive loop that tolerates short
//!   reads and writes and pauses after every chunk
//! - [`SessionController`], the detect -> connect -> transfer -> commit state
//!   machine
//! - Capability traits for the chip ([`BlockDevice`]), the endpoint
//!   ([`EndpointResolver`]) and the stream ([`Channel`]), with TCP and
//!   image-file implementations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     SessionController                           │
//! │   (one dump or restore: detect, connect, transfer, commit)      │
//! ├──────────────────────┬──────────────────────┬───────────────────┤
//! │     BlockDevice      │    TransferEngine    │ EndpointResolver  │
//! │  (probe/read/erase   │  (chunked loop over  │ (host:port to a   │
//! │   and write chip)    │   StorageBlob)       │  Channel)         │
//! └──────────────────────┴──────────────────────┴───────────────────┘
//! ```
//!
//! There is no wire protocol: the raw image crosses the stream in one
//! direction per session, and both sides know its length from the chip.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob;
pub mod channel;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod session;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use blob::{DeviceKind, StorageBlob};
pub use channel::{Channel, ChannelError, ChannelStats, TcpChannel};
pub use config::Endpoint;
pub use device::{BlockDevice, DeviceProbe, ImageDevice};
pub use engine::{
    CancelToken, Direction, EngineConfig, MAX_CHUNK, Pacing, TransferEngine, TransferReport,
};
pub use error::{
    ConfigError, ConnectError, DeviceError, Error, ErrorKind, Result, TransferError,
    TransferFailure,
};
pub use resolver::{EndpointResolver, TcpResolver};
pub use session::{SessionController, SessionReport, SessionState, TransferSession};
