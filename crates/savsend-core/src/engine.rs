//! Chunked, short-I/O tolerant transfer engine.
//!
//! The engine moves a [`StorageBlob`] across a connected [`Channel`] in
//! strictly increasing offset order, one bounded chunk per call:
//!
//! ```text
//! offset = 0
//! while offset < size:
//!     chunk  = min(size - offset, max_chunk)
//!     count  = send/recv(blob[offset .. offset + chunk])
//!     count == 0, error, timeout or cancel  -> Failed(offset)
//!     offset += count       (short counts are fine)
//!     progress(offset)
//!     pause()               (yield / wait for next tick)
//! Completed
//! ```
//!
//! The pause after every call is mandatory. It keeps other tasks on the same
//! cooperative runtime (link keep-alive, housekeeping) running during a
//! transfer that can take several seconds.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

use crate::blob::StorageBlob;
use crate::channel::Channel;
use crate::error::{ConfigError, TransferError, TransferFailure};

/// Default upper bound on bytes per send/recv call
pub const MAX_CHUNK: usize = 256;

/// Largest accepted `max_chunk` setting (64 KiB)
pub const MAX_CHUNK_LIMIT: usize = 64 * 1024;

/// Default interval for progress markers in the log
pub const PROGRESS_MARKER: usize = 1024;

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Blob to channel (dump)
    Send,
    /// Channel to blob (restore)
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// How the engine gives up the CPU between chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Yield to the runtime once per chunk
    Yield,
    /// Wait for the next tick of a periodic timer once per chunk
    Tick(Duration),
}

/// Transfer engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on bytes per call
    pub max_chunk: usize,
    /// Pause strategy between calls
    pub pacing: Pacing,
    /// Log a progress marker every this many bytes
    pub progress_marker: usize,
    /// Fail a single send/recv call that makes no progress for this long
    pub io_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk: MAX_CHUNK,
            pacing: Pacing::Yield,
            progress_marker: PROGRESS_MARKER,
            io_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk bound, tick period or marker interval is
    /// out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk == 0 || self.max_chunk > MAX_CHUNK_LIMIT {
            return Err(ConfigError::Invalid(
                format!("max_chunk must be between 1 and {MAX_CHUNK_LIMIT}").into(),
            ));
        }

        if let Pacing::Tick(period) = self.pacing {
            if period.is_zero() {
                return Err(ConfigError::Invalid("tick period must be non-zero".into()));
            }
        }

        if self.progress_marker == 0 {
            return Err(ConfigError::Invalid(
                "progress_marker must be non-zero".into(),
            ));
        }

        if self.io_timeout.is_some_and(|limit| limit.is_zero()) {
            return Err(ConfigError::Invalid("io_timeout must be non-zero".into()));
        }

        Ok(())
    }
}

/// Cancellation flag shared between the engine and whoever stops it
///
/// Checked before every call, and raced against calls that are already
/// waiting on the channel.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<watch::Sender<bool>>);

impl Default for CancelToken {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }
}

impl CancelToken {
    /// Create an unset token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Returns true once cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Clear a previous request so the token can guard the next session
    pub fn reset(&self) {
        self.0.send_replace(false);
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so this only returns once set.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

async fn cancelled(token: Option<&CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Summary of a completed transfer
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Direction of the transfer
    pub direction: Direction,
    /// Bytes moved (always the full blob size)
    pub bytes: usize,
    /// Number of send/recv calls issued
    pub calls: u32,
    /// Wall time spent in the loop
    pub elapsed: Duration,
}

impl TransferReport {
    /// Throughput in bytes per second
    #[must_use]
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

enum Pacer {
    Yield,
    Tick(Interval),
}

impl Pacer {
    fn new(pacing: Pacing) -> Self {
        match pacing {
            Pacing::Tick(period) if !period.is_zero() => {
                // First tick one period out, so the first pause really waits.
                let start = tokio::time::Instant::now() + period;
                let mut interval = tokio::time::interval_at(start, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Pacer::Tick(interval)
            }
            _ => Pacer::Yield,
        }
    }

    async fn pause(&mut self) {
        match self {
            Pacer::Yield => tokio::task::yield_now().await,
            Pacer::Tick(interval) => {
                interval.tick().await;
            }
        }
    }
}

/// Chunked transfer engine
#[derive(Debug, Clone, Default)]
pub struct TransferEngine {
    config: EngineConfig,
    cancel: Option<CancelToken>,
}

impl TransferEngine {
    /// Create an engine from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: None,
        })
    }

    /// Attach a cancel token
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Move the whole blob across `channel`.
    ///
    /// `Send` reads from `blob` and writes to the channel; `Receive` fills
    /// `blob` from the channel. The blob must already have exactly the size
    /// expected on the wire. `progress` is called with the running offset
    /// after every call that moved data.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] as soon as a call moves zero bytes, fails, or
    /// claims more bytes than requested, or when the cancel token is set. The
    /// error's `offset` counts only bytes moved before that call. Nothing is
    /// retried.
    pub async fn transfer<C, F>(
        &self,
        direction: Direction,
        blob: &mut StorageBlob,
        channel: &mut C,
        mut progress: F,
    ) -> Result<TransferReport, TransferError>
    where
        C: Channel + ?Sized,
        F: FnMut(usize),
    {
        let size = blob.len();
        let max_chunk = self.config.max_chunk.max(1);
        let marker = self.config.progress_marker.max(1);
        let started = Instant::now();

        let fail = |offset: usize, cause: TransferFailure| {
            tracing::warn!(%direction, offset, size, "Transfer failed: {}", cause);
            TransferError {
                direction,
                offset,
                size,
                cause,
            }
        };

        tracing::debug!(%direction, size, max_chunk, "Starting transfer");

        let mut pacer = Pacer::new(self.config.pacing);
        let mut offset = 0usize;
        let mut calls = 0u32;
        let mut next_marker = marker;

        while offset < size {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(fail(offset, TransferFailure::Cancelled));
            }

            let chunk = (size - offset).min(max_chunk);
            let io = async {
                let call = async {
                    match direction {
                        Direction::Send => channel.send(blob.range(offset, chunk)).await,
                        Direction::Receive => channel.recv(blob.range_mut(offset, chunk)).await,
                    }
                };
                let result = match self.config.io_timeout {
                    Some(limit) => tokio::time::timeout(limit, call)
                        .await
                        .map_err(|_| TransferFailure::Timeout(limit))?,
                    None => call.await,
                };
                result.map_err(TransferFailure::Channel)
            };

            let result = tokio::select! {
                biased;
                () = cancelled(self.cancel.as_ref()) => Err(TransferFailure::Cancelled),
                result = io => result,
            };
            calls += 1;

            let count = match result {
                Ok(0) => return Err(fail(offset, TransferFailure::Closed)),
                Ok(count) if count > chunk => {
                    return Err(fail(
                        offset,
                        TransferFailure::Overreport {
                            requested: chunk,
                            reported: count,
                        },
                    ));
                }
                Ok(count) => count,
                Err(cause) => return Err(fail(offset, cause)),
            };

            offset += count;
            tracing::trace!(offset, count, requested = chunk, "Chunk moved");

            if offset >= next_marker {
                tracing::debug!(%direction, "{} of {} bytes", offset, size);
                next_marker = (offset / marker + 1) * marker;
            }

            progress(offset);
            pacer.pause().await;
        }

        let report = TransferReport {
            direction,
            bytes: offset,
            calls,
            elapsed: started.elapsed(),
        };

        tracing::info!(
            %direction,
            bytes = report.bytes,
            calls = report.calls,
            "Transfer complete in {:?}",
            report.elapsed
        );

        Ok(report)
    }
}
