//! In-memory test doubles for channels, resolvers and devices.
//!
//! Enabled for unit tests and through the `mock` feature for the integration
//! tests and benchmarks.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::blob::StorageBlob;
use crate::channel::{Channel, ChannelError, ChannelResult, ChannelStats};
use crate::config::Endpoint;
use crate::device::{BlockDevice, DeviceProbe};
use crate::error::{ConnectError, DeviceError};
use crate::resolver::EndpointResolver;

/// Deterministic non-trivial byte pattern of `len` bytes
#[must_use]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
        .collect()
}

/// Behaviour of one scripted channel call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Move everything requested
    Full,
    /// Move at most this many bytes
    Accept(usize),
    /// Report zero bytes (peer closed)
    Closed,
    /// Fail with an I/O error of this kind
    Fail(io::ErrorKind),
    /// Claim this many bytes regardless of the request
    Overreport(usize),
    /// Never complete, like a peer that stopped talking
    Stall,
}

/// What a scripted channel observed
#[derive(Debug, Default)]
pub struct ChannelLog {
    /// Requested length of every call, in order
    pub requests: Vec<usize>,
    /// Bytes accepted by `send`
    pub sent: Vec<u8>,
    /// Whether `close` was called
    pub closed: bool,
}

/// Channel that follows a script of per-call behaviours
///
/// Once the script runs out every call behaves as `Step::Full`. `recv` hands
/// out bytes from the configured source and reports zero when it is
/// exhausted.
pub struct ScriptedChannel {
    script: VecDeque<Step>,
    source: Vec<u8>,
    source_pos: usize,
    log: Arc<Mutex<ChannelLog>>,
    stats: ChannelStats,
}

impl Default for ScriptedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedChannel {
    /// Channel that always moves the full request
    #[must_use]
    pub fn new() -> Self {
        Self::with_script([])
    }

    /// Channel following `steps`, then `Step::Full`
    #[must_use]
    pub fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: steps.into_iter().collect(),
            source: Vec::new(),
            source_pos: 0,
            log: Arc::new(Mutex::new(ChannelLog::default())),
            stats: ChannelStats::new(),
        }
    }

    /// Bytes handed out by `recv`
    #[must_use]
    pub fn with_source(mut self, source: Vec<u8>) -> Self {
        self.source = source;
        self.source_pos = 0;
        self
    }

    /// Shared handle to the call log
    #[must_use]
    pub fn log(&self) -> Arc<Mutex<ChannelLog>> {
        Arc::clone(&self.log)
    }

    fn next_step(&mut self, requested: usize) -> Step {
        let step = self.script.pop_front().unwrap_or(Step::Full);
        if let Ok(mut log) = self.log.lock() {
            log.requests.push(requested);
        }
        step
    }
}

async fn allowance(step: Step, requested: usize) -> ChannelResult<usize> {
    match step {
        Step::Stall => std::future::pending().await,
        Step::Full => Ok(requested),
        Step::Accept(n) => Ok(n.min(requested)),
        Step::Closed => Ok(0),
        Step::Fail(kind) => Err(ChannelError::Io(io::Error::new(kind, "scripted failure"))),
        Step::Overreport(n) => Ok(n),
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn send(&mut self, buf: &[u8]) -> ChannelResult<usize> {
        let step = self.next_step(buf.len());
        let count = allowance(step, buf.len()).await?;

        if let Ok(mut log) = self.log.lock() {
            log.sent.extend_from_slice(&buf[..count.min(buf.len())]);
        }
        self.stats.record_send(buf.len(), count);
        Ok(count)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> ChannelResult<usize> {
        let step = self.next_step(buf.len());
        let count = allowance(step, buf.len()).await?;

        if matches!(step, Step::Overreport(_)) {
            return Ok(count);
        }

        let available = self.source.len() - self.source_pos;
        let count = count.min(available);
        buf[..count].copy_from_slice(&self.source[self.source_pos..self.source_pos + count]);
        self.source_pos += count;
        self.stats.record_recv(buf.len(), count);
        Ok(count)
    }

    async fn close(&mut self) -> ChannelResult<()> {
        if let Ok(mut log) = self.log.lock() {
            log.closed = true;
        }
        Ok(())
    }

    fn stats(&self) -> ChannelStats {
        self.stats.clone()
    }
}

/// Echoing endpoint shared by every channel cloned from it
///
/// Bytes sent on any connection are queued and handed back, in order, by
/// `recv` on any later (or the same) connection.
#[derive(Clone, Default)]
pub struct Loopback {
    queue: Arc<Mutex<VecDeque<u8>>>,
    max_per_call: Option<usize>,
}

impl Loopback {
    /// Empty echo buffer with unlimited call sizes
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap every call at `limit` bytes to force short counts
    #[must_use]
    pub fn with_max_per_call(mut self, limit: usize) -> Self {
        self.max_per_call = Some(limit.max(1));
        self
    }

    /// Open a new connection to the echo buffer
    #[must_use]
    pub fn channel(&self) -> LoopbackChannel {
        LoopbackChannel {
            loopback: self.clone(),
            closed: false,
            stats: ChannelStats::new(),
        }
    }

    /// Bytes currently queued
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn limit(&self, requested: usize) -> usize {
        self.max_per_call.map_or(requested, |m| m.min(requested))
    }
}

/// One connection to a [`Loopback`]
pub struct LoopbackChannel {
    loopback: Loopback,
    closed: bool,
    stats: ChannelStats,
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn send(&mut self, buf: &[u8]) -> ChannelResult<usize> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let count = self.loopback.limit(buf.len());
        let mut queue = self
            .loopback
            .queue
            .lock()
            .map_err(|_| ChannelError::Io(io::Error::other("loopback poisoned")))?;
        queue.extend(&buf[..count]);
        self.stats.record_send(buf.len(), count);
        Ok(count)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> ChannelResult<usize> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let limit = self.loopback.limit(buf.len());
        let mut queue = self
            .loopback
            .queue
            .lock()
            .map_err(|_| ChannelError::Io(io::Error::other("loopback poisoned")))?;
        let count = limit.min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..count)) {
            *slot = byte;
        }
        self.stats.record_recv(buf.len(), count);
        Ok(count)
    }

    async fn close(&mut self) -> ChannelResult<()> {
        self.closed = true;
        Ok(())
    }

    fn stats(&self) -> ChannelStats {
        self.stats.clone()
    }
}

/// Resolver handing out pre-built channels
///
/// Each `connect` pops the next queued channel; an empty queue makes the
/// connect fail.
#[derive(Default)]
pub struct MockResolver {
    channels: Mutex<VecDeque<Box<dyn Channel>>>,
    loopback: Option<Loopback>,
    connects: AtomicUsize,
}

impl MockResolver {
    /// Resolver that refuses every connection
    #[must_use]
    pub fn refusing() -> Self {
        Self::default()
    }

    /// Resolver that connects every session to `loopback`
    #[must_use]
    pub fn loopback(loopback: Loopback) -> Self {
        Self {
            loopback: Some(loopback),
            ..Self::default()
        }
    }

    /// Resolver that hands out `channels` in order
    #[must_use]
    pub fn with_channels(channels: impl IntoIterator<Item = Box<dyn Channel>>) -> Self {
        Self {
            channels: Mutex::new(channels.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Number of connect attempts
    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EndpointResolver for MockResolver {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>, ConnectError> {
        self.connects.fetch_add(1, Ordering::Relaxed);

        if let Some(loopback) = &self.loopback {
            return Ok(Box::new(loopback.channel()));
        }

        self.channels
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .ok_or_else(|| ConnectError::NoAddress {
                host: endpoint.host().to_string(),
            })
    }
}

/// Save chip held in memory
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    /// Raw type code returned by `detect`
    pub raw_kind: i32,
    /// Chip contents
    pub data: Vec<u8>,
    /// Fail the write phase after erasing
    pub fail_write: bool,
    /// Number of `read_all` calls
    pub reads: usize,
    /// Number of `erase_and_write` calls
    pub commits: usize,
}

impl MemoryDevice {
    /// Chip of `size` bytes filled with `fill`
    #[must_use]
    pub fn new(raw_kind: i32, size: usize, fill: u8) -> Self {
        Self::with_data(raw_kind, vec![fill; size])
    }

    /// Chip holding `data`
    #[must_use]
    pub fn with_data(raw_kind: i32, data: Vec<u8>) -> Self {
        Self {
            raw_kind,
            data,
            fail_write: false,
            reads: 0,
            commits: 0,
        }
    }
}

#[async_trait]
impl BlockDevice for MemoryDevice {
    async fn detect(&mut self) -> Result<DeviceProbe, DeviceError> {
        let size = u32::try_from(self.data.len()).map_err(|_| DeviceError::SizeMismatch {
            expected: u32::MAX as usize,
            actual: self.data.len(),
        })?;
        Ok(DeviceProbe {
            raw_kind: self.raw_kind,
            size,
        })
    }

    async fn read_all(&mut self, size: u32) -> Result<Vec<u8>, DeviceError> {
        self.reads += 1;
        let size = size as usize;
        if size > self.data.len() {
            return Err(DeviceError::ShortRead {
                expected: size,
                actual: self.data.len(),
            });
        }
        Ok(self.data[..size].to_vec())
    }

    async fn erase_and_write(&mut self, blob: &StorageBlob) -> Result<(), DeviceError> {
        self.commits += 1;
        if blob.len() != self.data.len() {
            return Err(DeviceError::SizeMismatch {
                expected: self.data.len(),
                actual: blob.len(),
            });
        }

        self.data.fill(0xFF);
        if self.fail_write {
            return Err(DeviceError::Write("simulated write fault".to_string()));
        }
        self.data.copy_from_slice(blob.as_bytes());
        Ok(())
    }
}
