//! Dump/restore session state machine.
//!
//! One user action (dump or restore) runs exactly one session:
//!
//! ```text
//! Idle -> DeviceDetected -> EndpointConnected -> Transferring -> Committing -> Idle
//!                                                    |  (dump)                  ^
//!                                                    +--------------------------+
//! ```
//!
//! Any failure returns the controller to `Idle`. A restore only reaches
//! `Committing` after the engine moved every byte, so a failed or truncated
//! transfer never touches the chip.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::blob::{DeviceKind, StorageBlob};
use crate::channel::{Channel, ChannelStats};
use crate::config::Endpoint;
use crate::device::BlockDevice;
use crate::engine::{Direction, TransferEngine, TransferReport};
use crate::error::{DeviceError, Error, ErrorKind, Result, TransferError};
use crate::resolver::EndpointResolver;

/// Session controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ready for a new session
    Idle,
    /// Chip type and size known
    DeviceDetected,
    /// Channel to the endpoint open
    EndpointConnected,
    /// Engine running
    Transferring,
    /// Writing a received image to the chip
    Committing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::DeviceDetected => "device detected",
            SessionState::EndpointConnected => "endpoint connected",
            SessionState::Transferring => "transferring",
            SessionState::Committing => "committing",
        };
        f.write_str(name)
    }
}

/// One transfer over one channel
///
/// Owns the blob and the channel for the duration of a single direction.
/// `bytes_moved` never exceeds the blob size and equals it only after a
/// completed transfer.
pub struct TransferSession {
    direction: Direction,
    blob: StorageBlob,
    channel: Box<dyn Channel>,
    bytes_moved: u32,
    last_error: Option<ErrorKind>,
}

impl TransferSession {
    /// Create a session over a connected channel
    #[must_use]
    pub fn new(direction: Direction, blob: StorageBlob, channel: Box<dyn Channel>) -> Self {
        Self {
            direction,
            blob,
            channel,
            bytes_moved: 0,
            last_error: None,
        }
    }

    /// Transfer direction
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The blob being moved
    #[must_use]
    pub fn blob(&self) -> &StorageBlob {
        &self.blob
    }

    /// Bytes moved so far
    #[must_use]
    pub fn bytes_moved(&self) -> u32 {
        self.bytes_moved
    }

    /// Kind of the last failure, if any
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Returns true once every byte was moved
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bytes_moved == self.blob.size()
    }

    /// Run the engine over this session's blob and channel.
    ///
    /// # Errors
    /// Returns the engine's [`TransferError`]; `bytes_moved` then holds the
    /// bytes moved before the failing call.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn run<F>(
        &mut self,
        engine: &TransferEngine,
        progress: F,
    ) -> std::result::Result<TransferReport, TransferError>
    where
        F: FnMut(usize),
    {
        let result = engine
            .transfer(self.direction, &mut self.blob, &mut self.channel, progress)
            .await;

        // Blob sizes fit in u32, so do offsets into them.
        match &result {
            Ok(report) => self.bytes_moved = report.bytes as u32,
            Err(e) => {
                self.bytes_moved = e.offset as u32;
                self.last_error = Some(if e.is_cancelled() {
                    ErrorKind::Cancelled
                } else {
                    ErrorKind::Transfer
                });
            }
        }

        result
    }

    /// Close the channel and hand back the blob
    pub async fn close(mut self) -> (StorageBlob, ChannelStats) {
        if let Err(e) = self.channel.close().await {
            tracing::debug!("Channel close failed: {}", e);
        }
        let stats = self.channel.stats();
        (self.blob, stats)
    }
}

/// Outcome of a successful session
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Dump (`Send`) or restore (`Receive`)
    pub direction: Direction,
    /// Detected chip type
    pub kind: DeviceKind,
    /// Chip size in bytes
    pub size: u32,
    /// Engine summary: calls, bytes and time spent moving them
    pub transfer: TransferReport,
    /// Channel counters at close
    pub stats: ChannelStats,
    /// Time for the whole session
    pub elapsed: Duration,
}

/// Drives dump and restore sessions
///
/// Sessions never overlap: every run borrows the controller mutably and
/// returns it to [`SessionState::Idle`] before completing.
pub struct SessionController<D, R> {
    device: D,
    resolver: R,
    endpoint: Arc<Endpoint>,
    engine: TransferEngine,
    state: SessionState,
    path: Vec<SessionState>,
    last_error: Option<ErrorKind>,
}

impl<D, R> SessionController<D, R>
where
    D: BlockDevice,
    R: EndpointResolver,
{
    /// Create an idle controller
    #[must_use]
    pub fn new(device: D, resolver: R, endpoint: Arc<Endpoint>, engine: TransferEngine) -> Self {
        Self {
            device,
            resolver,
            endpoint,
            engine,
            state: SessionState::Idle,
            path: vec![SessionState::Idle],
            last_error: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// States visited by the most recent session, starting and ending at `Idle`
    #[must_use]
    pub fn last_path(&self) -> &[SessionState] {
        &self.path
    }

    /// Kind of the most recent session failure
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Shared endpoint
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The block device
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The resolver
    #[must_use]
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Send the chip image to the endpoint
    ///
    /// `progress` receives `(bytes_moved, total)` after every chunk.
    ///
    /// # Errors
    /// Returns the session error; the chip is never modified by a dump
    pub async fn dump<F>(&mut self, progress: F) -> Result<SessionReport>
    where
        F: FnMut(usize, usize),
    {
        self.run(Direction::Send, progress).await
    }

    /// Receive an image from the endpoint and write it to the chip
    ///
    /// `progress` receives `(bytes_moved, total)` after every chunk.
    ///
    /// # Errors
    /// Returns the session error; only [`Error::Commit`] can leave the chip
    /// modified
    pub async fn restore<F>(&mut self, progress: F) -> Result<SessionReport>
    where
        F: FnMut(usize, usize),
    {
        self.run(Direction::Receive, progress).await
    }

    /// Run one session in `direction`
    ///
    /// # Errors
    /// Returns the session error after the controller is back in `Idle`
    pub async fn run<F>(&mut self, direction: Direction, progress: F) -> Result<SessionReport>
    where
        F: FnMut(usize, usize),
    {
        self.path.clear();
        self.path.push(SessionState::Idle);
        self.last_error = None;

        let result = self.run_session(direction, progress).await;

        if let Err(e) = &result {
            self.last_error = Some(e.kind());
            tracing::warn!(%direction, "Session aborted in state {}: {}", self.state, e);
        }
        self.transition(SessionState::Idle);

        result
    }

    async fn run_session<F>(
        &mut self,
        direction: Direction,
        mut progress: F,
    ) -> Result<SessionReport>
    where
        F: FnMut(usize, usize),
    {
        let started = Instant::now();

        let probe = self.device.detect().await?;
        let kind = DeviceKind::from_raw(probe.raw_kind)?;
        if probe.size == 0 {
            return Err(DeviceError::EmptyDevice.into());
        }
        tracing::info!("Detected {} of {} bytes", kind, probe.size);
        self.transition(SessionState::DeviceDetected);

        let channel = self.resolver.connect(&self.endpoint).await?;
        self.transition(SessionState::EndpointConnected);

        let blob = match self.allocate(direction, kind, probe.size).await {
            Ok(blob) => blob,
            Err(e) => {
                let mut channel = channel;
                if let Err(close_err) = channel.close().await {
                    tracing::debug!("Channel close failed: {}", close_err);
                }
                return Err(e);
            }
        };

        let size = blob.len();
        let mut session = TransferSession::new(direction, blob, channel);
        self.transition(SessionState::Transferring);

        let outcome = session
            .run(&self.engine, |offset| progress(offset, size))
            .await;
        debug_assert!(outcome.is_err() || session.is_complete());
        let (blob, stats) = session.close().await;
        let transfer = outcome?;

        if direction == Direction::Receive {
            self.transition(SessionState::Committing);
            tracing::info!("Writing {} bytes to the save chip", blob.len());
            self.device
                .erase_and_write(&blob)
                .await
                .map_err(Error::Commit)?;
        }

        Ok(SessionReport {
            direction,
            kind,
            size: blob.size(),
            transfer,
            stats,
            elapsed: started.elapsed(),
        })
    }

    async fn allocate(
        &mut self,
        direction: Direction,
        kind: DeviceKind,
        size: u32,
    ) -> Result<StorageBlob> {
        let blob = match direction {
            Direction::Send => {
                tracing::info!("Reading {} bytes from the save chip", size);
                let bytes = self.device.read_all(size).await?;
                if bytes.len() != size as usize {
                    return Err(DeviceError::ShortRead {
                        expected: size as usize,
                        actual: bytes.len(),
                    }
                    .into());
                }
                StorageBlob::from_bytes(kind, bytes)?
            }
            Direction::Receive => StorageBlob::zeroed(kind, size)?,
        };
        Ok(blob)
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("Session {} -> {}", self.state, next);
        self.state = next;
        self.path.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Loopback, MemoryDevice, MockResolver, ScriptedChannel, Step, pattern};
    use std::io;

    use super::SessionState::{Committing, DeviceDetected, EndpointConnected, Idle, Transferring};

    fn endpoint() -> Arc<Endpoint> {
        Arc::new(Endpoint::new("saves.example.com", 4000).unwrap())
    }

    fn controller(
        device: MemoryDevice,
        resolver: MockResolver,
    ) -> SessionController<MemoryDevice, MockResolver> {
        SessionController::new(device, resolver, endpoint(), TransferEngine::default())
    }

    #[tokio::test]
    async fn test_dump_sends_chip_image() {
        let device = MemoryDevice::with_data(2, pattern(8192));
        let channel = ScriptedChannel::new();
        let log = channel.log();
        let resolver = MockResolver::with_channels([Box::new(channel) as Box<dyn Channel>]);
        let mut ctl = controller(device, resolver);

        let mut last = (0, 0);
        let report = ctl.dump(|moved, total| last = (moved, total)).await.unwrap();

        assert_eq!(report.direction, Direction::Send);
        assert_eq!(report.kind, DeviceKind::EEPROM);
        assert_eq!(report.size, 8192);
        assert_eq!(report.transfer.calls, 32);
        assert_eq!(report.transfer.bytes, 8192);
        assert_eq!(last, (8192, 8192));

        let log = log.lock().unwrap();
        assert_eq!(log.sent, pattern(8192));
        assert!(log.closed);

        assert_eq!(ctl.state(), Idle);
        assert_eq!(
            ctl.last_path(),
            &[Idle, DeviceDetected, EndpointConnected, Transferring, Idle]
        );
        assert_eq!(ctl.device().reads, 1);
        assert_eq!(ctl.device().commits, 0);
    }

    #[tokio::test]
    async fn test_restore_commits_received_image() {
        let device = MemoryDevice::new(2, 1024, 0x00);
        let channel = ScriptedChannel::with_script([Step::Accept(3), Step::Accept(100)])
            .with_source(pattern(1024));
        let resolver = MockResolver::with_channels([Box::new(channel) as Box<dyn Channel>]);
        let mut ctl = controller(device, resolver);

        let report = ctl.restore(|_, _| {}).await.unwrap();

        assert_eq!(report.direction, Direction::Receive);
        assert_eq!(ctl.device().data, pattern(1024));
        assert_eq!(ctl.device().commits, 1);
        assert_eq!(
            ctl.last_path(),
            &[
                Idle,
                DeviceDetected,
                EndpointConnected,
                Transferring,
                Committing,
                Idle
            ]
        );
    }

    #[tokio::test]
    async fn test_truncated_restore_never_commits() {
        let device = MemoryDevice::new(2, 1024, 0x5A);
        // Server only has half an image
        let channel = ScriptedChannel::new().with_source(pattern(512));
        let resolver = MockResolver::with_channels([Box::new(channel) as Box<dyn Channel>]);
        let mut ctl = controller(device, resolver);

        let err = ctl.restore(|_, _| {}).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(!err.device_state_undefined());
        match &err {
            Error::Transfer(e) => assert_eq!(e.offset, 512),
            other => panic!("unexpected error {other:?}"),
        }

        assert_eq!(ctl.device().commits, 0);
        assert_eq!(ctl.device().data, vec![0x5A; 1024]);
        assert_eq!(ctl.state(), Idle);
        assert_eq!(ctl.last_error(), Some(ErrorKind::Transfer));
    }

    #[tokio::test]
    async fn test_restore_channel_error_never_commits() {
        let device = MemoryDevice::new(3, 512, 0x11);
        let steps = [Step::Full, Step::Fail(io::ErrorKind::TimedOut)];
        let channel = ScriptedChannel::with_script(steps).with_source(pattern(512));
        let resolver = MockResolver::with_channels([Box::new(channel) as Box<dyn Channel>]);
        let mut ctl = controller(device, resolver);

        let err = ctl.restore(|_, _| {}).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert_eq!(ctl.device().commits, 0);
        assert_eq!(ctl.device().data, vec![0x11; 512]);
    }

    #[tokio::test]
    async fn test_invalid_device_kind_aborts_before_connect() {
        let device = MemoryDevice::new(-1, 512, 0);
        let resolver = MockResolver::loopback(Loopback::new());
        let mut ctl = controller(device, resolver);

        let err = ctl.dump(|_, _| {}).await.unwrap_err();

        assert!(matches!(err, Error::Device(DeviceError::InvalidKind(-1))));
        assert_eq!(ctl.resolver().connects(), 0);
        assert_eq!(ctl.last_path(), &[Idle, Idle]);
    }

    #[tokio::test]
    async fn test_empty_device_aborts() {
        let device = MemoryDevice::new(2, 0, 0);
        let resolver = MockResolver::loopback(Loopback::new());
        let mut ctl = controller(device, resolver);

        let err = ctl.restore(|_, _| {}).await.unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::EmptyDevice)));
        assert_eq!(ctl.resolver().connects(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_device_untouched() {
        let device = MemoryDevice::new(2, 512, 0x42);
        let mut ctl = controller(device, MockResolver::refusing());

        let err = ctl.restore(|_, _| {}).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Connect);
        assert_eq!(ctl.device().commits, 0);
        assert_eq!(ctl.device().reads, 0);
        assert_eq!(ctl.last_path(), &[Idle, DeviceDetected, Idle]);
    }

    #[tokio::test]
    async fn test_commit_failure_is_reported_as_undefined() {
        let mut device = MemoryDevice::new(2, 256, 0x00);
        device.fail_write = true;
        let channel = ScriptedChannel::new().with_source(pattern(256));
        let resolver = MockResolver::with_channels([Box::new(channel) as Box<dyn Channel>]);
        let mut ctl = controller(device, resolver);

        let err = ctl.restore(|_, _| {}).await.unwrap_err();

        assert!(matches!(err, Error::Commit(_)));
        assert!(err.device_state_undefined());
        assert!(err.status_message().starts_with("WRITE FAILED"));
        // Erased, not written, and not retried
        assert_eq!(ctl.device().commits, 1);
        assert_eq!(ctl.device().data, vec![0xFF; 256]);
        assert_eq!(ctl.state(), Idle);
    }

    #[tokio::test]
    async fn test_dump_then_restore_round_trip() {
        let loopback = Loopback::new().with_max_per_call(100);
        let source = MemoryDevice::with_data(1, pattern(512));
        let mut dumper = controller(source, MockResolver::loopback(loopback.clone()));
        dumper.dump(|_, _| {}).await.unwrap();
        assert_eq!(loopback.queued(), 512);

        let target = MemoryDevice::new(1, 512, 0x00);
        let mut restorer = controller(target, MockResolver::loopback(loopback.clone()));
        restorer.restore(|_, _| {}).await.unwrap();

        assert_eq!(restorer.device().data, pattern(512));
        assert_eq!(loopback.queued(), 0);
    }

    #[tokio::test]
    async fn test_sessions_run_back_to_back() {
        let loopback = Loopback::new();
        let device = MemoryDevice::with_data(2, pattern(300));
        let mut ctl = controller(device, MockResolver::loopback(loopback.clone()));

        ctl.dump(|_, _| {}).await.unwrap();
        assert_eq!(ctl.state(), Idle);

        ctl.device.data.fill(0);
        ctl.restore(|_, _| {}).await.unwrap();
        assert_eq!(ctl.device().data, pattern(300));
        assert_eq!(ctl.resolver().connects(), 2);
        assert_eq!(ctl.last_error(), None);
    }

    #[tokio::test]
    async fn test_transfer_session_tracks_bytes() {
        let blob = StorageBlob::from_bytes(DeviceKind::EEPROM, pattern(600)).unwrap();
        let channel = ScriptedChannel::with_script([Step::Full, Step::Accept(44), Step::Closed]);
        let mut session = TransferSession::new(Direction::Send, blob, Box::new(channel));

        let err = session
            .run(&TransferEngine::default(), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.offset, 300);
        assert_eq!(session.bytes_moved(), 300);
        assert!(!session.is_complete());
        assert_eq!(session.last_error(), Some(ErrorKind::Transfer));

        let (blob, stats) = session.close().await;
        assert_eq!(blob.len(), 600);
        assert_eq!(stats.bytes_sent, 300);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::EndpointConnected.to_string(), "endpoint connected");
        assert_eq!(SessionState::Idle.to_string(), "idle");
    }
}
