//! Save chip (block device) access.
//!
//! [`BlockDevice`] is the capability the session controller needs from the
//! storage chip: probe its type and size, read the whole image, and erase then
//! rewrite it. [`ImageDevice`] implements it on top of a save image file so
//! the tool can be used against dumps on a host machine.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::blob::{DeviceKind, StorageBlob};
use crate::error::DeviceError;

/// Value of an erased cell
pub const ERASED_BYTE: u8 = 0xFF;

/// Raw result of a chip probe
///
/// The session controller validates it: a negative `raw_kind` or a zero
/// `size` aborts the session before anything else happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProbe {
    /// Type code as reported by the chip (negative when unknown)
    pub raw_kind: i32,
    /// Storage size in bytes
    pub size: u32,
}

/// Storage chip primitives
#[async_trait]
pub trait BlockDevice: Send {
    /// Probe the chip type and size.
    ///
    /// # Errors
    /// Returns `DeviceError` if the chip cannot be probed
    async fn detect(&mut self) -> Result<DeviceProbe, DeviceError>;

    /// Read exactly `size` bytes starting at address 0.
    ///
    /// # Errors
    /// Returns `DeviceError` if fewer than `size` bytes could be read
    async fn read_all(&mut self, size: u32) -> Result<Vec<u8>, DeviceError>;

    /// Erase the whole chip and write `blob` from address 0.
    ///
    /// Not retried. On `DeviceError::Write` the chip contents are undefined.
    ///
    /// # Errors
    /// Returns `DeviceError` if the image does not fit or the write fails
    async fn erase_and_write(&mut self, blob: &StorageBlob) -> Result<(), DeviceError>;
}

/// Save image file acting as the chip
///
/// The chip size is the file length; the type code is configured.
#[derive(Debug, Clone)]
pub struct ImageDevice {
    path: PathBuf,
    kind: DeviceKind,
}

impl ImageDevice {
    /// Use the image at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: DeviceKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// Create a blank (erased) image of `size` bytes
    ///
    /// # Errors
    /// Returns `DeviceError` if the file cannot be written or `size` is zero
    pub async fn create(
        path: impl Into<PathBuf>,
        kind: DeviceKind,
        size: u32,
    ) -> Result<Self, DeviceError> {
        if size == 0 {
            return Err(DeviceError::EmptyDevice);
        }
        let path = path.into();
        fs::write(&path, vec![ERASED_BYTE; size as usize]).await?;
        Ok(Self { path, kind })
    }

    /// Image file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured type code
    #[must_use]
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
}

#[async_trait]
impl BlockDevice for ImageDevice {
    async fn detect(&mut self) -> Result<DeviceProbe, DeviceError> {
        let len = fs::metadata(&self.path).await?.len();
        let size = u32::try_from(len).map_err(|_| DeviceError::SizeMismatch {
            expected: u32::MAX as usize,
            actual: usize::try_from(len).unwrap_or(usize::MAX),
        })?;

        tracing::debug!("Probed {} ({} bytes)", self.path.display(), size);
        Ok(DeviceProbe {
            raw_kind: i32::from(self.kind.code()),
            size,
        })
    }

    async fn read_all(&mut self, size: u32) -> Result<Vec<u8>, DeviceError> {
        let size = size as usize;
        let mut file = fs::File::open(&self.path).await?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;

        // Reads may come back short; keep asking until the image is complete.
        while filled < size {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(DeviceError::ShortRead {
                    expected: size,
                    actual: filled,
                });
            }
            filled += n;
        }

        tracing::debug!("Read {} bytes from {}", size, self.path.display());
        Ok(buf)
    }

    async fn erase_and_write(&mut self, blob: &StorageBlob) -> Result<(), DeviceError> {
        let size = self.detect().await?.size as usize;
        if blob.len() != size {
            return Err(DeviceError::SizeMismatch {
                expected: size,
                actual: blob.len(),
            });
        }

        let write = |e: std::io::Error| DeviceError::Write(e.to_string());

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(write)?;

        tracing::debug!("Erasing {}", self.path.display());
        file.write_all(&vec![ERASED_BYTE; size]).await.map_err(write)?;
        file.flush().await.map_err(write)?;

        file.seek(SeekFrom::Start(0)).await.map_err(write)?;
        file.write_all(blob.as_bytes()).await.map_err(write)?;
        file.sync_all().await.map_err(write)?;

        tracing::debug!("Wrote {} bytes to {}", size, self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::pattern;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_detect_reports_file_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("card.sav");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();

        let mut device = ImageDevice::new(&path, DeviceKind::EEPROM);
        let probe = device.detect().await.unwrap();
        assert_eq!(probe.raw_kind, 2);
        assert_eq!(probe.size, 8192);
    }

    #[tokio::test]
    async fn test_detect_missing_image() {
        let mut device = ImageDevice::new("/nonexistent/card.sav", DeviceKind::FLASH);
        assert!(matches!(device.detect().await, Err(DeviceError::Io(_))));
    }

    #[tokio::test]
    async fn test_read_all() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("card.sav");
        let data = pattern(512);
        std::fs::write(&path, &data).unwrap();

        let mut device = ImageDevice::new(&path, DeviceKind::EEPROM_TINY);
        assert_eq!(device.read_all(512).await.unwrap(), data);
        assert_eq!(device.read_all(100).await.unwrap(), &data[..100]);
    }

    #[tokio::test]
    async fn test_read_all_short_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("card.sav");
        std::fs::write(&path, vec![1u8; 100]).unwrap();

        let mut device = ImageDevice::new(&path, DeviceKind::EEPROM);
        assert!(matches!(
            device.read_all(200).await,
            Err(DeviceError::ShortRead {
                expected: 200,
                actual: 100
            })
        ));
    }

    #[tokio::test]
    async fn test_create_and_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blank.sav");

        let mut device = ImageDevice::create(&path, DeviceKind::EEPROM, 1024)
            .await
            .unwrap();
        assert!(std::fs::read(&path).unwrap().iter().all(|&b| b == ERASED_BYTE));

        let blob = StorageBlob::from_bytes(DeviceKind::EEPROM, pattern(1024)).unwrap();
        device.erase_and_write(&blob).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), pattern(1024));
    }

    #[tokio::test]
    async fn test_write_size_mismatch_leaves_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("card.sav");
        std::fs::write(&path, vec![7u8; 512]).unwrap();

        let mut device = ImageDevice::new(&path, DeviceKind::EEPROM);
        let blob = StorageBlob::zeroed(DeviceKind::EEPROM, 256).unwrap();

        let err = device.erase_and_write(&blob).await.unwrap_err();
        assert!(!err.touched_device());
        assert_eq!(std::fs::read(&path).unwrap(), vec![7u8; 512]);
    }

    #[tokio::test]
    async fn test_create_zero_size_rejected() {
        let dir = tempdir().unwrap();
        let result = ImageDevice::create(dir.path().join("x.sav"), DeviceKind::EEPROM, 0).await;
        assert!(matches!(result, Err(DeviceError::EmptyDevice)));
    }
}
