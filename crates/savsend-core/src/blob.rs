//! Fixed-size save memory image.

use std::fmt;

use crate::error::DeviceError;

/// Save chip type code reported by the device probe
///
/// Negative probe results are rejected by [`DeviceKind::from_raw`]; any
/// non-negative code is carried through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKind(u8);

impl DeviceKind {
    /// 512-byte EEPROM
    pub const EEPROM_TINY: Self = Self(1);
    /// 8 KiB to 64 KiB EEPROM
    pub const EEPROM: Self = Self(2);
    /// FLASH (256 KiB and up)
    pub const FLASH: Self = Self(3);

    /// Validate a raw probe result
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidKind`] for negative or out-of-range codes.
    pub fn from_raw(raw: i32) -> Result<Self, DeviceError> {
        u8::try_from(raw)
            .map(Self)
            .map_err(|_| DeviceError::InvalidKind(raw))
    }

    /// Raw type code
    #[must_use]
    pub const fn code(self) -> u8 {
        self.0
    }

    /// Short human-readable name
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("EEPROM 512B"),
            2 => Some("EEPROM"),
            3 => Some("FLASH"),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (type {})", self.0),
            None => write!(f, "type {}", self.0),
        }
    }
}

/// The full byte image of a save chip
///
/// The buffer is allocated once with exactly `size` bytes and never resized.
/// Range accessors panic when asked for bytes past the end; that is a caller
/// bug, not a recoverable condition.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageBlob {
    kind: DeviceKind,
    bytes: Box<[u8]>,
}

impl StorageBlob {
    /// Allocate a zero-filled blob
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::EmptyDevice`] if `size` is zero.
    pub fn zeroed(kind: DeviceKind, size: u32) -> Result<Self, DeviceError> {
        if size == 0 {
            return Err(DeviceError::EmptyDevice);
        }

        Ok(Self {
            kind,
            bytes: vec![0u8; size as usize].into_boxed_slice(),
        })
    }

    /// Wrap bytes read from a device
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::EmptyDevice`] if `bytes` is empty.
    pub fn from_bytes(kind: DeviceKind, bytes: Vec<u8>) -> Result<Self, DeviceError> {
        if bytes.is_empty() {
            return Err(DeviceError::EmptyDevice);
        }
        // u32 sizes only
        if u32::try_from(bytes.len()).is_err() {
            return Err(DeviceError::SizeMismatch {
                expected: u32::MAX as usize,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            kind,
            bytes: bytes.into_boxed_slice(),
        })
    }

    /// Device type this image belongs to
    #[must_use]
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Image size in bytes
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Image size as `usize`
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a blob holds at least one byte
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes in `[offset, offset + len)`
    ///
    /// # Panics
    ///
    /// Panics if `offset + len` exceeds the blob size.
    #[must_use]
    pub fn range(&self, offset: usize, len: usize) -> &[u8] {
        let end = self.checked_end(offset, len);
        &self.bytes[offset..end]
    }

    /// Mutable bytes in `[offset, offset + len)`
    ///
    /// # Panics
    ///
    /// Panics if `offset + len` exceeds the blob size.
    pub fn range_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        let end = self.checked_end(offset, len);
        &mut self.bytes[offset..end]
    }

    /// The whole image
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the blob and return its buffer
    #[must_use]
    pub fn into_bytes(self) -> Box<[u8]> {
        self.bytes
    }

    fn checked_end(&self, offset: usize, len: usize) -> usize {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => end,
            _ => panic!(
                "blob range {offset}+{len} out of bounds for {}-byte image",
                self.bytes.len()
            ),
        }
    }
}

impl fmt::Debug for StorageBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageBlob")
            .field("kind", &self.kind)
            .field("size", &self.bytes.len())
            .finish_non_exhaustive()
    }
}
