//! Configuration system for the savsend CLI.
//!
//! Two files are involved:
//! - the endpoint file (`savsender.conf`, two lines: host and port), parsed by
//!   [`savsend_core::Endpoint`]
//! - optional TOML settings for the transfer engine, the save image and
//!   logging, handled here

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use savsend_core::engine::{MAX_CHUNK, MAX_CHUNK_LIMIT, PROGRESS_MARKER};
use savsend_core::{DeviceKind, EngineConfig, Pacing};

/// savsend settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferSettings,
    /// Save image configuration
    #[serde(default)]
    pub device: DeviceSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Upper bound on bytes per send/recv call
    #[serde(default = "default_max_chunk")]
    pub max_chunk: usize,
    /// Wait this many milliseconds between chunks (0 = yield only)
    #[serde(default)]
    pub tick_ms: u64,
    /// Log a progress marker every this many bytes
    #[serde(default = "default_progress_marker")]
    pub progress_marker: usize,
    /// Connect timeout in seconds (0 = none)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Give up on a send/recv call that moves nothing for this many seconds
    /// (0 = wait until cancelled)
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
}

/// Save image configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Save image file standing in for the chip
    #[serde(default = "default_image_path")]
    pub image: PathBuf,
    /// Chip type code reported for the image
    #[serde(default = "default_kind")]
    pub kind: u8,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_max_chunk() -> usize {
    MAX_CHUNK
}

fn default_progress_marker() -> usize {
    PROGRESS_MARKER
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_io_timeout() -> u64 {
    30
}

fn default_image_path() -> PathBuf {
    PathBuf::from("card.sav")
}

fn default_kind() -> u8 {
    DeviceKind::EEPROM.code()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_chunk: default_max_chunk(),
            tick_ms: 0,
            progress_marker: default_progress_marker(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            image: default_image_path(),
            kind: default_kind(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&contents)?;
        Ok(settings)
    }

    /// Load settings from `path` if it exists, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No settings at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Default settings path
    #[must_use]
    pub fn default_path() -> PathBuf {
        config_dir().join("settings.toml")
    }

    /// Default endpoint file path
    #[must_use]
    pub fn default_endpoint_path() -> PathBuf {
        config_dir().join(savsend_core::config::ENDPOINT_FILE_NAME)
    }

    /// Engine configuration derived from these settings
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let pacing = if self.transfer.tick_ms == 0 {
            Pacing::Yield
        } else {
            Pacing::Tick(Duration::from_millis(self.transfer.tick_ms))
        };

        EngineConfig {
            max_chunk: self.transfer.max_chunk,
            pacing,
            progress_marker: self.transfer.progress_marker,
            io_timeout: self.io_timeout(),
        }
    }

    /// Connect timeout, if any
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.transfer.connect_timeout_secs > 0)
            .then(|| Duration::from_secs(self.transfer.connect_timeout_secs))
    }

    /// Per-call I/O timeout, if any
    #[must_use]
    pub fn io_timeout(&self) -> Option<Duration> {
        (self.transfer.io_timeout_secs > 0)
            .then(|| Duration::from_secs(self.transfer.io_timeout_secs))
    }

    /// Chip type code for the image
    #[must_use]
    pub fn device_kind(&self) -> DeviceKind {
        // Codes 0..=255 are all representable
        DeviceKind::from_raw(i32::from(self.device.kind)).unwrap_or(DeviceKind::EEPROM)
    }

    /// Validate settings
    ///
    /// # Errors
    ///
    /// Returns an error if settings are invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transfer.max_chunk == 0 || self.transfer.max_chunk > MAX_CHUNK_LIMIT {
            anyhow::bail!("max_chunk must be between 1 and {}", MAX_CHUNK_LIMIT);
        }

        if self.transfer.tick_ms > 1000 {
            anyhow::bail!("tick_ms must be at most 1000");
        }

        if self.transfer.progress_marker == 0 {
            anyhow::bail!("progress_marker must be non-zero");
        }

        if self.device.image.as_os_str().is_empty() {
            anyhow::bail!("device image path is empty");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.engine_config().validate()?;
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("savsend")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.transfer.max_chunk, 256);
        assert_eq!(settings.transfer.tick_ms, 0);
        assert_eq!(settings.transfer.progress_marker, 1024);
        assert_eq!(settings.device.kind, 2);
        assert_eq!(settings.logging.level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings::default();

        settings.transfer.max_chunk = 0;
        assert!(settings.validate().is_err());

        settings.transfer.max_chunk = 512;
        settings.transfer.tick_ms = 5000;
        assert!(settings.validate().is_err());

        settings.transfer.tick_ms = 16;
        settings.logging.level = "loud".to_string();
        assert!(settings.validate().is_err());

        settings.logging.level = "DEBUG".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_engine_config_pacing() {
        let mut settings = Settings::default();
        assert_eq!(settings.engine_config().pacing, Pacing::Yield);

        settings.transfer.tick_ms = 16;
        assert_eq!(
            settings.engine_config().pacing,
            Pacing::Tick(Duration::from_millis(16))
        );
    }

    #[test]
    fn test_connect_timeout() {
        let mut settings = Settings::default();
        assert_eq!(settings.connect_timeout(), Some(Duration::from_secs(10)));

        settings.transfer.connect_timeout_secs = 0;
        assert_eq!(settings.connect_timeout(), None);
    }

    #[test]
    fn test_io_timeout_reaches_engine() {
        let mut settings = Settings::default();
        assert_eq!(settings.io_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(
            settings.engine_config().io_timeout,
            Some(Duration::from_secs(30))
        );

        settings.transfer.io_timeout_secs = 0;
        assert_eq!(settings.engine_config().io_timeout, None);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [device]
            image = "saves/pokemon.sav"
            kind = 3
            "#,
        )
        .unwrap();

        assert_eq!(settings.device.image, PathBuf::from("saves/pokemon.sav"));
        assert_eq!(settings.device_kind(), DeviceKind::FLASH);
        assert_eq!(settings.transfer.max_chunk, 256);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_load_written_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        let mut settings = Settings::default();
        settings.transfer.max_chunk = 1024;
        settings.transfer.io_timeout_secs = 5;
        fs::write(&path, toml::to_string_pretty(&settings).unwrap()).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.transfer.max_chunk, 1024);
        assert_eq!(loaded.io_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(loaded.device.image, settings.device.image);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let settings = Settings::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.transfer.max_chunk, 256);
    }
}
