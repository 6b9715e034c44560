//! Configuration file support for caterflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CATERFLASH_*)
//! 3. Local config file (./caterflash.toml)
//! 4. Global config file (~/.config/caterflash/config.toml)

use caterflash::{DeviceProfile, SessionConfig, UsbId};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "caterflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Extra USB IDs treated as bootloaders during auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbId>,
}

/// Flash session configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Default device profile name.
    pub device: Option<String>,
    /// Page size override in bytes.
    pub page_size: Option<usize>,
    /// Per-response read timeout in milliseconds.
    pub read_timeout_ms: Option<u64>,
    /// Retries allowed per session step.
    pub max_retries: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "caterflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        if other.port.connection.serial.is_some() {
            self.port.connection.serial = other.port.connection.serial;
        }
        if other.port.connection.baud.is_some() {
            self.port.connection.baud = other.port.connection.baud;
        }
        for id in other.port.usb_device {
            if !self.port.usb_device.contains(&id) {
                self.port.usb_device.push(id);
            }
        }

        if other.flash.device.is_some() {
            self.flash.device = other.flash.device;
        }
        if other.flash.page_size.is_some() {
            self.flash.page_size = other.flash.page_size;
        }
        if other.flash.read_timeout_ms.is_some() {
            self.flash.read_timeout_ms = other.flash.read_timeout_ms;
        }
        if other.flash.max_retries.is_some() {
            self.flash.max_retries = other.flash.max_retries;
        }
    }

    /// Whether `id` was remembered as a bootloader.
    pub fn is_known_usb(&self, id: UsbId) -> bool {
        self.port.usb_device.contains(&id)
    }

    /// Apply the `[flash]` overrides to `profile`.
    pub fn apply_to_profile(&self, profile: DeviceProfile) -> DeviceProfile {
        match self.flash.page_size {
            Some(page_size) => profile.with_page_size(page_size),
            None => profile,
        }
    }

    /// Session parameters for `profile` with the `[flash]` overrides applied.
    pub fn session_config(&self, profile: &DeviceProfile) -> SessionConfig {
        let mut session = SessionConfig::for_profile(profile);
        if let Some(ms) = self.flash.read_timeout_ms {
            session = session.with_read_timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = self.flash.max_retries {
            session = session.with_max_retries(retries);
        }
        session
    }

    /// Save a USB ID for future auto-detection.
    ///
    /// Writes to the local config file when one exists, otherwise to the
    /// global one.
    pub fn remember_usb_device(&mut self, id: UsbId) -> anyhow::Result<()> {
        if self.is_known_usb(id) {
            return Ok(());
        }

        let local = Path::new(LOCAL_CONFIG_FILE);
        let path = if local.exists() {
            local.to_path_buf()
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            local.to_path_buf()
        };

        Self::append_usb_device(&path, id)?;
        self.port.usb_device.push(id);
        info!("Saved USB device {id} to {}", path.display());

        Ok(())
    }

    /// Add `id` to the file at `path`, keeping its other settings.
    fn append_usb_device(path: &Path, id: UsbId) -> anyhow::Result<()> {
        let mut stored = if path.exists() {
            toml::from_str::<Self>(&fs::read_to_string(path)?)?
        } else {
            Self::default()
        };
        if !stored.port.usb_device.contains(&id) {
            stored.port.usb_device.push(id);
        }
        fs::write(path, toml::to_string_pretty(&stored)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Default values ----

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_none());
        assert!(config.port.connection.baud.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(config.flash.device.is_none());
        assert!(config.flash.page_size.is_none());
    }

    // ---- TOML parsing ----

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[port.connection]
serial = "/dev/ttyACM0"
baud = 57600

[[port.usb_device]]
vid = 0x2341
pid = 0x0036

[[port.usb_device]]
vid = 0x1B4F
pid = 0x9205

[flash]
device = "atmega32u4"
page_size = 128
read_timeout_ms = 500
max_retries = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.port.connection.baud, Some(57600));
        assert_eq!(
            config.port.usb_device,
            vec![UsbId::new(0x2341, 0x0036), UsbId::new(0x1B4F, 0x9205)]
        );
        assert_eq!(config.flash.device.as_deref(), Some("atmega32u4"));
        assert_eq!(config.flash.page_size, Some(128));
        assert_eq!(config.flash.read_timeout_ms, Some(500));
        assert_eq!(config.flash.max_retries, Some(5));
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str("[flash]\ndevice = \"leonardo\"\n").unwrap();
        assert_eq!(config.flash.device.as_deref(), Some("leonardo"));
        assert!(config.port.connection.serial.is_none());
    }

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(toml::from_str::<Config>("[flash]\npage_size = \"big\"\n").is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut config = Config::default();
        config.port.connection.serial = Some("COM3".to_string());
        config.port.usb_device.push(UsbId::new(0x2341, 0x0037));
        config.flash.max_retries = Some(2);

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    // ---- Merge ----

    #[test]
    fn test_merge_overrides_set_values() {
        let mut base = Config::default();
        base.port.connection.serial = Some("/dev/ttyACM0".to_string());
        base.port.connection.baud = Some(57600);
        base.flash.device = Some("atmega16u4".to_string());

        let mut other = Config::default();
        other.port.connection.serial = Some("/dev/ttyACM1".to_string());
        other.flash.page_size = Some(64);

        base.merge(other);
        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(base.port.connection.baud, Some(57600));
        assert_eq!(base.flash.device.as_deref(), Some("atmega16u4"));
        assert_eq!(base.flash.page_size, Some(64));
    }

    #[test]
    fn test_merge_usb_devices_without_duplicates() {
        let mut base = Config::default();
        base.port.usb_device.push(UsbId::new(0x2341, 0x0036));

        let mut other = Config::default();
        other.port.usb_device.push(UsbId::new(0x2341, 0x0036));
        other.port.usb_device.push(UsbId::new(0x1209, 0x2301));

        base.merge(other);
        assert_eq!(
            base.port.usb_device,
            vec![UsbId::new(0x2341, 0x0036), UsbId::new(0x1209, 0x2301)]
        );
        assert!(base.is_known_usb(UsbId::new(0x1209, 0x2301)));
        assert!(!base.is_known_usb(UsbId::new(0x1209, 0x2302)));
    }

    // ---- Profile and session overrides ----

    #[test]
    fn test_apply_to_profile() {
        let config = Config::default();
        assert_eq!(
            config.apply_to_profile(DeviceProfile::atmega32u4()).page_size,
            128
        );

        let mut config = Config::default();
        config.flash.page_size = Some(64);
        assert_eq!(
            config.apply_to_profile(DeviceProfile::atmega32u4()).page_size,
            64
        );
    }

    #[test]
    fn test_session_config_overrides() {
        let profile = DeviceProfile::atmega32u4();
        let defaults = Config::default().session_config(&profile);
        assert_eq!(defaults, SessionConfig::for_profile(&profile));

        let mut config = Config::default();
        config.flash.read_timeout_ms = Some(750);
        config.flash.max_retries = Some(1);
        let session = config.session_config(&profile);
        assert_eq!(session.read_timeout, Duration::from_millis(750));
        assert_eq!(session.max_retries, 1);
        assert_eq!(session.page_size, profile.page_size);
    }

    // ---- File loading ----

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[port.connection]\nserial = \"/dev/ttyACM3\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyACM3"));
    }

    #[test]
    fn test_load_from_missing_path_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("missing.toml"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_invalid_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();
        assert_eq!(Config::load_from_path(&path), Config::default());
    }

    #[test]
    fn test_append_usb_device_keeps_other_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caterflash.toml");
        fs::write(&path, "[flash]\ndevice = \"micro\"\n").unwrap();

        Config::append_usb_device(&path, UsbId::new(0x2341, 0x0037)).unwrap();
        Config::append_usb_device(&path, UsbId::new(0x2341, 0x0037)).unwrap();

        let stored = Config::load_from_path(&path);
        assert_eq!(stored.flash.device.as_deref(), Some("micro"));
        assert_eq!(stored.port.usb_device, vec![UsbId::new(0x2341, 0x0037)]);
    }

    #[test]
    fn test_append_usb_device_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.toml");

        Config::append_usb_device(&path, UsbId::new(0x1B4F, 0x9205)).unwrap();
        let stored = Config::load_from_path(&path);
        assert_eq!(stored.port.usb_device, vec![UsbId::new(0x1B4F, 0x9205)]);
    }

    #[test]
    fn test_global_config_path_name() {
        if let Some(path) = Config::global_config_path() {
            assert!(path.ends_with("config.toml"));
        }
    }
}
