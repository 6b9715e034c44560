//! Device profiles for boards running the Caterina bootloader.
//!
//! A profile bundles everything a session needs to know about the target:
//! how much flash the application may use, the page size the bootloader
//! writes in, the serial baud rate and the USB IDs the bootloader enumerates
//! with.

use crate::device::UsbId;
use crate::error::{Error, Result};
use crate::protocol::avr109::DEFAULT_BAUD;
use std::fmt;

/// Page size used by ATmega32U4/16U4 flash.
pub const DEFAULT_PAGE_SIZE: usize = 128;

/// Largest page the 16-bit block size field can describe.
pub const MAX_PAGE_SIZE: usize = 0xFFFF;

/// Largest flash the 16-bit word address can reach.
pub const MAX_FLASH_SIZE: usize = 0x1_0000 * 2;

/// USB IDs the Caterina bootloader enumerates with on 32U4 boards.
const ATMEGA32U4_BOOTLOADER_IDS: &[UsbId] = &[
    UsbId::new(0x2341, 0x0036), // Arduino Leonardo
    UsbId::new(0x2341, 0x0037), // Arduino Micro
    UsbId::new(0x2A03, 0x0036), // Arduino Leonardo (arduino.org)
    UsbId::new(0x1B4F, 0x9205), // SparkFun Pro Micro 5V
    UsbId::new(0x1B4F, 0x9203), // SparkFun Pro Micro 3.3V
];

/// Target device parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Display name.
    pub name: String,
    /// Flash bytes available to the application (below the bootloader).
    pub flash_size: usize,
    /// Flash page size in bytes.
    pub page_size: usize,
    /// Serial baud rate of the bootloader.
    pub baud_rate: u32,
    /// USB IDs of the board while in bootloader mode.
    pub bootloader_ids: Vec<UsbId>,
}

impl DeviceProfile {
    /// ATmega32U4: 32 KiB flash with a 4 KiB Caterina bootloader on top.
    pub fn atmega32u4() -> Self {
        Self {
            name: "ATmega32U4".to_string(),
            flash_size: 28 * 1024,
            page_size: DEFAULT_PAGE_SIZE,
            baud_rate: DEFAULT_BAUD,
            bootloader_ids: ATMEGA32U4_BOOTLOADER_IDS.to_vec(),
        }
    }

    /// ATmega16U4: 16 KiB flash with a 4 KiB Caterina bootloader on top.
    pub fn atmega16u4() -> Self {
        Self {
            name: "ATmega16U4".to_string(),
            flash_size: 12 * 1024,
            page_size: DEFAULT_PAGE_SIZE,
            baud_rate: DEFAULT_BAUD,
            bootloader_ids: Vec::new(),
        }
    }

    /// All built-in profiles.
    pub fn builtin() -> Vec<Self> {
        vec![Self::atmega32u4(), Self::atmega16u4()]
    }

    /// Look up a built-in profile by MCU or board name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "atmega32u4" | "m32u4" | "32u4" | "leonardo" | "micro" | "promicro"
            | "pro-micro" => Some(Self::atmega32u4()),
            "atmega16u4" | "m16u4" | "16u4" => Some(Self::atmega16u4()),
            _ => None,
        }
    }

    /// Profile for a device not in the built-in table.
    pub fn custom(name: impl Into<String>, flash_size: usize, page_size: usize) -> Self {
        Self {
            name: name.into(),
            flash_size,
            page_size,
            baud_rate: DEFAULT_BAUD,
            bootloader_ids: Vec::new(),
        }
    }

    /// Set the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the bootloader USB IDs.
    #[must_use]
    pub fn with_bootloader_ids(mut self, ids: Vec<UsbId>) -> Self {
        self.bootloader_ids = ids;
        self
    }

    /// Check that the profile can be driven over AVR109.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.flash_size == 0 {
            return Err(Error::Config(format!(
                "{}: flash size must be non-zero",
                self.name
            )));
        }
        if self.flash_size > MAX_FLASH_SIZE {
            return Err(Error::Config(format!(
                "{}: flash size of {} bytes exceeds the 16-bit word address range",
                self.name, self.flash_size
            )));
        }
        if self.baud_rate == 0 {
            return Err(Error::Config(format!("{}: baud rate must be non-zero", self.name)));
        }
        Ok(())
    }

    /// Whether `vid:pid` is one of this profile's bootloader IDs.
    pub fn matches_usb(&self, vid: u16, pid: u16) -> bool {
        self.bootloader_ids.contains(&UsbId::new(vid, pid))
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::atmega32u4()
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, {}-byte pages, {} baud)",
            self.name, self.flash_size, self.page_size, self.baud_rate
        )
    }
}

/// Page sizes must be an even number of bytes that fits the block size field.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !(2..=MAX_PAGE_SIZE).contains(&page_size) || page_size % 2 != 0 {
        return Err(Error::Config(format!(
            "page size must be even and between 2 and {MAX_PAGE_SIZE}, got {page_size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles() {
        let profile = DeviceProfile::atmega32u4();
        assert_eq!(profile.flash_size, 28672);
        assert_eq!(profile.page_size, 128);
        assert_eq!(profile.baud_rate, 57600);
        assert!(profile.validate().is_ok());

        let profile = DeviceProfile::atmega16u4();
        assert_eq!(profile.flash_size, 12288);
        assert!(profile.validate().is_ok());

        assert_eq!(DeviceProfile::builtin().len(), 2);
        assert_eq!(DeviceProfile::default(), DeviceProfile::atmega32u4());
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            DeviceProfile::from_name("ATmega32U4"),
            Some(DeviceProfile::atmega32u4())
        );
        assert_eq!(
            DeviceProfile::from_name("leonardo"),
            Some(DeviceProfile::atmega32u4())
        );
        assert_eq!(
            DeviceProfile::from_name("16u4"),
            Some(DeviceProfile::atmega16u4())
        );
        assert_eq!(DeviceProfile::from_name("atmega328p"), None);
    }

    #[test]
    fn test_bootloader_ids() {
        let profile = DeviceProfile::atmega32u4();
        assert!(profile.matches_usb(0x2341, 0x0036));
        assert!(profile.matches_usb(0x1B4F, 0x9205));
        // Leonardo in application mode
        assert!(!profile.matches_usb(0x2341, 0x8036));
    }

    #[test]
    fn test_custom_profile() {
        let profile = DeviceProfile::custom("board", 4096, 64).with_baud(115_200);
        assert_eq!(profile.page_size, 64);
        assert_eq!(profile.baud_rate, 115_200);
        assert!(profile.bootloader_ids.is_empty());
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_profiles() {
        for page_size in [0, 1, 3, 127, 0x1_0000] {
            let profile = DeviceProfile::atmega32u4().with_page_size(page_size);
            assert!(
                matches!(profile.validate(), Err(Error::Config(_))),
                "page size {page_size}"
            );
        }
        assert!(DeviceProfile::custom("x", 0, 128).validate().is_err());
        assert!(DeviceProfile::custom("x", MAX_FLASH_SIZE + 2, 128).validate().is_err());
        assert!(DeviceProfile::custom("x", MAX_FLASH_SIZE, 128).validate().is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            DeviceProfile::atmega32u4().to_string(),
            "ATmega32U4 (28672 bytes, 128-byte pages, 57600 baud)"
        );
    }
}
