//! # caterflash
//!
//! A library for flashing Intel HEX firmware to boards running the Caterina
//! (AVR109) bootloader, such as the Arduino Leonardo, Arduino Micro and
//! SparkFun Pro Micro.
//!
//! This crate provides:
//!
//! - Intel HEX decoding into a flat memory image
//! - The AVR109 command set used by Caterina
//! - A state-machine flasher over an abstract serial port
//! - Device profiles and USB bootloader discovery
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via `serialport`
//! - `serde`: Serialization support for discovery types
//!
//! ## Example
//!
//! ```rust,no_run
//! use caterflash::{DeviceProfile, DeviceSelector, flash_hex};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let text = std::fs::read_to_string("blink.hex")?;
//!
//!     // Find a 32U4 board in bootloader mode and flash it
//!     let selector = DeviceSelector::usb(Vec::new()).with_profile(DeviceProfile::atmega32u4());
//!     flash_hex(&text, &selector, |percent| println!("{percent}%"))?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker polled by running sessions.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
#[cfg(feature = "native")]
pub use session::{flash_hex, flash_image};
pub use {
    device::{BoardKind, DetectedPort, UsbId, UsbMode, auto_detect_port, detect_ports},
    error::{Error, ParseError, Phase, Result},
    image::{HexRecord, MemoryImage, RecordType},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::avr109::{FlashState, Outcome, SessionPosition},
    session::{DeviceSelector, flash_hex_with_port},
    target::{CaterinaFlasher, DeviceProfile, SessionConfig},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }
}
