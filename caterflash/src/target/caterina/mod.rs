//! Caterina bootloader support (ATmega32U4/16U4 boards).

pub mod flasher;

pub use flasher::{CaterinaFlasher, SessionConfig};
