//! One-call flashing of Intel HEX text.
//!
//! [`flash_hex`] is the whole pipeline: decode the image for the selected
//! device, find and open the bootloader port, and run a [`CaterinaFlasher`]
//! session over it. The image is decoded before the port is touched, so a bad
//! file never resets or half-programs a board. Callers that decoded the image
//! themselves hand it to [`flash_image`].

use crate::device::UsbId;
use crate::error::Result;
use crate::image::MemoryImage;
use crate::port::Port;
use crate::target::{CaterinaFlasher, DeviceProfile, SessionConfig};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Which device to flash and how.
#[derive(Debug, Clone, Default)]
pub struct DeviceSelector {
    /// Explicit port name; takes precedence over USB matching.
    pub port: Option<String>,
    /// USB IDs to look for; empty means the profile's bootloader IDs.
    pub usb_ids: Vec<UsbId>,
    /// Baud rate override.
    pub baud_rate: Option<u32>,
    /// Target device.
    pub profile: DeviceProfile,
    /// Session parameter override; defaults follow the profile.
    pub session: Option<SessionConfig>,
    /// Per-session cancellation flag.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl DeviceSelector {
    /// Flash the board on `port`.
    pub fn port(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }

    /// Flash the first board enumerating with one of `ids`.
    pub fn usb(ids: Vec<UsbId>) -> Self {
        Self {
            usb_ids: ids,
            ..Self::default()
        }
    }

    /// Set the device profile.
    #[must_use]
    pub fn with_profile(mut self, profile: DeviceProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }

    /// Override session parameters.
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = Some(session);
        self
    }

    /// Abort when `flag` becomes true.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Effective baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(self.profile.baud_rate)
    }

    /// Effective session parameters.
    pub fn session_config(&self) -> SessionConfig {
        self.session
            .clone()
            .unwrap_or_else(|| SessionConfig::for_profile(&self.profile))
    }

    /// USB IDs to search for.
    pub fn effective_usb_ids(&self) -> Vec<UsbId> {
        if !self.usb_ids.is_empty() {
            self.usb_ids.clone()
        } else if !self.profile.bootloader_ids.is_empty() {
            self.profile.bootloader_ids.clone()
        } else {
            crate::device::bootloader_usb_ids()
        }
    }

    fn decode(&self, text: &str) -> Result<MemoryImage> {
        self.profile.validate()?;
        let image = MemoryImage::from_ihex_str(text, self.profile.flash_size)?;
        debug!(
            "Decoded {} bytes for {}",
            image.len(),
            self.profile.name
        );
        Ok(image)
    }
}

/// Decode `text` and flash it to the device chosen by `selector`.
#[cfg(feature = "native")]
pub fn flash_hex<F>(text: &str, selector: &DeviceSelector, progress: F) -> Result<()>
where
    F: FnMut(u8),
{
    let image = selector.decode(text)?;
    flash_image(&image, selector, progress)
}

/// Flash an already decoded `image` to the device chosen by `selector`.
///
/// An empty image is rejected before any port is looked up.
#[cfg(feature = "native")]
pub fn flash_image<F>(image: &MemoryImage, selector: &DeviceSelector, progress: F) -> Result<()>
where
    F: FnMut(u8),
{
    use crate::error::Error;
    use crate::port::{NativePortEnumerator, PortEnumerator};

    selector.profile.validate()?;
    if image.is_empty() {
        return Err(Error::EmptyImage);
    }

    let port_name = match &selector.port {
        Some(name) => name.clone(),
        None => {
            let ids = selector.effective_usb_ids();
            NativePortEnumerator::find_by_usb_ids(&ids)?
                .into_iter()
                .next()
                .map(|info| info.name)
                .ok_or(Error::DeviceNotFound)?
        },
    };

    let flasher =
        CaterinaFlasher::open(&port_name, selector.baud_rate(), selector.session_config())?;
    run(flasher, selector, image, progress)
}

/// Decode `text` and flash it over an already open `port`.
///
/// The port is closed on return, including when decoding fails.
pub fn flash_hex_with_port<P, F>(
    text: &str,
    mut port: P,
    selector: &DeviceSelector,
    progress: F,
) -> Result<()>
where
    P: Port,
    F: FnMut(u8),
{
    let image = match selector.decode(text) {
        Ok(image) => image,
        Err(e) => {
            if let Err(close_err) = port.close() {
                warn!("Failed to close {}: {close_err}", port.name());
            }
            return Err(e);
        },
    };

    let flasher = CaterinaFlasher::new(port, selector.session_config());
    run(flasher, selector, &image, progress)
}

fn run<P, F>(
    flasher: CaterinaFlasher<P>,
    selector: &DeviceSelector,
    image: &MemoryImage,
    progress: F,
) -> Result<()>
where
    P: Port,
    F: FnMut(u8),
{
    let mut flasher = match &selector.cancel {
        Some(flag) => flasher.with_cancel_flag(Arc::clone(flag)),
        None => flasher,
    };
    flasher.flash(image, progress)
}
