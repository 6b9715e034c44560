//! Device discovery and classification.
//!
//! Caterina boards show up as USB CDC serial ports with different USB IDs
//! depending on whether the sketch or the bootloader is running. After a
//! reset the bootloader only stays up for a few seconds, so discovery looks
//! for the bootloader IDs first.

use crate::error::{Error, Result};
use std::fmt;

#[cfg(feature = "native")]
use crate::port::{NativePortEnumerator, PortEnumerator, PortInfo};
#[cfg(feature = "native")]
use log::{debug, info, trace};

/// USB vendor/product ID pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UsbId {
    /// Vendor ID.
    pub vid: u16,
    /// Product ID.
    pub pid: u16,
}

impl UsbId {
    /// Create a USB ID.
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}

/// Known Caterina boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BoardKind {
    /// Arduino Leonardo.
    Leonardo,
    /// Arduino Micro.
    Micro,
    /// SparkFun Pro Micro (5V/16MHz or 3.3V/8MHz).
    ProMicro,
    /// Unknown device.
    Unknown,
}

/// What the board is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum UsbMode {
    /// Caterina bootloader, ready for flashing.
    Bootloader,
    /// User sketch.
    Application,
}

/// Known USB IDs of Caterina boards.
const KNOWN_USB_DEVICES: &[(UsbId, BoardKind, UsbMode)] = &[
    (UsbId::new(0x2341, 0x0036), BoardKind::Leonardo, UsbMode::Bootloader),
    (UsbId::new(0x2341, 0x8036), BoardKind::Leonardo, UsbMode::Application),
    (UsbId::new(0x2A03, 0x0036), BoardKind::Leonardo, UsbMode::Bootloader),
    (UsbId::new(0x2A03, 0x8036), BoardKind::Leonardo, UsbMode::Application),
    (UsbId::new(0x2341, 0x0037), BoardKind::Micro, UsbMode::Bootloader),
    (UsbId::new(0x2341, 0x8037), BoardKind::Micro, UsbMode::Application),
    (UsbId::new(0x1B4F, 0x9205), BoardKind::ProMicro, UsbMode::Bootloader),
    (UsbId::new(0x1B4F, 0x9206), BoardKind::ProMicro, UsbMode::Application),
    (UsbId::new(0x1B4F, 0x9203), BoardKind::ProMicro, UsbMode::Bootloader),
    (UsbId::new(0x1B4F, 0x9204), BoardKind::ProMicro, UsbMode::Application),
];

impl BoardKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> (Self, Option<UsbMode>) {
        let id = UsbId::new(vid, pid);
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known, _, _)| *known == id)
            .map_or((Self::Unknown, None), |(_, board, mode)| (*board, Some(*mode)))
    }

    /// Get a human-readable name for the board.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Leonardo => "Arduino Leonardo",
            Self::Micro => "Arduino Micro",
            Self::ProMicro => "SparkFun Pro Micro",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known board.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// All bootloader-mode USB IDs of known boards.
pub fn bootloader_usb_ids() -> Vec<UsbId> {
    KNOWN_USB_DEVICES
        .iter()
        .filter(|(_, _, mode)| *mode == UsbMode::Bootloader)
        .map(|(id, _, _)| *id)
        .collect()
}

/// Discovered serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified board.
    pub board: BoardKind,
    /// Bootloader or application, for known boards.
    pub mode: Option<UsbMode>,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Whether the port is a board waiting in its bootloader.
    pub fn is_bootloader(&self) -> bool {
        self.mode == Some(UsbMode::Bootloader)
    }

    /// USB ID of the port, if it is a USB device.
    pub fn usb_id(&self) -> Option<UsbId> {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => Some(UsbId::new(vid, pid)),
            _ => None,
        }
    }
}

#[cfg(feature = "native")]
impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let (board, mode) = match info.usb_id() {
            Some(id) => BoardKind::from_vid_pid(id.vid, id.pid),
            None => (BoardKind::Unknown, None),
        };
        Self {
            name: info.name,
            board,
            mode,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// Detect all available serial ports with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let detected = DetectedPort::from(info);
                trace!(
                    "Found port: {} ({:?}, {:?})",
                    detected.name, detected.board, detected.mode
                );
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Detect all available serial ports (no native backend, always empty).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Ports of boards currently in bootloader mode.
pub fn detect_bootloader_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_bootloader)
        .collect()
}

/// Pick the port to flash from `ports`.
///
/// Prefers a port matching one of `ids`, then any known bootloader.
pub fn select_bootloader_port(ports: &[DetectedPort], ids: &[UsbId]) -> Option<DetectedPort> {
    ports
        .iter()
        .find(|p| p.usb_id().is_some_and(|id| ids.contains(&id)))
        .or_else(|| ports.iter().find(|p| p.is_bootloader()))
        .cloned()
}

/// Auto-detect a single board in bootloader mode.
#[cfg(feature = "native")]
pub fn auto_detect_port(ids: &[UsbId]) -> Result<DetectedPort> {
    let ports = detect_ports();
    match select_bootloader_port(&ports, ids) {
        Some(port) => {
            info!("Auto-detected {} bootloader: {}", port.board.name(), port.name);
            Ok(port)
        },
        None => Err(Error::DeviceNotFound),
    }
}

/// Auto-detect a single board in bootloader mode (no native backend).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port(_ids: &[UsbId]) -> Result<DetectedPort> {
    Err(Error::DeviceNotFound)
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = match (port.board.is_known(), port.mode, port.usb_id()) {
                (true, Some(UsbMode::Bootloader), _) => {
                    format!(" [{}, bootloader]", port.board.name())
                },
                (true, _, _) => format!(" [{}]", port.board.name()),
                (false, _, Some(id)) => format!(" [{id}]"),
                (false, _, None) => String::new(),
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}
