//! Error types for caterflash.

use crate::protocol::avr109::{FlashState, SessionPosition};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for caterflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Intel HEX decoding error.
///
/// Line numbers count records from 1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Record does not start with `:`, contains a non-hex digit, or is truncated.
    #[error("line {line}: malformed record")]
    MalformedLine {
        /// Record number.
        line: usize,
    },

    /// Record checksum does not match its contents.
    #[error("line {line}: checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    ChecksumMismatch {
        /// Record number.
        line: usize,
        /// Checksum computed from the record contents.
        expected: u8,
        /// Checksum found in the record.
        actual: u8,
    },

    /// Record type outside of `0x00..=0x05`.
    #[error("line {line}: unknown record type {record_type:#04x}")]
    UnknownRecordType {
        /// Record number.
        line: usize,
        /// Raw record type byte.
        record_type: u8,
    },

    /// Wrong byte count for an end-of-file or address record.
    #[error("line {line}: invalid byte count {byte_count} for record type {record_type:#04x}")]
    InvalidRecordLength {
        /// Record number.
        line: usize,
        /// Raw record type byte.
        record_type: u8,
        /// Byte count found in the record.
        byte_count: u8,
    },

    /// Address record with a load address other than zero.
    #[error("line {line}: record type {record_type:#04x} must have load address 0, got {load_address:#06x}")]
    NonZeroLoadAddress {
        /// Record number.
        line: usize,
        /// Raw record type byte.
        record_type: u8,
        /// Load address found in the record.
        load_address: u16,
    },

    /// Data record reaches past the device capacity.
    #[error("line {line}: data at {address:#x}..{end:#x} exceeds device capacity of {capacity} bytes")]
    AddressOutOfRange {
        /// Record number.
        line: usize,
        /// Absolute start address of the record data.
        address: usize,
        /// Absolute end address (exclusive).
        end: usize,
        /// Configured capacity in bytes.
        capacity: usize,
    },

    /// Input ended before an end-of-file record.
    #[error("unexpected end of input: missing end-of-file record")]
    MissingEndOfFile,
}

/// Phase of a flashing run in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Decoding the firmware image, before any device I/O.
    Parsing,
    /// Identity request, programming mode entry or address set.
    Handshake,
    /// Waiting for page `index` (1-based) of `total` to be acknowledged.
    Page {
        /// Page number, starting at 1.
        index: usize,
        /// Total number of pages in the image.
        total: usize,
    },
    /// Leaving programming mode and exiting the bootloader.
    Exit,
    /// Anything outside a session (port selection, configuration).
    Setup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parsing => write!(f, "parsing"),
            Self::Handshake => write!(f, "handshake"),
            Self::Page { index, total } => write!(f, "page {index} of {total}"),
            Self::Exit => write!(f, "exit"),
            Self::Setup => write!(f, "setup"),
        }
    }
}

/// Error type for caterflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (port or file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Invalid Intel HEX input.
    #[error("Invalid HEX: {0}")]
    Parse(#[from] ParseError),

    /// The bootloader kept answering with something other than the expected response.
    #[error("Protocol desync in {state} ({position}): expected {expected}, got {actual:02X?}")]
    ProtocolDesync {
        /// State the session was in.
        state: FlashState,
        /// Human-readable description of the expected response.
        expected: &'static str,
        /// Bytes of the last rejected response.
        actual: Vec<u8>,
        /// Session progress at the time of failure.
        position: SessionPosition,
    },

    /// The bootloader did not answer in time.
    #[error("Timeout in {state} ({position})")]
    ProtocolTimeout {
        /// State the session was in.
        state: FlashState,
        /// Session progress at the time of failure.
        position: SessionPosition,
    },

    /// The port reported end of stream before the session finished.
    #[error("Connection closed early in {state} ({position})")]
    TransportClosedEarly {
        /// State the session was in.
        state: FlashState,
        /// Session progress at the time of failure.
        position: SessionPosition,
    },

    /// The port failed while a session was running.
    #[error("Transport error in {state} ({position}): {source}")]
    Transport {
        /// State the session was in.
        state: FlashState,
        /// Session progress at the time of failure.
        position: SessionPosition,
        /// Underlying port error.
        source: io::Error,
    },

    /// The embedding application requested cancellation.
    #[error("Cancelled in {state} ({position})")]
    Cancelled {
        /// State the session was in.
        state: FlashState,
        /// Session progress at the time of failure.
        position: SessionPosition,
    },

    /// The image holds no data to write.
    #[error("Image is empty, nothing to flash")]
    EmptyImage,

    /// The image does not fit the 16-bit word address of the AVR109 protocol.
    #[error("Image of {len} bytes exceeds the AVR109 word address range")]
    ImageTooLarge {
        /// Image length in bytes.
        len: usize,
    },

    /// No matching port was found.
    #[error("Device not found or not in bootloader mode")]
    DeviceNotFound,

    /// Invalid session or device configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify which phase of a flashing run this error belongs to.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Parse(_) => Phase::Parsing,
            Self::ProtocolDesync { state, position, .. }
            | Self::ProtocolTimeout { state, position }
            | Self::TransportClosedEarly { state, position }
            | Self::Transport { state, position, .. }
            | Self::Cancelled { state, position } => position.phase(*state),
            _ => Phase::Setup,
        }
    }

    /// Whether the device may hold a partially written image.
    pub fn may_have_partial_flash(&self) -> bool {
        match self {
            Self::ProtocolDesync { position, .. }
            | Self::ProtocolTimeout { position, .. }
            | Self::TransportClosedEarly { position, .. }
            | Self::Transport { position, .. }
            | Self::Cancelled { position, .. } => position.pages_sent > 0,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::ChecksumMismatch {
            line: 3,
            expected: 0x1E,
            actual: 0x1F,
        };
        assert_eq!(
            err.to_string(),
            "line 3: checksum mismatch (expected 0x1e, got 0x1f)"
        );
    }

    #[test]
    fn test_parse_error_phase() {
        let err: Error = ParseError::MissingEndOfFile.into();
        assert_eq!(err.phase(), Phase::Parsing);
        assert!(!err.may_have_partial_flash());
    }

    #[test]
    fn test_page_phase_display() {
        let err = Error::ProtocolTimeout {
            state: FlashState::AwaitingPageAck,
            position: SessionPosition {
                pages_sent: 2,
                page_total: 5,
                byte_offset: 256,
                word_address: 0x80,
            },
        };
        assert_eq!(err.phase(), Phase::Page { index: 2, total: 5 });
        assert_eq!(err.phase().to_string(), "page 2 of 5");
        assert!(err.may_have_partial_flash());
    }

    #[test]
    fn test_transport_error_keeps_position() {
        let err = Error::Transport {
            state: FlashState::AwaitingPageAck,
            position: SessionPosition {
                pages_sent: 2,
                page_total: 3,
                byte_offset: 128,
                word_address: 0x40,
            },
            source: io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"),
        };
        assert_eq!(err.phase(), Phase::Page { index: 2, total: 3 });
        assert!(err.may_have_partial_flash());
        assert!(err.to_string().contains("unplugged"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_setup_phase() {
        assert_eq!(Error::DeviceNotFound.phase(), Phase::Setup);
        assert_eq!(Error::EmptyImage.phase(), Phase::Setup);
    }
}
