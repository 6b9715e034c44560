//! AVR109 wire protocol as spoken by the Caterina bootloader.
//!
//! Every command is a single ASCII byte, optionally followed by big-endian
//! parameters. The bootloader answers each command with a carriage return
//! (`0x0D`), except for the identity request which returns the programmer
//! name.
//!
//! ```text
//! host                         Caterina
//!  | -- 'S' ------------------> |
//!  | <----------------- CATERIN |
//!  | -- 'P' ------------------> |
//!  | <----------------------- CR |
//!  | -- 'A' addr_hi addr_lo --> |   word address
//!  | <----------------------- CR |
//!  | -- 'B' len_hi len_lo 'F' data... -> |   one page
//!  | <----------------------- CR |
//!  | -- 'L' ------------------> |
//!  | <----------------------- CR |
//!  | -- 'E' ------------------> |
//! ```

use crate::error::{Error, Phase, Result};
use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;

/// Caterina serial baud rate.
pub const DEFAULT_BAUD: u32 = 57600;

/// Programmer identity returned in response to `'S'`.
pub const IDENTITY: &[u8] = b"CATERIN";

/// AVR109 command and response bytes.
pub mod control {
    /// Return programmer identifier.
    pub const IDENTIFY: u8 = b'S';
    /// Enter programming mode.
    pub const ENTER_PROGRAMMING: u8 = b'P';
    /// Set word address for the next block.
    pub const SET_ADDRESS: u8 = b'A';
    /// Start block load.
    pub const BLOCK_WRITE: u8 = b'B';
    /// Memory type selector for flash.
    pub const MEMORY_FLASH: u8 = b'F';
    /// Leave programming mode.
    pub const LEAVE_PROGRAMMING: u8 = b'L';
    /// Exit bootloader and start the application.
    pub const EXIT: u8 = b'E';
    /// Acknowledge (carriage return).
    pub const ACK: u8 = 0x0D;
}

/// AVR109 commands used for flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// `'S'`
    Identify = control::IDENTIFY,
    /// `'P'`
    EnterProgramming = control::ENTER_PROGRAMMING,
    /// `'A'`
    SetAddress = control::SET_ADDRESS,
    /// `'B'`
    BlockWrite = control::BLOCK_WRITE,
    /// `'L'`
    LeaveProgramming = control::LEAVE_PROGRAMMING,
    /// `'E'`
    Exit = control::EXIT,
}

/// Command frame builder.
#[derive(Debug)]
pub struct CommandFrame {
    cmd: Command,
    data: Vec<u8>,
}

impl CommandFrame {
    /// Create a command frame without parameters.
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            data: Vec::new(),
        }
    }

    /// Identity request.
    pub fn identify() -> Self {
        Self::new(Command::Identify)
    }

    /// Enter programming mode.
    pub fn enter_programming() -> Self {
        Self::new(Command::EnterProgramming)
    }

    /// Set the word address the next block is written to.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn set_address(word_address: u16) -> Self {
        let mut frame = Self::new(Command::SetAddress);
        frame.data.write_u16::<BigEndian>(word_address).unwrap();
        frame
    }

    /// Write one flash page.
    ///
    /// The page length is sent as a 16-bit block size.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn block_write(page: &[u8]) -> Result<Self> {
        let size = u16::try_from(page.len())
            .map_err(|_| Error::Config(format!("page of {} bytes is too large", page.len())))?;

        let mut frame = Self::new(Command::BlockWrite);
        frame.data.reserve(3 + page.len());
        frame.data.write_u16::<BigEndian>(size).unwrap();
        frame.data.push(control::MEMORY_FLASH);
        frame.data.extend_from_slice(page);
        Ok(frame)
    }

    /// Leave programming mode.
    pub fn leave_programming() -> Self {
        Self::new(Command::LeaveProgramming)
    }

    /// Exit the bootloader.
    pub fn exit() -> Self {
        Self::new(Command::Exit)
    }

    /// Build the bytes sent on the wire.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.data.len());
        buf.push(self.cmd as u8);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Get the command type.
    pub fn command(&self) -> Command {
        self.cmd
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The bootloader acknowledged every command and was told to exit.
    Success,
    /// The session was aborted.
    Failure,
}

/// Flashing session state.
///
/// Each non-terminal state waits for exactly one response from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// `'S'` sent, waiting for the programmer identity.
    AwaitingIdentity,
    /// `'P'` sent, waiting for the acknowledge.
    AwaitingModeAck,
    /// Address or a non-final page sent, waiting for the acknowledge.
    AwaitingPageAck,
    /// Final page sent, waiting for the acknowledge.
    AwaitingFinalPageAck,
    /// `'L'` sent, waiting for the acknowledge.
    AwaitingLeaveAck,
    /// Session over.
    Terminated(Outcome),
}

impl FlashState {
    /// Bytes expected from the device in this state.
    ///
    /// Terminal states expect nothing.
    pub fn expected_response(self) -> &'static [u8] {
        match self {
            Self::AwaitingIdentity => IDENTITY,
            Self::AwaitingModeAck
            | Self::AwaitingPageAck
            | Self::AwaitingFinalPageAck
            | Self::AwaitingLeaveAck => &[control::ACK],
            Self::Terminated(_) => &[],
        }
    }

    /// Description of the expected response for diagnostics.
    pub fn expected_description(self) -> &'static str {
        match self {
            Self::AwaitingIdentity => "identity \"CATERIN\"",
            Self::Terminated(_) => "nothing",
            _ => "ACK (0x0D)",
        }
    }

    /// Whether `response` is what this state waits for.
    pub fn accepts(self, response: &[u8]) -> bool {
        let expected = self.expected_response();
        !expected.is_empty() && response.starts_with(expected)
    }

    /// Whether the session is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingIdentity => write!(f, "AwaitingIdentity"),
            Self::AwaitingModeAck => write!(f, "AwaitingModeAck"),
            Self::AwaitingPageAck => write!(f, "AwaitingPageAck"),
            Self::AwaitingFinalPageAck => write!(f, "AwaitingFinalPageAck"),
            Self::AwaitingLeaveAck => write!(f, "AwaitingLeaveAck"),
            Self::Terminated(Outcome::Success) => write!(f, "Terminated(Success)"),
            Self::Terminated(Outcome::Failure) => write!(f, "Terminated(Failure)"),
        }
    }
}

/// Where a session stood when it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPosition {
    /// Pages written to the port so far, counting one still being written.
    pub pages_sent: usize,
    /// Pages in the image.
    pub page_total: usize,
    /// Image offset of the next page.
    pub byte_offset: usize,
    /// Word address of the next page.
    pub word_address: u16,
}

impl SessionPosition {
    /// Phase this position falls into while in `state`.
    pub fn phase(&self, state: FlashState) -> Phase {
        match state {
            FlashState::AwaitingIdentity | FlashState::AwaitingModeAck => Phase::Handshake,
            FlashState::AwaitingPageAck if self.pages_sent == 0 => Phase::Handshake,
            FlashState::AwaitingPageAck | FlashState::AwaitingFinalPageAck => Phase::Page {
                index: self.pages_sent,
                total: self.page_total,
            },
            FlashState::AwaitingLeaveAck | FlashState::Terminated(_) => Phase::Exit,
        }
    }
}

impl fmt::Display for SessionPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} pages, offset {:#06x}, word address {:#06x}",
            self.pages_sent, self.page_total, self.byte_offset, self.word_address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_commands() {
        assert_eq!(CommandFrame::identify().build(), vec![0x53]);
        assert_eq!(CommandFrame::enter_programming().build(), vec![0x50]);
        assert_eq!(CommandFrame::leave_programming().build(), vec![0x4C]);
        assert_eq!(CommandFrame::exit().build(), vec![0x45]);
    }

    #[test]
    fn test_set_address_frame() {
        let frame = CommandFrame::set_address(0x1234);
        assert_eq!(frame.command(), Command::SetAddress);
        assert_eq!(frame.build(), vec![0x41, 0x12, 0x34]);
    }

    #[test]
    fn test_block_write_frame() {
        let page = [0xAAu8; 128];
        let data = CommandFrame::block_write(&page).unwrap().build();

        assert_eq!(data.len(), 4 + 128);
        assert_eq!(&data[..4], &[0x42, 0x00, 0x80, 0x46]);
        assert!(data[4..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_block_write_too_large() {
        let page = vec![0u8; 0x1_0000];
        assert!(matches!(
            CommandFrame::block_write(&page),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_identity_matching() {
        let state = FlashState::AwaitingIdentity;
        assert!(state.accepts(b"CATERIN"));
        assert!(!state.accepts(b"AVRBOOT"));
        assert!(!state.accepts(b"CATER"));
    }

    #[test]
    fn test_ack_matching() {
        for state in [
            FlashState::AwaitingModeAck,
            FlashState::AwaitingPageAck,
            FlashState::AwaitingFinalPageAck,
            FlashState::AwaitingLeaveAck,
        ] {
            assert!(state.accepts(&[0x0D]), "{state}");
            assert!(!state.accepts(&[0x3F]), "{state}");
            assert!(!state.accepts(&[]), "{state}");
        }
        assert!(!FlashState::Terminated(Outcome::Success).accepts(&[0x0D]));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(FlashState::AwaitingPageAck.to_string(), "AwaitingPageAck");
        assert_eq!(
            FlashState::Terminated(Outcome::Failure).to_string(),
            "Terminated(Failure)"
        );
        assert!(FlashState::Terminated(Outcome::Success).is_terminal());
        assert!(!FlashState::AwaitingLeaveAck.is_terminal());
    }

    #[test]
    fn test_position_phase() {
        let mut position = SessionPosition {
            page_total: 4,
            ..SessionPosition::default()
        };
        assert_eq!(position.phase(FlashState::AwaitingIdentity), Phase::Handshake);
        assert_eq!(position.phase(FlashState::AwaitingPageAck), Phase::Handshake);

        position.pages_sent = 1;
        assert_eq!(
            position.phase(FlashState::AwaitingPageAck),
            Phase::Page { index: 1, total: 4 }
        );

        position.pages_sent = 4;
        assert_eq!(
            position.phase(FlashState::AwaitingFinalPageAck),
            Phase::Page { index: 4, total: 4 }
        );
        assert_eq!(position.phase(FlashState::AwaitingLeaveAck), Phase::Exit);
    }

    #[test]
    fn test_position_display() {
        let position = SessionPosition {
            pages_sent: 2,
            page_total: 3,
            byte_offset: 0x100,
            word_address: 0x80,
        };
        assert_eq!(
            position.to_string(),
            "2/3 pages, offset 0x0100, word address 0x0080"
        );
    }
}
