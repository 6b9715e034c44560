//! Intel HEX decoding.
//!
//! Intel HEX is a text format in which every line carries one record:
//!
//! ```text
//! +---+-------+---------+------+----------------+----------+
//! | : | LL    | AAAA    | TT   | DD ... DD      | CC       |
//! +---+-------+---------+------+----------------+----------+
//! |   | count | address | type | `count` bytes  | checksum |
//! +---+-------+---------+------+----------------+----------+
//! ```
//!
//! All fields are hex digit pairs. The checksum is the two's complement of the
//! sum of every preceding byte in the record, so the whole record sums to zero
//! modulo 256.
//!
//! Decoding produces a flat [`MemoryImage`] starting at address 0. Holes below
//! the highest written address read back as `0xFF`, the erased flash value.

pub use crate::error::ParseError;

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};
use std::fmt;
use std::fs;
use std::path::Path;

/// Value of unprogrammed flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Length of the shortest possible record (`:LLAAAATTCC`).
const MIN_RECORD_LEN: usize = 11;

/// Intel HEX record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Data bytes at `high address + load address`.
    Data = 0x00,
    /// End of file.
    EndOfFile = 0x01,
    /// Segment base (`value << 4`) for following data records.
    ExtendedSegmentAddress = 0x02,
    /// 80x86 CS:IP start address.
    StartSegmentAddress = 0x03,
    /// Upper 16 address bits (`value << 16`) for following data records.
    ExtendedLinearAddress = 0x04,
    /// 32-bit start address.
    StartLinearAddress = 0x05,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Data),
            0x01 => Ok(Self::EndOfFile),
            0x02 => Ok(Self::ExtendedSegmentAddress),
            0x03 => Ok(Self::StartSegmentAddress),
            0x04 => Ok(Self::ExtendedLinearAddress),
            0x05 => Ok(Self::StartLinearAddress),
            other => Err(other),
        }
    }
}

/// A single decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Number of data bytes.
    pub byte_count: u8,
    /// 16-bit load address (offset from the current high address).
    pub load_address: u16,
    /// Record type.
    pub record_type: RecordType,
    /// Data field.
    pub data: Vec<u8>,
    /// Checksum byte.
    pub checksum: u8,
}

impl HexRecord {
    /// Build a record and compute its checksum.
    ///
    /// Returns `None` if `data` is longer than 255 bytes.
    pub fn new(record_type: RecordType, load_address: u16, data: &[u8]) -> Option<Self> {
        let byte_count = u8::try_from(data.len()).ok()?;
        Some(Self::from_parts(record_type, load_address, byte_count, data))
    }

    fn from_parts(record_type: RecordType, load_address: u16, byte_count: u8, data: &[u8]) -> Self {
        let mut record = Self {
            byte_count,
            load_address,
            record_type,
            data: data.to_vec(),
            checksum: 0,
        };
        record.checksum = record.expected_checksum();
        record
    }

    /// Data record, or `None` if `data` is longer than 255 bytes.
    pub fn data(load_address: u16, data: &[u8]) -> Option<Self> {
        Self::new(RecordType::Data, load_address, data)
    }

    /// End-of-file record.
    pub fn end_of_file() -> Self {
        Self::from_parts(RecordType::EndOfFile, 0, 0, &[])
    }

    /// Extended segment address record.
    pub fn extended_segment_address(segment: u16) -> Self {
        Self::from_parts(
            RecordType::ExtendedSegmentAddress,
            0,
            2,
            &segment.to_be_bytes(),
        )
    }

    /// Extended linear address record.
    pub fn extended_linear_address(upper: u16) -> Self {
        Self::from_parts(RecordType::ExtendedLinearAddress, 0, 2, &upper.to_be_bytes())
    }

    /// Start segment address record (CS:IP).
    pub fn start_segment_address(cs_ip: u32) -> Self {
        Self::from_parts(RecordType::StartSegmentAddress, 0, 4, &cs_ip.to_be_bytes())
    }

    /// Start linear address record.
    pub fn start_linear_address(address: u32) -> Self {
        Self::from_parts(RecordType::StartLinearAddress, 0, 4, &address.to_be_bytes())
    }

    /// Checksum computed from the record contents.
    pub fn expected_checksum(&self) -> u8 {
        checksum(
            self.byte_count,
            self.load_address,
            self.record_type as u8,
            &self.data,
        )
    }
}

impl fmt::Display for HexRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ":{:02X}{:04X}{:02X}",
            self.byte_count, self.load_address, self.record_type as u8
        )?;
        for byte in &self.data {
            write!(f, "{byte:02X}")?;
        }
        write!(f, "{:02X}", self.checksum)
    }
}

/// Two's complement of the byte sum of a record.
fn checksum(byte_count: u8, load_address: u16, record_type: u8, data: &[u8]) -> u8 {
    let [addr_hi, addr_lo] = load_address.to_be_bytes();
    let sum = data.iter().fold(
        byte_count
            .wrapping_add(addr_hi)
            .wrapping_add(addr_lo)
            .wrapping_add(record_type),
        |acc, b| acc.wrapping_add(*b),
    );
    sum.wrapping_neg()
}

/// Decoded firmware image.
///
/// `bytes[i]` is the content of flash address `i`. The image ends at the
/// highest address written by a data record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    bytes: Vec<u8>,
    start_segment_address: Option<u32>,
    start_linear_address: Option<u32>,
}

impl MemoryImage {
    /// Wrap a raw binary, starting at address 0.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            ..Self::default()
        }
    }

    /// Decode Intel HEX text for a device with `capacity` bytes of flash.
    pub fn from_ihex_str(text: &str, capacity: usize) -> std::result::Result<Self, ParseError> {
        parse(text, capacity)
    }

    /// Load and decode an Intel HEX file.
    pub fn from_file<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading Intel HEX from: {}", path.display());

        let raw = fs::read(path)?;
        let text =
            String::from_utf8(raw).map_err(|_| Error::Parse(ParseError::MalformedLine { line: 1 }))?;
        Ok(parse(&text, capacity)?)
    }

    /// Number of bytes up to and including the highest written address.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether no data record was present.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Image contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// CS:IP from a start segment address record, if present.
    pub fn start_segment_address(&self) -> Option<u32> {
        self.start_segment_address
    }

    /// Address from a start linear address record, if present.
    pub fn start_linear_address(&self) -> Option<u32> {
        self.start_linear_address
    }

    /// Number of `page_size` pages needed to hold the image.
    pub fn page_count(&self, page_size: usize) -> usize {
        if page_size == 0 {
            return 0;
        }
        self.bytes.len().div_ceil(page_size)
    }

    /// Payload of page `index`, padded with `0xFF` to exactly `page_size` bytes.
    pub fn page(&self, index: usize, page_size: usize) -> Option<Vec<u8>> {
        if index >= self.page_count(page_size) {
            return None;
        }
        let start = index * page_size;
        let end = (start + page_size).min(self.bytes.len());

        let mut page = Vec::with_capacity(page_size);
        page.extend_from_slice(&self.bytes[start..end]);
        page.resize(page_size, ERASED_BYTE);
        Some(page)
    }

    /// Count of bytes that differ from the erased value.
    pub fn programmed_bytes(&self) -> usize {
        self.bytes.iter().filter(|&&b| b != ERASED_BYTE).count()
    }
}

/// Decode Intel HEX text into a [`MemoryImage`].
///
/// `capacity` is the size of the device flash in bytes; data reaching past it
/// is rejected.
pub fn parse(text: &str, capacity: usize) -> std::result::Result<MemoryImage, ParseError> {
    let input = text.as_bytes();
    let mut reader = RecordReader { input, pos: 0 };

    let mut image = MemoryImage::default();
    let mut high_address: usize = 0;
    let mut line = 0;

    while input.len() - reader.pos >= MIN_RECORD_LEN {
        line += 1;
        let record = reader.next_record(line)?;
        trace!(
            "line {line}: {:?} @ {:#06x}, {} bytes",
            record.record_type, record.load_address, record.byte_count
        );

        match record.record_type {
            RecordType::Data => {
                let address = high_address + usize::from(record.load_address);
                let end = address + record.data.len();
                if end > capacity {
                    return Err(ParseError::AddressOutOfRange {
                        line,
                        address,
                        end,
                        capacity,
                    });
                }
                if end > image.bytes.len() {
                    image.bytes.resize(end, ERASED_BYTE);
                }
                image.bytes[address..end].copy_from_slice(&record.data);
            },
            RecordType::EndOfFile => {
                expect_len(&record, 0, line)?;
                debug!(
                    "Decoded {line} records, image is {} bytes",
                    image.bytes.len()
                );
                return Ok(image);
            },
            RecordType::ExtendedSegmentAddress => {
                expect_address_record(&record, 2, line)?;
                high_address = usize::from(BigEndian::read_u16(&record.data)) << 4;
            },
            RecordType::StartSegmentAddress => {
                expect_address_record(&record, 4, line)?;
                image.start_segment_address = Some(BigEndian::read_u32(&record.data));
            },
            RecordType::ExtendedLinearAddress => {
                expect_address_record(&record, 2, line)?;
                high_address = usize::from(BigEndian::read_u16(&record.data)) << 16;
            },
            RecordType::StartLinearAddress => {
                expect_address_record(&record, 4, line)?;
                image.start_linear_address = Some(BigEndian::read_u32(&record.data));
            },
        }

        reader.skip_line_ending();
    }

    Err(ParseError::MissingEndOfFile)
}

fn expect_len(record: &HexRecord, len: u8, line: usize) -> std::result::Result<(), ParseError> {
    if record.byte_count != len {
        return Err(ParseError::InvalidRecordLength {
            line,
            record_type: record.record_type as u8,
            byte_count: record.byte_count,
        });
    }
    Ok(())
}

fn expect_address_record(
    record: &HexRecord,
    len: u8,
    line: usize,
) -> std::result::Result<(), ParseError> {
    expect_len(record, len, line)?;
    if record.load_address != 0 {
        return Err(ParseError::NonZeroLoadAddress {
            line,
            record_type: record.record_type as u8,
            load_address: record.load_address,
        });
    }
    Ok(())
}

/// Cursor over the raw input.
struct RecordReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl RecordReader<'_> {
    /// Decode the record at the cursor and verify its checksum.
    fn next_record(&mut self, line: usize) -> std::result::Result<HexRecord, ParseError> {
        if self.input[self.pos] != b':' {
            return Err(ParseError::MalformedLine { line });
        }
        self.pos += 1;

        let byte_count = self.read_byte(line)?;
        let load_address = u16::from_be_bytes([self.read_byte(line)?, self.read_byte(line)?]);
        let raw_type = self.read_byte(line)?;
        let data = (0..byte_count)
            .map(|_| self.read_byte(line))
            .collect::<std::result::Result<Vec<u8>, _>>()?;
        let actual = self.read_byte(line)?;

        let expected = checksum(byte_count, load_address, raw_type, &data);
        if expected != actual {
            return Err(ParseError::ChecksumMismatch {
                line,
                expected,
                actual,
            });
        }

        let record_type = RecordType::try_from(raw_type).map_err(|record_type| {
            ParseError::UnknownRecordType { line, record_type }
        })?;

        Ok(HexRecord {
            byte_count,
            load_address,
            record_type,
            data,
            checksum: actual,
        })
    }

    /// Read one hex digit pair.
    fn read_byte(&mut self, line: usize) -> std::result::Result<u8, ParseError> {
        let pair = self
            .input
            .get(self.pos..self.pos + 2)
            .ok_or(ParseError::MalformedLine { line })?;
        let hi = hex_digit(pair[0]).ok_or(ParseError::MalformedLine { line })?;
        let lo = hex_digit(pair[1]).ok_or(ParseError::MalformedLine { line })?;
        self.pos += 2;
        Ok((hi << 4) | lo)
    }

    /// Consume an optional `\r` followed by an optional `\n`.
    fn skip_line_ending(&mut self) {
        if self.input.get(self.pos) == Some(&b'\r') {
            self.pos += 1;
        }
        if self.input.get(self.pos) == Some(&b'\n') {
            self.pos += 1;
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn hex_digit(c: u8) -> Option<u8> {
    // to_digit(16) is at most 15
    char::from(c).to_digit(16).map(|d| d as u8)
}
