//! Intel HEX record codec.
//!
//! Lines are handled without their leading `:`. Decoding is positional:
//! length, big-endian address, type, `length` data bytes, checksum, each
//! as a pair of ASCII hex digits.

use core::fmt;

/// Maximum data bytes per record accepted by the bootloader
pub const MAX_DATA_LEN: usize = 16;

/// Capacity of the line buffer holding one record's ASCII digits
pub const LINE_CAPACITY: usize = 2 * (6 + MAX_DATA_LEN);

/// Line start marker
pub const LINE_START: u8 = b':';

/// Line terminator
pub const LINE_END: u8 = b'\n';

/// Record length + address + type + checksum
const OVERHEAD: usize = 5;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedLinearAddress,
    /// Valid HEX type the bootloader does not act on
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(v: u8) -> Self {
        match v {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x04 => RecordType::ExtendedLinearAddress,
            other => RecordType::Other(other),
        }
    }
}

impl From<RecordType> for u8 {
    fn from(t: RecordType) -> u8 {
        match t {
            RecordType::Data => 0x00,
            RecordType::EndOfFile => 0x01,
            RecordType::ExtendedLinearAddress => 0x04,
            RecordType::Other(v) => v,
        }
    }
}

/// Faults in the ASCII form of a record, reported separately from checksum
/// mismatches (see [`HexRecord::verify`]).
#[derive(Copy, Clone, Debug, PartialEq, thiserror::Error)]
pub enum HexError {
    #[error("invalid hex digit 0x{byte:02x} at position {position}")]
    InvalidDigit { position: usize, byte: u8 },

    #[error("record truncated")]
    Truncated,

    #[error("record declares {0} data bytes (max 16)")]
    TooLong(usize),

    #[error("unexpected characters after checksum")]
    TrailingData,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct HexRecord {
    pub length: u8,
    pub address: u16,
    pub kind: RecordType,
    pub data: [u8; MAX_DATA_LEN],
    pub checksum: u8,
}

fn digit(line: &[u8], position: usize) -> Result<u8, HexError> {
    let byte = *line.get(position).ok_or(HexError::Truncated)?;
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(HexError::InvalidDigit { position, byte }),
    }
}

fn pair(line: &[u8], index: usize) -> Result<u8, HexError> {
    Ok(digit(line, 2 * index)? << 4 | digit(line, 2 * index + 1)?)
}

impl HexRecord {
    /// Build a record with a correct checksum.
    pub fn new(kind: RecordType, address: u16, data: &[u8]) -> Result<Self, HexError> {
        if data.len() > MAX_DATA_LEN {
            return Err(HexError::TooLong(data.len()));
        }

        let mut record = Self {
            length: data.len() as u8,
            address,
            kind,
            data: [0u8; MAX_DATA_LEN],
            checksum: 0,
        };
        record.data[..data.len()].copy_from_slice(data);
        record.checksum = record.sum().wrapping_neg();

        Ok(record)
    }

    /// End of file record
    pub fn end_of_file() -> Self {
        Self {
            length: 0,
            address: 0,
            kind: RecordType::EndOfFile,
            data: [0u8; MAX_DATA_LEN],
            checksum: 0xff,
        }
    }

    /// Decode one ASCII line (without the leading `:`).
    ///
    /// A single trailing `\r` is tolerated so CRLF images can be streamed
    /// unchanged.
    pub fn decode(line: &[u8]) -> Result<Self, HexError> {
        let length = pair(line, 0)?;
        if length as usize > MAX_DATA_LEN {
            return Err(HexError::TooLong(length as usize));
        }

        let address = u16::from_be_bytes([pair(line, 1)?, pair(line, 2)?]);
        let kind = RecordType::from(pair(line, 3)?);

        let mut data = [0u8; MAX_DATA_LEN];
        for (i, d) in data.iter_mut().take(length as usize).enumerate() {
            *d = pair(line, 4 + i)?;
        }
        let checksum = pair(line, 4 + length as usize)?;

        match &line[2 * (OVERHEAD + length as usize)..] {
            [] | [b'\r'] => (),
            _ => return Err(HexError::TrailingData),
        }

        Ok(Self {
            length,
            address,
            kind,
            data,
            checksum,
        })
    }

    /// Data bytes carried by the record
    pub fn data(&self) -> &[u8] {
        &self.data[..(self.length as usize).min(MAX_DATA_LEN)]
    }

    fn sum(&self) -> u8 {
        let [hi, lo] = self.address.to_be_bytes();
        let header: [u8; 4] = [self.length, hi, lo, self.kind.into()];
        header
            .iter()
            .chain(self.data())
            .fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    /// True when all fields including the checksum sum to zero mod 256.
    pub fn verify(&self) -> bool {
        self.sum().wrapping_add(self.checksum) == 0
    }

    /// Upper 16 address bits carried by an extended linear address record
    pub fn upper_address(&self) -> Option<u32> {
        match (self.kind, self.data()) {
            (RecordType::ExtendedLinearAddress, &[hi, lo]) => {
                Some((hi as u32) << 24 | (lo as u32) << 16)
            }
            _ => None,
        }
    }
}

impl fmt::Display for HexRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, ":{:02X}{:04X}{:02X}", self.length, self.address, u8::from(self.kind))?;
        for b in self.data() {
            write!(f, "{:02X}", b)?;
        }
        write!(f, "{:02X}", self.checksum)
    }
}
