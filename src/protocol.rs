//! Wire constants shared by the device session and the host programmer.

use core::convert::TryFrom;

/// Frame start marker
pub const FRAME_START: u8 = 0x01;
/// Frame end marker
pub const FRAME_END: u8 = 0x04;
/// Escape prefix for marker bytes inside a frame
pub const FRAME_ESCAPE: u8 = 0x10;

/// Bootloader version reported by [`Opcode::Version`]
pub const BOOTLOADER_VERSION: u16 = 0x0001;

/// Tag leading a version response
pub const RESP_VERSION: u8 = 0x01;
/// Erase completed
pub const RESP_ERASED: u8 = 0x02;
/// Program mode entered
pub const RESP_PROGRAM_ACK: u8 = 0x03;
/// Erase rejected or failed
pub const RESP_FAILURE: u8 = 0xFF;

/// Command frame capacity: start, opcode, two CRC bytes, end
pub const COMMAND_CAPACITY: usize = 5;

/// Response frame capacity
pub const RESPONSE_CAPACITY: usize = 10;

/// Flash word width in bytes
pub const WORD_SIZE: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Opcode {
    /// Fetch the bootloader version
    Version = 0x01,

    /// Start an asynchronous erase of the application flash
    Erase = 0x02,

    /// Enter program mode; HEX records follow
    Program = 0x03,

    /// Read back the application CRC (reserved, not answered)
    ReadCrc = 0x04,

    /// Jump to the application entry point
    Jump = 0x05,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x01 => Ok(Opcode::Version),
            0x02 => Ok(Opcode::Erase),
            0x03 => Ok(Opcode::Program),
            0x04 => Ok(Opcode::ReadCrc),
            0x05 => Ok(Opcode::Jump),
            other => Err(other),
        }
    }
}
