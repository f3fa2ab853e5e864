//! Serial Intel-HEX bootloader.
//!
//! The device side is a cooperative [`Session`] that receives byte-stuffed
//! command frames, accepts an Intel HEX image record by record, writes it
//! through an [`Nvm`] controller and hands off to the application. The host
//! side is a [`Programmer`] speaking the same protocol over a serial port.
//!
//! Command frame: `0x01 <opcode> [crc_hi crc_lo] 0x04`, escaped.
//! Response frame: `0x01 <payload> <crc_hi> <crc_lo> 0x04`, payload escaped.

use core::fmt::Write as FmtWrite;
use core::marker::PhantomData;
use core::str::FromStr;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod crc;
pub mod framing;
pub mod ihex;
pub mod nvm;
pub mod protocol;
pub mod session;
pub mod transport;

pub use framing::FrameError;
pub use ihex::{HexError, HexRecord, RecordType};
pub use nvm::{EraseRegion, MemoryFlash, Nvm, OpStatus};
pub use protocol::Opcode;
pub use session::{Launcher, Session, State};
pub use transport::{HalSerial, MemoryLink, Transport};

use protocol::*;

/// Escaped command frames never exceed this
const COMMAND_FRAME_MAX: usize = 32;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: core::fmt::Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("bootloader reported failure")]
    Nack,

    #[error("timed out awaiting response")]
    ResponseTimeout,

    #[error("unexpected response")]
    InvalidResponse,

    #[error("framing error: {0}")]
    Frame(FrameError),
}

impl<SerialError: core::fmt::Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// Parse an address or count, accepting a `0x` prefix for hex
pub fn parse_address(s: &str) -> Result<u32, core::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    }
}

/// Whether command frames must carry a valid CRC trailer.
///
/// The trailer is the big-endian CRC-16 of the unescaped payload bytes,
/// opcode onward; the start and end markers are not covered.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum CommandCrc {
    /// Dispatch frames whether or not they carry a CRC
    Ignore,
    /// Drop frames without a valid CRC trailer
    Enforce,
}

impl Default for CommandCrc {
    fn default() -> Self {
        CommandCrc::Ignore
    }
}

impl FromStr for CommandCrc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(CommandCrc::Ignore),
            "enforce" => Ok(CommandCrc::Enforce),
            other => Err(format!("unknown CRC policy '{}' (expected ignore or enforce)", other)),
        }
    }
}

/// Device-side bootloader configuration
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Config {
    /// First programmable flash address
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x9D000000", parse(try_from_str = parse_address)))]
    pub flash_start: u32,

    /// Last programmable flash address (inclusive)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x9D07FFFF", parse(try_from_str = parse_address)))]
    pub flash_end: u32,

    /// Offset added to HEX addresses to reach the programming address space
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x80000000", parse(try_from_str = parse_address)))]
    pub image_offset: u32,

    /// Application entry point
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x9D00F000", parse(try_from_str = parse_address)))]
    pub entry_point: u32,

    /// First block cleared by the erase command
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0", parse(try_from_str = parse_address)))]
    pub erase_block: u32,

    /// Number of blocks cleared by the erase command
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "512", parse(try_from_str = parse_address)))]
    pub erase_blocks: u32,

    /// Command frame CRC policy (ignore, enforce)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "ignore"))]
    pub command_crc: CommandCrc,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flash_start: 0x9D00_0000,
            flash_end: 0x9D07_FFFF,
            image_offset: 0x8000_0000,
            entry_point: 0x9D00_F000,
            erase_block: 0,
            erase_blocks: 512,
            command_crc: CommandCrc::Ignore,
        }
    }
}

impl Config {
    /// True if a word may be programmed at `address`
    pub fn in_flash(&self, address: u32) -> bool {
        self.flash_start <= address && address <= self.flash_end
    }

    pub fn erase_region(&self) -> EraseRegion {
        EraseRegion {
            first_block: self.erase_block,
            blocks: self.erase_blocks,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for an erase to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for the bootloader to start after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub init_delay_ms: u32,

    /// Pause after each HEX record, for links without flow control
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub line_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 100,
            erase_timeout_ms: 5000,
            poll_delay_ms: 1,
            init_delay_ms: 100,
            line_delay_ms: 0,
        }
    }
}

/// Host-side client for the bootloader
pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Reset the device and confirm the bootloader answers, returning its version
    pub fn init(&mut self) -> Result<u16, Error<E>> {
        if !self.options.no_reset {
            self.reset()?;
        }

        debug!("Querying bootloader version");
        let version = self.version()?;
        debug!("Bootloader version 0x{:04x}", version);

        Ok(version)
    }

    /// Pulse DTR/RTS to reset the device into its bootloader
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;

        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    pub fn version(&mut self) -> Result<u16, Error<E>> {
        let timeout = self.options.response_timeout_ms;
        let resp = self.transact(Opcode::Version, 3, timeout)?;

        match resp.as_slice() {
            &[RESP_VERSION, hi, lo] => Ok(u16::from_be_bytes([hi, lo])),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Erase the application flash, waiting for the device to finish
    pub fn erase(&mut self) -> Result<(), Error<E>> {
        debug!("Erasing application flash");

        let timeout = self.options.erase_timeout_ms;
        let resp = self.transact(Opcode::Erase, 1, timeout)?;

        match resp.as_slice() {
            [RESP_ERASED] => Ok(()),
            [RESP_FAILURE] => Err(Error::Nack),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Enter program mode and stream `records`.
    ///
    /// An end of file record is sent after the last record if the image
    /// does not end with one, returning the device to command mode.
    pub fn program<'a, I, F>(&mut self, records: I, mut progress: F) -> Result<(), Error<E>>
    where
        I: IntoIterator<Item = &'a HexRecord>,
        F: FnMut(&HexRecord),
    {
        let timeout = self.options.response_timeout_ms;
        let resp = self.transact(Opcode::Program, 1, timeout)?;
        if !matches!(resp.as_slice(), [RESP_PROGRAM_ACK]) {
            return Err(Error::InvalidResponse);
        }

        let mut terminated = false;
        for record in records {
            self.send_record(record)?;
            progress(record);

            if record.kind == RecordType::EndOfFile {
                terminated = true;
                break;
            }
        }

        if !terminated {
            debug!("Appending end of file record");
            self.send_record(&HexRecord::end_of_file())?;
        }

        Ok(())
    }

    /// Start the application. The bootloader does not answer.
    pub fn jump(&mut self) -> Result<(), Error<E>> {
        debug!("Jumping to application");
        self.send_command(&[Opcode::Jump as u8])
    }

    /// Send an arbitrary command payload, reading a response of `response_len` bytes
    pub fn raw(
        &mut self,
        payload: &[u8],
        response_len: usize,
    ) -> Result<heapless::Vec<u8, RESPONSE_CAPACITY>, Error<E>> {
        self.send_command(payload)?;
        if response_len == 0 {
            return Ok(heapless::Vec::new());
        }

        let timeout = self.options.response_timeout_ms;
        self.await_response(response_len, timeout)
    }

    fn transact(
        &mut self,
        opcode: Opcode,
        response_len: usize,
        timeout_ms: u32,
    ) -> Result<heapless::Vec<u8, RESPONSE_CAPACITY>, Error<E>> {
        self.send_command(&[opcode as u8])?;
        self.await_response(response_len, timeout_ms)
    }

    fn send_command(&mut self, payload: &[u8]) -> Result<(), Error<E>> {
        let mut frame = heapless::Vec::<u8, COMMAND_FRAME_MAX>::new();
        framing::encode_command(payload, &mut frame).map_err(Error::Frame)?;

        trace!("Sending command {:02x?}", &frame[..]);
        self.write_all(&frame)
    }

    fn send_record(&mut self, record: &HexRecord) -> Result<(), Error<E>> {
        let mut line = heapless::String::<{ ihex::LINE_CAPACITY }>::new();
        write!(line, "{}", record).map_err(|_| Error::Frame(FrameError::Overflow))?;

        trace!("Sending {}", line);
        self.write_all(line.as_bytes())?;
        self.write_all(&[ihex::LINE_END])?;

        if self.options.line_delay_ms > 0 {
            self.delay.delay_ms(self.options.line_delay_ms);
        }

        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error<E>> {
        for &b in bytes {
            block!(self.port.write(b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    fn await_response(
        &mut self,
        response_len: usize,
        timeout_ms: u32,
    ) -> Result<heapless::Vec<u8, RESPONSE_CAPACITY>, Error<E>> {
        let mut decoder = framing::ResponseDecoder::new(response_len);
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => {
                    if decoder.push(v).map_err(Error::Frame)? {
                        debug!("Received response {:02x?}", decoder.payload());
                        return heapless::Vec::from_slice(decoder.payload())
                            .map_err(|_| Error::Frame(FrameError::Overflow));
                    }
                    continue;
                }
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);

            if t > timeout_ms {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }
}
