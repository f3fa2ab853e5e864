//! Device-side protocol engine.
//!
//! A [`Session`] is advanced by calling [`Session::tick`] from the device's
//! main loop. While receiving, a tick drains every byte the transport has
//! ready; while erasing or sending a response it does one unit of work
//! (a status poll or a single byte) and returns.

use core::convert::TryFrom;

use heapless::Vec;

use crate::crc::Crc16;
use crate::framing::encode_response;
use crate::ihex::{HexRecord, RecordType, LINE_CAPACITY, LINE_END, LINE_START};
use crate::nvm::{Nvm, OpStatus};
use crate::protocol::*;
use crate::transport::Transport;
use crate::{CommandCrc, Config, Error};

/// Hands control to the application image.
pub trait Launcher {
    /// Jump to `entry_point`. Does not return when the jump succeeds.
    fn launch(&mut self, entry_point: u32);
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    WaitForCommand,
    ReadingCommand,
    ReadingCommandEscaped,
    WaitForHexRecord,
    WaitForHexRecordEscaped,
    ReadingHexRecord,
    ReadingHexRecordEscaped,
    Erasing,
    SendingResponse,
    /// Application returned control; nothing further is processed
    Halted,
}

impl State {
    fn is_receiving(self) -> bool {
        !matches!(self, State::Erasing | State::SendingResponse | State::Halted)
    }
}

/// Device side of the protocol.
///
/// The command CRC accumulates over unescaped payload bytes only, so a
/// frame passes [`CommandCrc::Enforce`] when the opcode and its big-endian
/// CRC-16 trailer fold to zero.
pub struct Session<T, N: Nvm, L> {
    config: Config,
    transport: T,
    nvm: N,
    launcher: L,

    state: State,
    command: Vec<u8, COMMAND_CAPACITY>,
    crc: Crc16,

    line: Vec<u8, LINE_CAPACITY>,
    hex_base_address: u32,

    response: Vec<u8, RESPONSE_CAPACITY>,
    cursor: usize,
    resume: State,

    erase: Option<N::Handle>,
}

impl<T, N, L> Session<T, N, L>
where
    T: Transport,
    N: Nvm,
    L: Launcher,
{
    /// Create a new session waiting for a command
    pub fn new(transport: T, nvm: N, launcher: L, config: Config) -> Self {
        Self {
            config,
            transport,
            nvm,
            launcher,
            state: State::WaitForCommand,
            command: Vec::new(),
            crc: Crc16::new(),
            line: Vec::new(),
            hex_base_address: 0,
            response: Vec::new(),
            cursor: 0,
            resume: State::WaitForCommand,
            erase: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state == State::Halted
    }

    /// Upper address latched by the last extended linear address record
    pub fn hex_base_address(&self) -> u32 {
        self.hex_base_address
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn nvm(&self) -> &N {
        &self.nvm
    }

    /// Tear down the session, returning its collaborators
    pub fn release(self) -> (T, N, L) {
        (self.transport, self.nvm, self.launcher)
    }

    /// Advance the state machine
    pub fn tick(&mut self) -> Result<(), Error<T::Error>> {
        match self.state {
            State::Halted => (),
            State::SendingResponse => self.send_next()?,
            State::Erasing => self.poll_erase(),
            _ => {
                while self.state.is_receiving() && self.transport.byte_available()? {
                    let byte = self.transport.read_byte()?;
                    self.receive(byte);
                }
            }
        }

        Ok(())
    }

    fn receive(&mut self, byte: u8) {
        trace!("rx 0x{:02x} in {:?}", byte, self.state);

        match self.state {
            State::WaitForCommand => {
                if byte == FRAME_START {
                    self.begin_command();
                }
            }
            State::ReadingCommand => match byte {
                FRAME_ESCAPE => self.state = State::ReadingCommandEscaped,
                FRAME_END => {
                    if self.store_command(byte, false) {
                        self.dispatch();
                    }
                }
                b if self.is_program_shortcut(b) => {
                    if self.store_command(b, true) {
                        self.enter_program_mode();
                    }
                }
                b => {
                    self.store_command(b, true);
                }
            },
            State::ReadingCommandEscaped => {
                if self.store_command(byte, true) {
                    self.state = State::ReadingCommand;
                }
            }
            State::WaitForHexRecord => match byte {
                LINE_START => self.begin_line(),
                FRAME_ESCAPE => self.state = State::WaitForHexRecordEscaped,
                _ => (),
            },
            State::WaitForHexRecordEscaped => {
                if byte == LINE_START {
                    self.begin_line();
                } else {
                    self.state = State::WaitForHexRecord;
                }
            }
            State::ReadingHexRecord => match byte {
                FRAME_ESCAPE => self.state = State::ReadingHexRecordEscaped,
                LINE_END => self.apply_line(),
                b => self.store_line(b),
            },
            State::ReadingHexRecordEscaped => {
                self.state = State::ReadingHexRecord;
                self.store_line(byte);
            }
            State::Erasing | State::SendingResponse | State::Halted => {
                warn!("byte 0x{:02x} received in {:?}, ignoring", byte, self.state)
            }
        }
    }

    /// Opcode 0x03 as the first byte after the start marker enters program
    /// mode without waiting for the rest of the frame.
    fn is_program_shortcut(&self, byte: u8) -> bool {
        byte == Opcode::Program as u8
            && self.command.len() == 1
            && self.config.command_crc == CommandCrc::Ignore
    }

    fn begin_command(&mut self) {
        self.command.clear();
        self.crc.reset();
        // capacity is never zero, the start marker always fits
        let _ = self.command.push(FRAME_START);
        self.state = State::ReadingCommand;
    }

    /// Append to the command buffer, dropping the frame on overflow.
    fn store_command(&mut self, byte: u8, covered: bool) -> bool {
        if self.command.push(byte).is_err() {
            warn!("command frame exceeds {} bytes, discarding", COMMAND_CAPACITY);
            self.wait_for_command();
            return false;
        }
        if covered {
            self.crc.update(byte);
        }
        true
    }

    fn wait_for_command(&mut self) {
        self.command.clear();
        self.crc.reset();
        self.state = State::WaitForCommand;
    }

    fn dispatch(&mut self) {
        // start and end markers bracket the payload
        let payload = &self.command[1..self.command.len() - 1];

        if self.config.command_crc == CommandCrc::Enforce
            && (payload.len() < 3 || self.crc.value() != 0)
        {
            warn!("command frame {:02x?} failed CRC check, discarding", payload);
            self.wait_for_command();
            return;
        }

        let opcode = match payload.first() {
            Some(&op) => op,
            None => {
                debug!("empty command frame");
                self.wait_for_command();
                return;
            }
        };

        debug!("dispatching opcode 0x{:02x}", opcode);

        match Opcode::try_from(opcode) {
            Ok(Opcode::Version) => {
                let [hi, lo] = BOOTLOADER_VERSION.to_be_bytes();
                self.respond(&[RESP_VERSION, hi, lo], State::WaitForCommand);
            }
            Ok(Opcode::Erase) => self.begin_erase(),
            Ok(Opcode::Program) => self.enter_program_mode(),
            Ok(Opcode::ReadCrc) => {
                warn!("read CRC command is reserved, not answering");
                self.wait_for_command();
            }
            Ok(Opcode::Jump) => self.launch(),
            Err(op) => {
                warn!("unknown opcode 0x{:02x}, not answering", op);
                self.wait_for_command();
            }
        }
    }

    fn begin_erase(&mut self) {
        let region = self.config.erase_region();

        match self.nvm.begin_erase(region) {
            Ok(handle) => {
                info!("erasing {:?}", region);
                self.erase = Some(handle);
                self.state = State::Erasing;
            }
            Err(e) => {
                warn!("erase request rejected: {:?}", e);
                self.respond(&[RESP_FAILURE], State::WaitForCommand);
            }
        }
    }

    fn poll_erase(&mut self) {
        let handle = match self.erase {
            Some(h) => h,
            None => {
                error!("erasing without an operation in flight");
                self.wait_for_command();
                return;
            }
        };

        match self.nvm.poll_status(handle) {
            OpStatus::Pending => (),
            OpStatus::Completed => {
                info!("erase complete");
                self.erase = None;
                self.respond(&[RESP_ERASED], State::WaitForCommand);
            }
            OpStatus::Error => {
                warn!("erase {:?} failed", handle);
                self.erase = None;
                self.respond(&[RESP_FAILURE], State::WaitForCommand);
            }
        }
    }

    fn enter_program_mode(&mut self) {
        debug!("entering program mode");
        self.hex_base_address = 0;
        self.line.clear();
        self.respond(&[RESP_PROGRAM_ACK], State::WaitForHexRecord);
    }

    fn launch(&mut self) {
        info!("jumping to application at 0x{:08x}", self.config.entry_point);
        self.launcher.launch(self.config.entry_point);

        error!("application returned, halting");
        self.state = State::Halted;
    }

    /// Queue a framed response, entering `resume` once it is sent.
    fn respond(&mut self, payload: &[u8], resume: State) {
        self.cursor = 0;
        self.resume = resume;

        match encode_response(payload, &mut self.response) {
            Ok(()) => self.state = State::SendingResponse,
            Err(e) => {
                error!("cannot frame response {:02x?}: {}", payload, e);
                self.finish_response();
            }
        }
    }

    fn send_next(&mut self) -> Result<(), T::Error> {
        if let Some(&byte) = self.response.get(self.cursor) {
            self.transport.write_byte(byte)?;
            self.cursor += 1;
        }

        if self.cursor >= self.response.len() {
            self.finish_response();
        }

        Ok(())
    }

    fn finish_response(&mut self) {
        self.response.clear();
        self.cursor = 0;
        self.command.clear();
        self.crc.reset();
        self.state = self.resume;
    }

    fn begin_line(&mut self) {
        self.line.clear();
        self.state = State::ReadingHexRecord;
    }

    fn store_line(&mut self, byte: u8) {
        if self.line.push(byte).is_err() {
            warn!("HEX line exceeds {} characters, discarding", LINE_CAPACITY);
            self.line.clear();
            self.state = State::WaitForHexRecord;
        }
    }

    fn apply_line(&mut self) {
        let decoded = HexRecord::decode(&self.line);
        self.line.clear();
        self.state = State::WaitForHexRecord;

        let record = match decoded {
            Ok(r) => r,
            Err(e) => {
                warn!("discarding HEX line: {}", e);
                return;
            }
        };

        if !record.verify() {
            warn!(
                "discarding HEX record at 0x{:04x}: checksum mismatch",
                record.address
            );
            return;
        }

        match record.kind {
            RecordType::Data => self.program(&record),
            RecordType::ExtendedLinearAddress => match record.upper_address() {
                Some(base) => {
                    debug!("base address 0x{:08x}", base);
                    self.hex_base_address = base;
                }
                None => warn!(
                    "discarding extended linear address record with {} data bytes",
                    record.length
                ),
            },
            RecordType::EndOfFile => {
                info!("end of HEX image");
                self.wait_for_command();
            }
            RecordType::Other(t) => debug!("ignoring HEX record type 0x{:02x}", t),
        }
    }

    /// Program a data record word by word, padding the tail with 0xFF.
    fn program(&mut self, record: &HexRecord) {
        let target = self
            .config
            .image_offset
            .wrapping_add(self.hex_base_address)
            .wrapping_add(record.address as u32);

        for (i, chunk) in record.data().chunks(WORD_SIZE).enumerate() {
            let address = target.wrapping_add((i * WORD_SIZE) as u32);
            if !self.config.in_flash(address) {
                trace!("skipping 0x{:08x}, outside flash", address);
                continue;
            }

            let mut word = [0xff; WORD_SIZE];
            word[..chunk.len()].copy_from_slice(chunk);

            trace!("programming 0x{:08x} <- {:02x?}", address, word);
            self.nvm.program_word(address, word);
            while !self.nvm.write_cycle_complete() {
                core::hint::spin_loop();
            }
            if self.nvm.clear_latched_error() {
                warn!("write error at 0x{:08x}", address);
            }
        }
    }
}
