//! Byte-stuffed framing.
//!
//! Frames are `START <payload> <crc_hi> <crc_lo> END`. Payload bytes equal to
//! one of the three markers are prefixed with [`FRAME_ESCAPE`]. The CRC covers
//! the unescaped payload only.
//!
//! Responses carry their CRC trailer raw, as the bootloader has always sent
//! it, so a response can only be decoded when its payload length is known.
//! Commands escape the trailer like any other byte.

use heapless::Vec;

use crate::crc::Crc16;
use crate::protocol::{FRAME_END, FRAME_ESCAPE, FRAME_START, RESPONSE_CAPACITY};

#[derive(Copy, Clone, Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds buffer capacity")]
    Overflow,

    #[error("CRC mismatch (computed 0x{expected:04x}, received 0x{actual:04x})")]
    Crc { expected: u16, actual: u16 },

    #[error("unexpected byte 0x{0:02x} in frame")]
    UnexpectedByte(u8),
}

/// Marker bytes that must be escaped inside a payload
pub fn is_reserved(byte: u8) -> bool {
    matches!(byte, FRAME_START | FRAME_END | FRAME_ESCAPE)
}

fn push<const N: usize>(out: &mut Vec<u8, N>, byte: u8) -> Result<(), FrameError> {
    out.push(byte).map_err(|_| FrameError::Overflow)
}

fn push_escaped<const N: usize>(out: &mut Vec<u8, N>, byte: u8) -> Result<(), FrameError> {
    if is_reserved(byte) {
        push(out, FRAME_ESCAPE)?;
    }
    push(out, byte)
}

/// Build a response frame into `out`, replacing its contents.
pub fn encode_response<const N: usize>(
    payload: &[u8],
    out: &mut Vec<u8, N>,
) -> Result<(), FrameError> {
    out.clear();
    push(out, FRAME_START)?;

    let mut crc = Crc16::new();
    for &b in payload {
        push_escaped(out, b)?;
        crc.update(b);
    }

    let [hi, lo] = crc.value().to_be_bytes();
    push(out, hi)?;
    push(out, lo)?;
    push(out, FRAME_END)
}

/// Build a command frame into `out`, replacing its contents.
pub fn encode_command<const N: usize>(
    payload: &[u8],
    out: &mut Vec<u8, N>,
) -> Result<(), FrameError> {
    out.clear();
    push(out, FRAME_START)?;

    let mut crc = Crc16::new();
    for &b in payload {
        push_escaped(out, b)?;
        crc.update(b);
    }
    for &b in crc.value().to_be_bytes().iter() {
        push_escaped(out, b)?;
    }

    push(out, FRAME_END)
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum DecodeState {
    Start,
    Payload,
    Escaped,
    CrcHi,
    CrcLo(u8),
    End,
    Done,
}

/// Incremental decoder for a response frame of known payload length.
#[derive(Clone, Debug)]
pub struct ResponseDecoder {
    state: DecodeState,
    expected: usize,
    crc: Crc16,
    payload: Vec<u8, RESPONSE_CAPACITY>,
}

impl ResponseDecoder {
    pub fn new(expected: usize) -> Self {
        Self {
            state: DecodeState::Start,
            expected,
            crc: Crc16::new(),
            payload: Vec::new(),
        }
    }

    /// Feed one received byte, returns `true` once the frame is complete.
    ///
    /// Bytes ahead of the start marker are skipped.
    pub fn push(&mut self, byte: u8) -> Result<bool, FrameError> {
        match self.state {
            DecodeState::Start => {
                if byte == FRAME_START {
                    self.state = self.after_payload_byte();
                } else {
                    trace!("skipping 0x{:02x} ahead of frame", byte);
                }
            }
            DecodeState::Payload => match byte {
                FRAME_ESCAPE => self.state = DecodeState::Escaped,
                FRAME_START | FRAME_END => return Err(FrameError::UnexpectedByte(byte)),
                _ => self.accept(byte)?,
            },
            DecodeState::Escaped => self.accept(byte)?,
            DecodeState::CrcHi => self.state = DecodeState::CrcLo(byte),
            DecodeState::CrcLo(hi) => {
                let actual = u16::from_be_bytes([hi, byte]);
                if actual != self.crc.value() {
                    return Err(FrameError::Crc {
                        expected: self.crc.value(),
                        actual,
                    });
                }
                self.state = DecodeState::End;
            }
            DecodeState::End => {
                if byte != FRAME_END {
                    return Err(FrameError::UnexpectedByte(byte));
                }
                self.state = DecodeState::Done;
            }
            DecodeState::Done => (),
        }

        Ok(self.state == DecodeState::Done)
    }

    fn accept(&mut self, byte: u8) -> Result<(), FrameError> {
        self.payload.push(byte).map_err(|_| FrameError::Overflow)?;
        self.crc.update(byte);
        self.state = self.after_payload_byte();
        Ok(())
    }

    fn after_payload_byte(&self) -> DecodeState {
        if self.payload.len() < self.expected {
            DecodeState::Payload
        } else {
            DecodeState::CrcHi
        }
    }

    /// Decoded payload (complete once [`push`](Self::push) has returned `true`)
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
