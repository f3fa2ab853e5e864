//! Byte link between the bootloader and its host.

use std::collections::VecDeque;

use embedded_hal::serial::{Read, Write};

/// Byte source/sink driven by the session.
pub trait Transport {
    type Error: core::fmt::Debug;

    /// True if [`read_byte`](Transport::read_byte) will not block.
    fn byte_available(&mut self) -> Result<bool, Self::Error>;

    /// Consume one byte.
    fn read_byte(&mut self) -> Result<u8, Self::Error>;

    fn write_byte(&mut self, byte: u8) -> Result<(), Self::Error>;
}

/// [`Transport`] over an embedded-hal serial port.
///
/// `byte_available` performs a non-blocking read and holds on to the byte
/// until it is consumed.
pub struct HalSerial<S> {
    inner: S,
    peeked: Option<u8>,
}

impl<S> HalSerial<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, peeked: None }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, E> Transport for HalSerial<S>
where
    S: Read<u8, Error = E> + Write<u8, Error = E>,
    E: core::fmt::Debug,
{
    type Error = E;

    fn byte_available(&mut self) -> Result<bool, E> {
        if self.peeked.is_some() {
            return Ok(true);
        }

        match self.inner.read() {
            Ok(b) => {
                self.peeked = Some(b);
                Ok(true)
            }
            Err(nb::Error::WouldBlock) => Ok(false),
            Err(nb::Error::Other(e)) => Err(e),
        }
    }

    fn read_byte(&mut self) -> Result<u8, E> {
        match self.peeked.take() {
            Some(b) => Ok(b),
            None => block!(self.inner.read()),
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), E> {
        block!(self.inner.write(byte))
    }
}

/// In-memory link: bytes fed by the host side, bytes written by the device.
#[derive(Clone, Debug, Default)]
pub struct MemoryLink {
    rx: VecDeque<u8>,
    tx: std::vec::Vec<u8>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the device to read
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Bytes not yet read by the device
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Drain everything the device has written
    pub fn take_output(&mut self) -> std::vec::Vec<u8> {
        core::mem::take(&mut self.tx)
    }
}

impl Transport for MemoryLink {
    type Error = core::convert::Infallible;

    fn byte_available(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.rx.is_empty())
    }

    fn read_byte(&mut self) -> Result<u8, Self::Error> {
        // callers check byte_available first; an empty read yields a byte
        // the session ignores outside a frame
        Ok(self.rx.pop_front().unwrap_or(0))
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), Self::Error> {
        self.tx.push(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// embedded-hal serial stub delivering scripted reads
    struct Scripted {
        reads: VecDeque<nb::Result<u8, ()>>,
        written: std::vec::Vec<u8>,
    }

    impl Read<u8> for Scripted {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            self.reads.pop_front().unwrap_or(Err(nb::Error::WouldBlock))
        }
    }

    impl Write<u8> for Scripted {
        type Error = ();

        fn write(&mut self, word: u8) -> nb::Result<(), ()> {
            self.written.push(word);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    #[test]
    fn hal_serial_peeks_without_losing_bytes() {
        let reads = vec![
            Err(nb::Error::WouldBlock),
            Ok(0x3a),
            Ok(0x30),
            Err(nb::Error::Other(())),
        ];
        let mut s = HalSerial::new(Scripted {
            reads: reads.into_iter().collect(),
            written: vec![],
        });

        assert_eq!(s.byte_available(), Ok(false));
        assert_eq!(s.byte_available(), Ok(true));
        assert_eq!(s.byte_available(), Ok(true));
        assert_eq!(s.read_byte(), Ok(0x3a));
        assert_eq!(s.read_byte(), Ok(0x30));
        assert_eq!(s.byte_available(), Err(()));

        s.write_byte(0x04).unwrap();
        assert_eq!(s.into_inner().written, vec![0x04]);
    }

    #[test]
    fn memory_link_round_trip() {
        let mut link = MemoryLink::new();
        link.feed(&[1, 2]);
        assert_eq!(link.pending(), 2);
        assert_eq!(link.byte_available(), Ok(true));
        assert_eq!(link.read_byte(), Ok(1));
        assert_eq!(link.read_byte(), Ok(2));
        assert_eq!(link.byte_available(), Ok(false));

        link.write_byte(9).unwrap();
        assert_eq!(link.take_output(), vec![9]);
        assert!(link.take_output().is_empty());
    }
}
