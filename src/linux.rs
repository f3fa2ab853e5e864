use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{HalSerial, Options, Programmer, SerialPort};

/// Read timeout for the device-side transport, keeps ticks short
const TRANSPORT_TIMEOUT: Duration = Duration::from_millis(1);

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(|e| IoError::from(e).kind())
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(|e| IoError::from(e).kind())
    }
}

/// Open a serial port as 8N1 without flow control
fn open<P: AsRef<Path>>(port: P, baud: usize, timeout: Duration) -> Result<Serial, SerialError> {
    // Open port
    let mut port = Serial::open(port.as_ref())?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)?;
    port.0.set_timeout(timeout)?;

    Ok(port)
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        let timeout = Duration::from_millis(options.poll_delay_ms.max(1) as u64);
        let port = open(port, baud, timeout)?;

        Ok(Self::new(port, Delay {}, options))
    }
}

/// Open a linux serial port as the device side of the link
pub fn transport<P: AsRef<Path>>(port: P, baud: usize) -> Result<HalSerial<Serial>, SerialError> {
    let port = open(port, baud, TRANSPORT_TIMEOUT)?;

    Ok(HalSerial::new(port))
}
