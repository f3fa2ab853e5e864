//! Host programmer driving an in-process bootloader session.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use hexboot::{
    CommandCrc, Config, Error, HexRecord, Launcher, MemoryFlash, MemoryLink, Options, Programmer,
    RecordType, SerialPort, Session, State,
};

const FLASH_BASE: u32 = 0x9D00_0000;
const FLASH_SIZE: usize = 0x1_0000;

/// Device ticks run each time the host finds nothing to read
const TICKS_PER_POLL: usize = 16;

struct Handoff(Rc<Cell<Option<u32>>>);

impl Launcher for Handoff {
    fn launch(&mut self, entry_point: u32) {
        self.0.set(Some(entry_point));
    }
}

type Device = Session<MemoryLink, MemoryFlash, Handoff>;

/// Serial port wired straight into a device session
struct Wire {
    device: Rc<RefCell<Device>>,
    rx: VecDeque<u8>,
}

impl Read<u8> for Wire {
    type Error = ();

    fn read(&mut self) -> nb::Result<u8, ()> {
        if self.rx.is_empty() {
            let mut device = self.device.borrow_mut();
            for _ in 0..TICKS_PER_POLL {
                device.tick().unwrap();
            }
            self.rx.extend(device.transport_mut().take_output());
        }

        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for Wire {
    type Error = ();

    fn write(&mut self, word: u8) -> nb::Result<(), ()> {
        self.device.borrow_mut().transport_mut().feed(&[word]);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), ()> {
        Ok(())
    }
}

impl SerialPort<()> for Wire {
    fn set_rts(&mut self, _level: bool) -> Result<(), ()> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), ()> {
        Ok(())
    }
}

struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

struct Bench {
    programmer: Programmer<Wire, NoDelay, ()>,
    device: Rc<RefCell<Device>>,
    launched: Rc<Cell<Option<u32>>>,
}

fn config() -> Config {
    Config {
        flash_end: FLASH_BASE + FLASH_SIZE as u32 - 1,
        erase_blocks: 16,
        ..Config::default()
    }
}

fn bench_with(flash: MemoryFlash, config: Config) -> Bench {
    let launched = Rc::new(Cell::new(None));
    let device = Rc::new(RefCell::new(Session::new(
        MemoryLink::new(),
        flash,
        Handoff(launched.clone()),
        config,
    )));

    let wire = Wire {
        device: device.clone(),
        rx: VecDeque::new(),
    };

    Bench {
        programmer: Programmer::new(wire, NoDelay, Options::default()),
        device,
        launched,
    }
}

fn bench() -> Bench {
    bench_with(MemoryFlash::new(FLASH_BASE, FLASH_SIZE, 0x1000), config())
}

/// Two data records behind an extended linear address of 0x1D00
fn image() -> Vec<HexRecord> {
    vec![
        HexRecord::new(RecordType::ExtendedLinearAddress, 0, &[0x1D, 0x00]).unwrap(),
        HexRecord::new(RecordType::Data, 0xF000, &[0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80]).unwrap(),
        HexRecord::new(RecordType::Data, 0xF008, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x11]).unwrap(),
    ]
}

#[test]
fn init_resets_and_reads_version() {
    let mut b = bench();

    assert_eq!(b.programmer.init(), Ok(0x0001));
    assert_eq!(b.device.borrow().state(), State::WaitForCommand);
}

#[test]
fn erase_waits_for_completion() {
    let mut b = bench_with(
        MemoryFlash::new(FLASH_BASE, FLASH_SIZE, 0x1000).with_erase_latency(20),
        config(),
    );

    assert_eq!(b.programmer.erase(), Ok(()));
    assert_eq!(b.device.borrow().state(), State::WaitForCommand);
}

#[test]
fn erase_failure_is_a_nack() {
    let mut b = bench_with(
        MemoryFlash::new(FLASH_BASE, FLASH_SIZE, 0x1000).failing_erase(),
        config(),
    );
    assert_eq!(b.programmer.erase(), Err(Error::Nack));

    let mut b = bench_with(
        MemoryFlash::new(FLASH_BASE, FLASH_SIZE, 0x1000).rejecting_erase(),
        config(),
    );
    assert_eq!(b.programmer.erase(), Err(Error::Nack));

    // device stays usable
    assert_eq!(b.programmer.version(), Ok(0x0001));
}

#[test]
fn program_writes_image_and_returns_to_commands() {
    let mut b = bench();
    let records = image();

    let mut sent = 0;
    b.programmer.program(&records, |_| sent += 1).unwrap();
    assert_eq!(sent, records.len());

    // the appended end of file record hands back to command mode
    assert_eq!(b.programmer.version(), Ok(0x0001));

    let device = b.device.borrow();
    assert_eq!(device.hex_base_address(), 0x1D00_0000);
    assert_eq!(
        device.nvm().read(0x9D00_F000, 16),
        Some(
            &[
                0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
                0x11, 0xFF, 0xFF
            ][..]
        )
    );
    assert_eq!(device.nvm().writes().len(), 4);
}

#[test]
fn program_stops_at_end_of_file() {
    let mut b = bench();
    let mut records = image();
    records.insert(1, HexRecord::end_of_file());

    let mut sent = 0;
    b.programmer.program(&records, |_| sent += 1).unwrap();
    assert_eq!(sent, 2);

    assert_eq!(b.programmer.version(), Ok(0x0001));
    assert!(b.device.borrow().nvm().writes().is_empty());
}

#[test]
fn jump_hands_off_to_application() {
    let mut b = bench();

    b.programmer.jump().unwrap();

    // the device only sees the frame once it is ticked
    for _ in 0..4 {
        b.device.borrow_mut().tick().unwrap();
    }

    assert_eq!(b.launched.get(), Some(0x9D00_F000));
    assert!(b.device.borrow().is_halted());
}

#[test]
fn raw_commands() {
    let mut b = bench();

    assert_eq!(b.programmer.raw(&[0x01], 3).unwrap().as_slice(), &[0x01, 0x00, 0x01]);

    // reserved opcode gets no answer
    assert!(b.programmer.raw(&[0x04], 0).unwrap().is_empty());
    assert_eq!(b.programmer.version(), Ok(0x0001));
}

#[test]
fn commands_pass_enforced_crc() {
    let mut b = bench_with(
        MemoryFlash::new(FLASH_BASE, FLASH_SIZE, 0x1000),
        Config {
            command_crc: CommandCrc::Enforce,
            ..config()
        },
    );

    assert_eq!(b.programmer.version(), Ok(0x0001));
    assert_eq!(b.programmer.erase(), Ok(()));

    b.programmer.program(&image(), |_| ()).unwrap();
    assert_eq!(b.programmer.version(), Ok(0x0001));
    assert_eq!(b.device.borrow().nvm().writes().len(), 4);
}

#[test]
fn silent_device_times_out() {
    let mut b = bench();

    // opcode 0x04 is reserved and never answered
    let mut options = Options::default();
    options.response_timeout_ms = 10;
    let wire = Wire {
        device: b.device.clone(),
        rx: VecDeque::new(),
    };
    b.programmer = Programmer::new(wire, NoDelay, options);

    assert_eq!(b.programmer.raw(&[0x04], 1).unwrap_err(), Error::ResponseTimeout);
    assert_eq!(b.programmer.version(), Ok(0x0001));
}
