#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};

use hexboot::{Config, HexRecord, Launcher, MemoryFlash, Options, Programmer, RecordType, Session};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Read the bootloader version
    Version,

    /// Erase the application flash
    Erase,

    /// Write an Intel HEX image
    Flash {
        /// HEX image to write
        file: PathBuf,

        /// Erase before writing
        #[structopt(long)]
        erase: bool,

        /// Start the application once written
        #[structopt(long)]
        jump: bool,
    },

    /// Start the application
    Jump,

    /// Send a raw command payload given as hex, e.g. `01`
    Raw {
        payload: String,

        /// Expected response payload length
        #[structopt(long, default_value = "1")]
        response_len: usize,
    },

    /// Act as the bootloader on the serial port, backed by a RAM flash model
    Simulate {
        #[structopt(flatten)]
        config: Config,

        /// Erase block size of the modelled flash
        #[structopt(long, default_value = "4096")]
        block_size: u32,

        /// Write the flash contents here when the simulated application starts
        #[structopt(long)]
        image: Option<PathBuf>,
    },
}

/// Stands in for the application when simulating
struct Handoff;

impl Launcher for Handoff {
    fn launch(&mut self, entry_point: u32) {
        info!("Application would start at 0x{:08x}", entry_point);
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, LogConfig::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn connect(
    port: &str,
    baud: usize,
    options: &Options,
) -> anyhow::Result<(Programmer<Serial, Delay, IoErrorKind>, u16)> {
    info!("Connecting to serial port");

    let mut p = Programmer::linux(port, baud, options.clone())
        .with_context(|| format!("Error connecting to serial port {}", port))?;

    info!("Connecting to bootloader");

    let version = p.init().context("Error connecting to bootloader")?;

    info!("Bootloader connected! (version 0x{:04x})", version);

    Ok((p, version))
}

fn run(o: Args) -> anyhow::Result<()> {
    match o.operation {
        Operation::Version => {
            let (_, version) = connect(&o.port, o.baud, &o.options)?;
            println!("0x{:04x}", version);
        }
        Operation::Erase => {
            let (mut p, _) = connect(&o.port, o.baud, &o.options)?;
            p.erase().context("Error erasing flash")?;
            info!("Flash erased");
        }
        Operation::Flash { file, erase, jump } => {
            let records = load_image(&file)?;
            let (mut p, _) = connect(&o.port, o.baud, &o.options)?;

            if erase {
                info!("Erasing flash");
                p.erase().context("Error erasing flash")?;
            }

            let size: usize = records
                .iter()
                .filter(|r| r.kind == RecordType::Data)
                .map(|r| r.data().len())
                .sum();
            info!("Writing {} ({} records)", bytefmt::format(size as u64), records.len());

            let bar = ProgressBar::new(records.len() as u64);
            bar.set_style(ProgressStyle::default_bar().template("{bar:40} {pos}/{len} records"));
            p.program(&records, |_| bar.inc(1)).context("Error writing image")?;
            bar.finish_with_message("done");

            if jump {
                info!("Starting application");
                p.jump().context("Error starting application")?;
            }
        }
        Operation::Jump => {
            let (mut p, _) = connect(&o.port, o.baud, &o.options)?;
            p.jump().context("Error starting application")?;
        }
        Operation::Raw { payload, response_len } => {
            let payload = hex::decode(&payload).context("Payload must be hex")?;
            let (mut p, _) = connect(&o.port, o.baud, &o.options)?;
            let resp = p.raw(&payload, response_len).context("Error sending command")?;
            println!("{}", hex::encode(&resp));
        }
        Operation::Simulate { config, block_size, image } => {
            simulate(&o.port, o.baud, config, block_size, image.as_deref())?;
        }
    }

    Ok(())
}

/// Parse and verify every record of a HEX file before anything is sent
fn load_image(path: &Path) -> anyhow::Result<Vec<HexRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading {}", path.display()))?;

    let mut records = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let digits = line
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("line {}: missing ':'", n + 1))?;
        let record = HexRecord::decode(digits.as_bytes())
            .with_context(|| format!("line {}", n + 1))?;
        if !record.verify() {
            bail!("line {}: checksum mismatch", n + 1);
        }

        records.push(record);
    }

    debug!("Loaded {} records from {}", records.len(), path.display());

    Ok(records)
}

fn simulate(
    port: &str,
    baud: usize,
    config: Config,
    block_size: u32,
    image: Option<&Path>,
) -> anyhow::Result<()> {
    let transport = hexboot::linux::transport(port, baud)
        .with_context(|| format!("Error opening serial port {}", port))?;

    let size = config
        .flash_end
        .checked_sub(config.flash_start)
        .map(|span| span as usize + 1)
        .ok_or_else(|| anyhow!("flash end precedes flash start"))?;
    let flash = MemoryFlash::new(config.flash_start, size, block_size);

    info!(
        "Simulating bootloader on {} (flash 0x{:08x}..=0x{:08x})",
        port, config.flash_start, config.flash_end
    );

    let mut session = Session::new(transport, flash, Handoff, config);
    while !session.is_halted() {
        session.tick()?;
        std::thread::sleep(Duration::from_micros(100));
    }

    if let Some(path) = image {
        std::fs::write(path, session.nvm().contents())
            .with_context(|| format!("Error writing {}", path.display()))?;
        info!("Flash image written to {}", path.display());
    }

    Ok(())
}
