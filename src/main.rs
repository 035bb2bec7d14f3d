use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use serialport::SerialPortType;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

use dc_unlock::device::BLANK;
use dc_unlock::{
    ExternalGenerator, LockStatus, Notification, Sequencer, SerialTransport, SessionConfig,
    DEFAULT_SALT,
};

mod tui;

/// The session type both front ends drive.
pub type Session = Sequencer<SerialTransport, ExternalGenerator, Vec<Notification>>;

#[derive(Parser)]
#[command(author, version, about = "Reads and removes the SIM lock of Huawei datacards")]
struct Cli {
    #[arg(
        short = 'p',
        long = "port",
        env = "UNLOCKER_PORT",
        default_value = "/dev/ttyUSB0",
        help = "Serial device of the modem's AT interface"
    )]
    port: String,

    #[arg(
        long = "settle-ms",
        default_value_t = 10,
        help = "Milliseconds the modem is given to answer a command"
    )]
    settle_ms: u64,

    #[arg(
        long = "retries",
        default_value_t = 0,
        help = "Times an unanswered query is re-sent"
    )]
    retries: u32,

    #[arg(long = "salt", default_value = DEFAULT_SALT, help = "Salt passed to the code generator")]
    salt: String,

    #[arg(
        short = 'g',
        long = "generator",
        env = "UNLOCKER_GENERATOR",
        help = "Program invoked as '<program> <imei> <salt>' that prints the unlock code"
    )]
    generator: Option<PathBuf>,

    #[arg(long = "batch", help = "Run once without the terminal UI and print the result")]
    batch: bool,

    #[arg(
        long = "unlock",
        requires = "batch",
        help = "In batch mode, submit the unlock code if the card is blocked"
    )]
    unlock: bool,

    #[arg(long = "list-ports", help = "List available serial ports and exit")]
    list_ports: bool,

    #[arg(long = "log-file", help = "Write logs to this file")]
    log_file: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    if cli.list_ports {
        list_ports()?;
        return Ok(ExitCode::SUCCESS);
    }

    init_logging(&cli)?;

    let config = SessionConfig {
        settle_delay: Duration::from_millis(cli.settle_ms),
        retries: cli.retries,
        salt: cli.salt.clone(),
        ..SessionConfig::default()
    };
    let session = Sequencer::new(
        SerialTransport::new(),
        ExternalGenerator::new(cli.generator.clone()),
        Vec::new(),
        config,
    );

    if cli.batch {
        run_batch(session, &cli.port, cli.unlock)
    } else {
        tui::run(session, &cli.port)?;
        Ok(ExitCode::SUCCESS)
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &cli.log_file {
        Some(path) => {
            let file = File::create(path)
                .wrap_err_with(|| format!("Failed to create log file '{}'", path.display()))?;
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false),
                )
                .with(filter)
                .init();
        }
        None if cli.batch => {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        // The terminal UI owns the screen, so logs stay off unless a file is given.
        None => {}
    }
    Ok(())
}

// Prints every port with the details a user needs to pick the modem's AT interface.
fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().wrap_err("Could not enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    for port in ports {
        println!("{}", port.port_name);
        println!("  Location: {}", port.port_name);
        match port.port_type {
            SerialPortType::UsbPort(usb) => {
                println!("  Description: {}", usb.product.as_deref().unwrap_or(BLANK));
                println!("  Manufacturer: {}", usb.manufacturer.as_deref().unwrap_or(BLANK));
                println!("  Serial number: {}", usb.serial_number.as_deref().unwrap_or(BLANK));
                println!("  Vendor Identifier: {:x}", usb.vid);
                println!("  Product Identifier: {:x}", usb.pid);
            }
            SerialPortType::PciPort => println!("  Type: PCI"),
            SerialPortType::BluetoothPort => println!("  Type: Bluetooth"),
            SerialPortType::Unknown => println!("  Type: {}", BLANK),
        }
    }
    Ok(())
}

// Connects, reads the card, optionally unlocks it, and prints what was learned.
fn run_batch(mut session: Session, port: &str, unlock: bool) -> Result<ExitCode> {
    session
        .connect(port, Instant::now())
        .wrap_err_with(|| format!("Failed to open '{}'", port))?;
    drive(&mut session);

    if unlock {
        match session.device().lock_status() {
            LockStatus::Blocked => {
                session.unlock(Instant::now())?;
                drive(&mut session);
            }
            status => warn!(%status, "Card is not blocked, skipping unlock"),
        }
    }

    let device = session.device();
    println!("Status:   {}", device.lock_status());
    println!(
        "Attempts: {}",
        device
            .attempts_remaining()
            .map_or_else(|| BLANK.to_owned(), |n| n.to_string())
    );
    println!("IMEI:     {}", device.imei().map_or(BLANK, |imei| imei.as_str()));
    println!("NCK:      {}", device.unlock_code().unwrap_or(BLANK));

    let identified = device.imei().is_some();
    session.disconnect()?;
    Ok(if identified {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// Sleeps through each settle delay until no exchange is left in flight.
fn drive(session: &mut Session) {
    while let Some(deadline) = session.next_deadline() {
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
        session.poll(Instant::now());
        for notification in session.sink_mut().drain(..) {
            if let Notification::StatusMessage(text) = notification {
                info!("{}", text);
            }
        }
    }
}
