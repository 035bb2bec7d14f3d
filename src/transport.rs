//! Serial transport used to talk to the modem.

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Byte-oriented duplex channel with non-blocking line reads.
pub trait Transport {
    fn open(&mut self, port_name: &str, config: &PortConfig) -> Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;
    /// Whether a complete line is buffered. Never blocks.
    fn has_buffered_line(&mut self) -> bool;
    /// Pops one line including its terminator, if a complete one is buffered.
    fn read_line(&mut self) -> Option<Vec<u8>>;
}

/// The one port profile the modem is driven with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data_bits = match self.data_bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let parity = match self.parity {
            Parity::None => "None",
            Parity::Odd => "Odd",
            Parity::Even => "Even",
        };
        let stop_bits = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        let flow_control = match self.flow_control {
            FlowControl::None => "None",
            FlowControl::Software => "Software",
            FlowControl::Hardware => "Hardware",
        };
        write!(
            f,
            "{}, {}, {}, {}, {}",
            self.baud_rate, data_bits, parity, stop_bits, flow_control
        )
    }
}

/// Accumulates raw bytes and hands them back one `\n`-terminated line at a time.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn has_line(&self) -> bool {
        self.buffer.contains(&b'\n')
    }

    /// Removes and returns the first complete line, terminator included.
    pub fn pop_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        Some(self.buffer.drain(..=end).collect())
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

// Short enough that a read of already-available bytes never stalls the caller.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// [`Transport`] backed by a real serial device.
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    lines: LineBuffer,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // Moves whatever the driver has buffered into `lines` without waiting.
    fn fill(&mut self) -> io::Result<()> {
        let Some(port) = self.port.as_mut() else {
            return Ok(());
        };
        let available = port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(());
        }
        let mut chunk = vec![0; available];
        let read = port.read(&mut chunk)?;
        trace!(bytes = read, "Buffered serial input");
        self.lines.push(&chunk[..read]);
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, port_name: &str, config: &PortConfig) -> Result<()> {
        let port = serialport::new(port_name, config.baud_rate)
            .data_bits(config.data_bits)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .flow_control(config.flow_control)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| Error::Open {
                port: port_name.to_owned(),
                source,
            })?;
        self.lines.clear();
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the handle closes the device.
        self.port = None;
        self.lines.clear();
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        port.write_all(bytes)?;
        port.flush()?;
        debug!(bytes = bytes.len(), "Sent {:?}", String::from_utf8_lossy(bytes));
        Ok(bytes.len())
    }

    fn has_buffered_line(&mut self) -> bool {
        if let Err(e) = self.fill() {
            warn!("Serial read failed: {}", e);
        }
        self.lines.has_line()
    }

    fn read_line(&mut self) -> Option<Vec<u8>> {
        self.lines.pop_line()
    }
}
