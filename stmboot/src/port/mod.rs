//! Port abstraction for the bootloader transport.
//!
//! The protocol engine never touches a serial device directly. It talks to
//! a [`Port`], a byte stream whose reads are bounded by a timeout, and it
//! (re)opens ports through a [`PortOpener`] so a session can rebuild its
//! link after the device resets.
//!
//! ```text
//! +------------------+
//! |  Session/Engine  |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+     +------------------+
//! |   Port Trait     |<----|   PortOpener     |
//! +--------+---------+     +------------------+
//!          |
//!          v
//! +--------+---------+
//! | Native SerialPort|
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use stmboot::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> stmboot::Result<()> {
//!     port.write_all_bytes(&[0x01])?;
//!
//!     let reply = port.read_up_to(1)?;
//!     println!("Received: {reply:02X?}");
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{ErrorKind, Read, Write};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (the factory ROM loader expects Even).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1000),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the parity.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

impl Parity {
    /// Parse a parity name ("none", "even", "odd").
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "none" | "n" => Some(Self::None),
            "even" | "e" => Some(Self::Even),
            "odd" | "o" => Some(Self::Odd),
            _ => None,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Byte transport used by the protocol engine.
///
/// Reads must honour [`Port::timeout`]: a read either returns data or gives
/// up with `ErrorKind::TimedOut` (or `Ok(0)`) once the timeout has passed.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Get the baud rate the port was opened with.
    fn baud_rate(&self) -> u32;

    /// Discard any bytes waiting in the receive buffer.
    fn reset_input_buffer(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Whether the port is still open.
    fn is_open(&self) -> bool;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        trace!("TX {buf:02X?}");
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }

    /// Read up to `max` bytes, stopping early once the timeout elapses.
    ///
    /// Returns fewer bytes than requested (possibly none) on timeout; only
    /// link-level failures are reported as errors.
    fn read_up_to(&mut self, max: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout();
        let mut buf = vec![0u8; max];
        let mut filled = 0;

        while filled < max {
            match self.read(&mut buf[filled..]) {
                Ok(0) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                },
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    break;
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }

            if filled < max && Instant::now() >= deadline {
                break;
            }
        }

        buf.truncate(filled);
        trace!("RX {buf:02X?} ({filled}/{max})");
        Ok(buf)
    }
}

/// Opens ports for a session, and reopens them on reconnect.
pub trait PortOpener {
    /// Port type produced by this opener.
    type Port: Port;

    /// Open the port described by `config`.
    fn open(&mut self, config: &SerialConfig) -> Result<Self::Port>;
}

/// Temporarily replaces a port's read timeout.
///
/// The previous timeout is put back when the guard is dropped, whichever
/// way the borrowing scope is left.
pub struct ScopedTimeout<'a, P: Port> {
    port: &'a mut P,
    previous: Duration,
}

impl<'a, P: Port> ScopedTimeout<'a, P> {
    /// Switch `port` to `timeout` until the returned guard is dropped.
    pub fn new(port: &'a mut P, timeout: Duration) -> Result<Self> {
        let previous = port.timeout();
        port.set_timeout(timeout)?;
        Ok(Self { port, previous })
    }

    /// Timeout that will be restored.
    pub fn previous(&self) -> Duration {
        self.previous
    }
}

impl<P: Port> Deref for ScopedTimeout<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.port
    }
}

impl<P: Port> DerefMut for ScopedTimeout<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        self.port
    }
}

impl<P: Port> Drop for ScopedTimeout<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.port.set_timeout(self.previous) {
            warn!("Failed to restore port timeout to {:?}: {e}", self.previous);
        }
    }
}

// Re-export the native implementation
#[cfg(feature = "native")]
pub use native::{NativeOpener, NativePort};
