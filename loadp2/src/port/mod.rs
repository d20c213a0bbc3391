//! Port abstraction for serial communication with the target.
//!
//! The loader never talks to an OS serial handle directly. Every component
//! takes a `Port`, which keeps the protocol engine platform-neutral and lets
//! tests drive it with a scripted device.
//!
//! ```text
//! +-------------------------------+
//! |  handshake / loader / script  |
//! +---------------+---------------+
//!                 |
//!                 v
//! +---------------+---------------+
//! |          Port trait           |
//! +-------+---------------+-------+
//!         |               |
//!         v               v
//! +-------+------+ +------+-------+
//! |  NativePort  | |   MockPort   |
//! | (serialport) | |   (tests)    |
//! +--------------+ +--------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use loadp2::port::Port;
//! use std::time::Duration;
//!
//! fn example<P: Port>(port: &mut P) -> loadp2::Result<()> {
//!     port.send(b"> Prop_Chk 0 0 0 0  ")?;
//!
//!     let mut buf = [0u8; 32];
//!     let n = port.receive_timeout(&mut buf, Duration::from_millis(10))?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Time each reset-line edge is held.
const RESET_EDGE: Duration = Duration::from_millis(2);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Default read timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(100),
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

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Control line wired to the target's reset pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ResetLine {
    /// Data Terminal Ready (Parallax Prop Plug and most eval boards).
    #[default]
    Dtr,
    /// Request To Send.
    Rts,
}

impl fmt::Display for ResetLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dtr => write!(f, "dtr"),
            Self::Rts => write!(f, "rts"),
        }
    }
}

impl FromStr for ResetLine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dtr" => Ok(Self::Dtr),
            "rts" => Ok(Self::Rts),
            other => Err(Error::Config(format!(
                "unknown reset line '{other}' (expected dtr or rts)"
            ))),
        }
    }
}

/// Byte transport to the target.
///
/// Implementors supply the raw line operations; the provided methods build the
/// send / receive-with-timeout / reset primitives the loader relies on.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Change the baud rate of the open link.
    ///
    /// Implementations on platforms where reconfiguring the line toggles the
    /// reset pin must avoid resetting the target here.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard any bytes waiting in the input buffer.
    fn clear_input(&mut self) -> Result<()>;

    /// Block until every written byte has left the host.
    fn drain(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until they are queued.
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        log::trace!("tx {} bytes", buf.len());
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Single read bounded by `timeout`. Returns 0 when nothing arrived.
    fn receive_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.set_timeout(timeout)?;
        match self.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(0)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Read until `buf` is full or `timeout` elapses. Returns the number of
    /// bytes actually received.
    fn receive_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let n = self.receive_timeout(&mut buf[filled..], deadline - now)?;
            filled += n;
        }
        Ok(filled)
    }

    /// Drive the configured reset line.
    fn set_reset_line(&mut self, line: ResetLine, level: bool) -> Result<()> {
        match line {
            ResetLine::Dtr => self.set_dtr(level),
            ResetLine::Rts => self.set_rts(level),
        }
    }

    /// Pulse the reset line and drop whatever the target printed meanwhile.
    fn pulse_reset(&mut self, line: ResetLine) -> Result<()> {
        log::trace!("Pulsing {line} for reset");
        self.set_reset_line(line, true)?;
        thread::sleep(RESET_EDGE);
        self.set_reset_line(line, false)?;
        thread::sleep(RESET_EDGE);
        self.set_reset_line(line, true)?;
        thread::sleep(RESET_EDGE);
        self.clear_input()
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        (**self).set_baud_rate(baud_rate)
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn clear_input(&mut self) -> Result<()> {
        (**self).clear_input()
    }

    fn drain(&mut self) -> Result<()> {
        (**self).drain()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        (**self).set_dtr(level)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        (**self).set_rts(level)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::NativePort;
