//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the serial port implementation for native platforms
//! (Linux, macOS, Windows, FreeBSD, etc.).

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPort},
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Whether changing the line rate on an open handle drops DTR on this host,
/// which would reset the target.
const REOPEN_ON_BAUD_CHANGE: bool = cfg!(target_os = "linux");

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    ///
    /// The link is always 8N1 without flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = open_handle(&config.port_name, config.baud_rate, config.timeout)?;

        Ok(Self {
            port: Some(port),
            name: config
                .port_name
                .clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    /// Open a serial port with default settings.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        let config = SerialConfig::new(port_name, baud_rate);
        Self::open(&config)
    }
}

#[cfg(unix)]
fn open_handle(name: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let mut port = serialport::new(name, baud_rate)
        .timeout(timeout)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open_native()?;
    // A second handle must be able to open the device during a baud change.
    port.set_exclusive(false)?;
    Ok(Box::new(port))
}

#[cfg(not(unix))]
fn open_handle(name: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    Ok(serialport::new(name, baud_rate)
        .timeout(timeout)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()?)
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.timeout == timeout {
            return Ok(());
        }
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        if baud_rate == self.baud_rate {
            return Ok(());
        }
        if REOPEN_ON_BAUD_CHANGE && self.port.is_some() {
            // Open the new handle before the old one goes away so the
            // control lines never drop.
            debug!("Reopening {} at {baud_rate} baud", self.name);
            let fresh = open_handle(&self.name, baud_rate, self.timeout)?;
            self.port = Some(fresh);
        } else if let Some(ref mut p) = self.port {
            p.set_baud_rate(baud_rate)?;
        }
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_input(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::Input)?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.flush()?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        if let Some(ref mut p) = self.port {
            p.write_data_terminal_ready(level)?;
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("Setting RTS to {level}");
        if let Some(ref mut p) = self.port {
            p.write_request_to_send(level)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        self.port
            .take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

impl Drop for NativePort {
    fn drop(&mut self) {
        if let Some(mut p) = self.port.take() {
            let _ = p.flush();
        }
    }
}
