//! A connected target.

use log::{debug, info, warn};

use crate::error::Result;
use crate::port::Port;
use crate::target::{LoadStrategy, SessionConfig};

/// An open port to a target that answered the version probe, plus the
/// parameters every later step reads.
///
/// Generic over the port type `P`, so the same engine drives a real serial
/// port or a scripted test device.
pub struct Session<P: Port> {
    port: P,
    config: SessionConfig,
    strategy: LoadStrategy,
    version: Option<char>,
    clock_mode: u32,
}

impl<P: Port> Session<P> {
    /// Create a session on an already probed port.
    ///
    /// `version` is the character from the ROM banner, if one was read. A
    /// strategy forced in `config` wins over the banner.
    pub fn new(port: P, config: SessionConfig, version: Option<char>) -> Self {
        let strategy = match (config.strategy, version) {
            (Some(forced), _) => forced,
            (None, Some(v)) => {
                let (strategy, known) = LoadStrategy::from_version(v);
                if known {
                    debug!("Version {v} selects {strategy} load mode");
                } else {
                    warn!("Unknown P2 version '{v}', assuming {strategy}");
                }
                strategy
            },
            (None, None) => LoadStrategy::Chip,
        };
        let clock_mode = config.resolved_clock_mode(strategy);
        debug!("Clock mode {clock_mode:#x} for {} Hz", config.clock_freq);

        Self {
            port,
            config,
            strategy,
            version,
            clock_mode,
        }
    }

    /// Resolved load strategy.
    pub fn strategy(&self) -> LoadStrategy {
        self.strategy
    }

    /// ROM version character, if probed.
    pub fn version(&self) -> Option<char> {
        self.version
    }

    /// Clock mode word sent to the loader and patched into images.
    pub fn clock_mode(&self) -> u32 {
        self.clock_mode
    }

    /// Run parameters.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Switch the link to the user baud rate for post-load interaction.
    pub fn enter_user_baud(&mut self) -> Result<()> {
        let baud = self.config.user_baud;
        if self.port.baud_rate() != baud {
            info!("Switching {} to {baud} baud", self.port.name());
            self.port.set_baud_rate(baud)?;
        }
        Ok(())
    }

    /// Close the port.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }
}
