//! Command implementations.
//!
//! Each subcommand is implemented in its own module. The helpers here turn
//! flags and config values into the library's session settings.

pub(crate) mod completions;
pub(crate) mod load;
pub(crate) mod ports;
pub(crate) mod probe;
pub(crate) mod terminal;

use anyhow::{Context, Result};
use console::style;
use loadp2::target::handshake::{self, Discovered};
use loadp2::target::{DEFAULT_CLOCK_FREQ, DEFAULT_FIFO_SIZE, DEFAULT_LOADER_BAUD, DEFAULT_USER_BAUD};
use loadp2::{NativePort, ResetLine, SessionConfig};

use crate::config::Config;
use crate::{Cli, CliError};

/// Build the session settings: flag or environment first, then config file,
/// then the built-in default.
pub(crate) fn session_config(cli: &Cli, config: &Config) -> Result<SessionConfig> {
    let load = &config.load;

    let reset_line = match (cli.reset_line, config.port.reset_line.as_deref()) {
        (Some(pin), _) => pin.into(),
        (None, Some(name)) => name
            .parse::<ResetLine>()
            .map_err(|e| CliError::Usage(format!("config port.reset_line: {e}")))?,
        (None, None) => ResetLine::default(),
    };

    let user_baud = cli.baud.or(load.user_baud).unwrap_or(DEFAULT_USER_BAUD);
    let loader_baud = cli
        .loader_baud
        .or(load.loader_baud)
        .unwrap_or(DEFAULT_LOADER_BAUD);
    if user_baud == 0 || loader_baud == 0 {
        return Err(CliError::Usage("baud rate must be greater than zero".into()).into());
    }

    Ok(SessionConfig {
        user_baud,
        loader_baud,
        clock_freq: cli.clock_freq.or(load.clock_freq).unwrap_or(DEFAULT_CLOCK_FREQ),
        clock_mode: cli.clock_mode.or(load.clock_mode),
        reset_line,
        reset: !cli.no_reset,
        fifo_size: cli.fifo_size.or(load.fifo_size).unwrap_or(DEFAULT_FIFO_SIZE),
        zero_memory: load.zero_memory.unwrap_or(true),
        checksum: load.checksum.unwrap_or(true),
        ..SessionConfig::default()
    })
}

/// Find the target, reporting progress on stderr.
pub(crate) fn connect(
    cli: &Cli,
    config: &Config,
    session: &SessionConfig,
) -> Result<Discovered<NativePort>> {
    let port = cli.port.as_deref().or(config.port.serial.as_deref());
    let prefix = cli.prefix.as_deref().or(config.port.prefix.as_deref());

    if !cli.quiet {
        match port {
            Some(name) => eprintln!("{} Probing {}", style("⏳").yellow(), style(name).cyan()),
            None => eprintln!("{} Searching for a P2", style("⏳").yellow()),
        }
    }

    let found = handshake::open_native(port, prefix, session).with_context(|| match port {
        Some(name) => format!("no P2 found on {name}"),
        None => "no P2 found on any serial port".to_string(),
    })?;

    if !cli.quiet {
        eprintln!(
            "{} Found P2 version {} on {}",
            style("✓").green(),
            style(found.version).cyan(),
            style(&found.name).cyan()
        );
    }
    Ok(found)
}
