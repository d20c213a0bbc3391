//! Terminal pass-through.
//!
//! One loop alternates between the port and the keyboard: device output is
//! copied to stdout, key presses are sent to the device. Ctrl-] leaves the
//! terminal. A program on the P2 can end the session itself by printing
//! `0xFF 0x00 <code>`; `<code>` becomes the process exit code.

use anyhow::{Context, Result};
use console::style;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use log::debug;
use loadp2::Port;
use std::io::{self, IsTerminal, Write as _};
use std::time::Duration;

use crate::commands::{connect, session_config};
use crate::config::Config;
use crate::{Cli, was_interrupted};

/// Port read slice; bounds keyboard latency.
const READ_SLICE: Duration = Duration::from_millis(10);

/// `terminal` command: open the port at the user baud and pass bytes through.
pub(crate) fn cmd_terminal(cli: &Cli, config: &Config) -> Result<u8> {
    let settings = session_config(cli, config)?;
    let mut port = match cli.port.as_deref().or(config.port.serial.as_deref()) {
        Some(name) => loadp2::NativePort::open_simple(name, settings.user_baud)
            .with_context(|| format!("Failed to open {name}"))?,
        None => {
            // No port given: find the P2 the same way `load` does.
            let found = connect(cli, config, &settings)?;
            let mut port = found.port;
            port.set_baud_rate(settings.user_baud)?;
            port
        },
    };
    let code = pass_through(&mut port, cli.quiet)?;
    Ok(code.unwrap_or(0))
}

/// Run the terminal on an open port. Returns the device's exit code if it
/// ended the session.
pub(crate) fn pass_through<P: Port + ?Sized>(port: &mut P, quiet: bool) -> Result<Option<u8>> {
    let interactive = io::stdin().is_terminal();
    if !quiet {
        eprintln!(
            "{} Terminal on {} at {} baud{}",
            style("⇄").cyan(),
            style(port.name()).cyan(),
            port.baud_rate(),
            if interactive { ", Ctrl-] to exit" } else { "" }
        );
    }

    let _raw = if interactive {
        Some(RawModeGuard::enable()?)
    } else {
        None
    };

    let mut exit = ExitSequence::default();
    let mut buf = [0u8; 1024];
    let mut out = Vec::with_capacity(buf.len());
    let mut stdout = io::stdout();

    loop {
        if was_interrupted() {
            return Ok(None);
        }

        let n = port.receive_timeout(&mut buf, READ_SLICE)?;
        if n > 0 {
            out.clear();
            let code = exit.feed(&buf[..n], &mut out);
            stdout.write_all(&out)?;
            stdout.flush()?;
            if let Some(code) = code {
                debug!("Device requested exit with code {code}");
                return Ok(Some(code));
            }
        }

        if !interactive {
            continue;
        }
        while event::poll(Duration::ZERO)? {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            match map_key(&key) {
                Some(KeyAction::Quit) => return Ok(None),
                Some(KeyAction::Send(bytes)) => port.send(&bytes)?,
                None => {},
            }
        }
    }
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum KeyAction {
    Send(Vec<u8>),
    Quit,
}

fn map_key(key: &KeyEvent) -> Option<KeyAction> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let bytes = match key.code {
        // Some terminals report Ctrl-] as Ctrl-5.
        KeyCode::Char(']' | '5') if ctrl => return Some(KeyAction::Quit),
        KeyCode::Char(c) if ctrl => vec![u8::try_from(c.to_ascii_lowercase()).ok()? & 0x1F],
        KeyCode::Char(c) => c.to_string().into_bytes(),
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Backspace => vec![0x08],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::Esc => vec![0x1B],
        _ => return None,
    };
    Some(KeyAction::Send(bytes))
}

/// Watches device output for `0xFF 0x00 <code>`.
#[derive(Debug, Default)]
struct ExitSequence {
    state: ExitState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    #[default]
    Idle,
    SawFf,
    SawZero,
}

impl ExitSequence {
    /// Copy displayable bytes of `input` to `out`. Returns the exit code once
    /// the sequence completes; bytes after it are dropped.
    fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Option<u8> {
        for &byte in input {
            self.state = match (self.state, byte) {
                (ExitState::SawZero, code) => {
                    self.state = ExitState::Idle;
                    return Some(code);
                },
                (ExitState::Idle, 0xFF) => ExitState::SawFf,
                (ExitState::Idle, b) => {
                    out.push(b);
                    ExitState::Idle
                },
                (ExitState::SawFf, 0x00) => ExitState::SawZero,
                (ExitState::SawFf, 0xFF) => {
                    out.push(0xFF);
                    ExitState::SawFf
                },
                (ExitState::SawFf, b) => {
                    out.extend_from_slice(&[0xFF, b]);
                    ExitState::Idle
                },
            };
        }
        None
    }
}
