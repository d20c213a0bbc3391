//! Post-load script interpreter.
//!
//! A script is a flat run of commands, each written `name(arg)` or
//! `name[arg]`, optionally separated by whitespace:
//!
//! ```text
//! recvtimeout(2000) recv(ready) send[run^M] recv(done)
//! ```
//!
//! | Command         | Effect                                                   |
//! |-----------------|----------------------------------------------------------|
//! | `send`          | send literal bytes; `^X` is Ctrl-X, `^^` is a caret      |
//! | `binfile`       | send a file unchanged                                    |
//! | `textfile`      | send a file with LF and CRLF turned into CR              |
//! | `recv`          | wait until the literal text arrives                      |
//! | `recvtimeout`   | set the `recv` timeout in milliseconds (default 1000)    |
//! | `pauseafter`    | pause 10 ms after every N bytes sent (0 disables)        |
//! | `pausems`       | sleep for N milliseconds                                 |
//! | `scriptfile`    | run the script in a file                                 |
//!
//! Execution stops at the first failing command.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port::Port;

/// Default wait for `recv`.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(1000);

/// Pause inserted by `pauseafter`.
const PACING_PAUSE: Duration = Duration::from_millis(10);

/// Largest script file `scriptfile` accepts.
pub const MAX_SCRIPT_FILE: usize = 8192;

/// Nesting limit for `scriptfile`.
const MAX_DEPTH: usize = 8;

/// One parsed script command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Literal bytes, escapes already decoded.
    Send(Vec<u8>),
    /// File sent byte for byte.
    BinFile(PathBuf),
    /// File sent with line endings turned into CR.
    TextFile(PathBuf),
    /// Text to wait for.
    Recv(Vec<u8>),
    /// New `recv` timeout.
    RecvTimeout(Duration),
    /// Bytes between pacing pauses.
    PauseAfter(usize),
    /// Unconditional delay.
    PauseMs(Duration),
    /// Nested script.
    ScriptFile(PathBuf),
}

fn script_error(command: &str, reason: impl Into<String>) -> Error {
    Error::Script {
        command: command.to_string(),
        reason: reason.into(),
    }
}

/// Parse a script into commands.
pub fn parse(script: &str) -> Result<Vec<Command>> {
    Commands::new(script).collect()
}

/// Commands of a script, parsed one at a time. Stops after the first
/// malformed command.
#[derive(Debug, Clone)]
pub struct Commands<'a> {
    rest: &'a str,
}

impl<'a> Commands<'a> {
    /// Iterate over the commands in `script`.
    pub fn new(script: &'a str) -> Self {
        Self {
            rest: script.trim_start(),
        }
    }

    fn next_command(&mut self) -> Result<Command> {
        let rest = self.rest;
        let open = rest
            .find(['(', '['])
            .ok_or_else(|| script_error(rest.trim_end(), "missing '(' or '['"))?;
        let name = rest[..open].trim();
        let close = if rest[open..].starts_with('(') { ')' } else { ']' };
        let (raw, consumed) = split_argument(&rest[open + 1..], close)
            .ok_or_else(|| script_error(name, format!("missing closing '{close}'")))?;
        let command = parse_command(name, raw)?;
        self.rest = rest[open + 1 + consumed..].trim_start();
        Ok(command)
    }
}

impl Iterator for Commands<'_> {
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let item = self.next_command();
        if item.is_err() {
            self.rest = "";
        }
        Some(item)
    }
}

/// Find the unescaped `close`; returns the argument text and the bytes
/// consumed including the delimiter.
fn split_argument(text: &str, close: char) -> Option<(&str, usize)> {
    let mut chars = text.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '^' {
            chars.next();
        } else if c == close {
            return Some((&text[..i], i + c.len_utf8()));
        }
    }
    None
}

fn parse_command(name: &str, arg: &str) -> Result<Command> {
    let number = |what: &str| -> Result<u64> {
        arg.trim()
            .parse::<u64>()
            .map_err(|_| script_error(name, format!("'{arg}' is not a valid {what}")))
    };
    let path = || -> Result<PathBuf> {
        if arg.trim().is_empty() {
            return Err(script_error(name, "no file name given"));
        }
        Ok(PathBuf::from(arg.trim()))
    };

    match name.to_ascii_lowercase().as_str() {
        "send" => Ok(Command::Send(decode_escapes(arg))),
        "recv" => Ok(Command::Recv(decode_escapes(arg))),
        "binfile" => Ok(Command::BinFile(path()?)),
        "textfile" => Ok(Command::TextFile(path()?)),
        "scriptfile" => Ok(Command::ScriptFile(path()?)),
        "recvtimeout" => Ok(Command::RecvTimeout(Duration::from_millis(number("timeout")?))),
        "pausems" => Ok(Command::PauseMs(Duration::from_millis(number("delay")?))),
        "pauseafter" => {
            let count = usize::try_from(number("byte count")?)
                .map_err(|_| script_error(name, "byte count out of range"))?;
            Ok(Command::PauseAfter(count))
        },
        "" => Err(script_error(arg, "missing command name")),
        other => Err(script_error(other, "unknown command")),
    }
}

/// Decode caret escapes: `^X` is `X & 0x1f`, `^^` is a literal caret.
pub fn decode_escapes(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes();
    while let Some(b) = bytes.next() {
        if b != b'^' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'^') => out.push(b'^'),
            Some(c) => out.push(c & 0x1F),
            None => out.push(b'^'),
        }
    }
    out
}

/// Turn LF and CRLF line endings into CR.
pub fn to_cr_line_endings(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        match b {
            b'\r' if iter.peek() == Some(&&b'\n') => {
                iter.next();
                out.push(b'\r');
            },
            b'\n' => out.push(b'\r'),
            _ => out.push(b),
        }
    }
    out
}

/// Runs scripts against a port. Timing settings persist across commands of
/// one run.
#[derive(Debug, Clone)]
pub struct Interpreter {
    recv_timeout: Duration,
    pause_after: usize,
    depth: usize,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Fresh interpreter with default timing.
    pub fn new() -> Self {
        Self {
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            pause_after: 0,
            depth: 0,
        }
    }

    /// Current `recv` timeout.
    pub fn recv_timeout(&self) -> Duration {
        self.recv_timeout
    }

    /// Run `script`, parsing each command just before it executes.
    ///
    /// Commands ahead of a malformed one have already run when its error is
    /// returned.
    pub fn run<P: Port + ?Sized>(&mut self, port: &mut P, script: &str) -> Result<()> {
        for command in Commands::new(script) {
            self.run_one(port, &command?)?;
        }
        Ok(())
    }

    /// Run already parsed commands in order.
    pub fn execute<P: Port + ?Sized>(&mut self, port: &mut P, commands: &[Command]) -> Result<()> {
        for command in commands {
            self.run_one(port, command)?;
        }
        Ok(())
    }

    fn run_one<P: Port + ?Sized>(&mut self, port: &mut P, command: &Command) -> Result<()> {
        if crate::is_interrupted_requested() {
            return Err(Error::Cancelled);
        }
        debug!("Script: {command:?}");
        self.step(port, command)
    }

    fn step<P: Port + ?Sized>(&mut self, port: &mut P, command: &Command) -> Result<()> {
        match command {
            Command::Send(bytes) => self.send_paced(port, bytes),
            Command::BinFile(path) => {
                let data = fs::read(path)
                    .map_err(|e| script_error("binfile", format!("{}: {e}", path.display())))?;
                self.send_paced(port, &data)
            },
            Command::TextFile(path) => {
                let data = fs::read(path)
                    .map_err(|e| script_error("textfile", format!("{}: {e}", path.display())))?;
                self.send_paced(port, &to_cr_line_endings(&data))
            },
            Command::Recv(target) => self.recv(port, target),
            Command::RecvTimeout(timeout) => {
                self.recv_timeout = *timeout;
                Ok(())
            },
            Command::PauseAfter(count) => {
                self.pause_after = *count;
                Ok(())
            },
            Command::PauseMs(delay) => {
                thread::sleep(*delay);
                Ok(())
            },
            Command::ScriptFile(path) => self.run_file(port, path),
        }
    }

    fn run_file<P: Port + ?Sized>(&mut self, port: &mut P, path: &Path) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(script_error(
                "scriptfile",
                format!("{}: nested more than {MAX_DEPTH} deep", path.display()),
            ));
        }
        let data = fs::read(path)
            .map_err(|e| script_error("scriptfile", format!("{}: {e}", path.display())))?;
        if data.len() > MAX_SCRIPT_FILE {
            return Err(script_error(
                "scriptfile",
                format!(
                    "{} is {} bytes, the limit is {MAX_SCRIPT_FILE}",
                    path.display(),
                    data.len()
                ),
            ));
        }
        let text = String::from_utf8_lossy(&data);
        self.depth += 1;
        let result = self.run(port, &text);
        self.depth -= 1;
        result
    }

    fn send_paced<P: Port + ?Sized>(&self, port: &mut P, data: &[u8]) -> Result<()> {
        if self.pause_after == 0 {
            return port.send(data);
        }
        for piece in data.chunks(self.pause_after) {
            port.send(piece)?;
            thread::sleep(PACING_PAUSE);
        }
        Ok(())
    }

    /// Wait for `target`, restarting the match on every mismatch.
    fn recv<P: Port + ?Sized>(&self, port: &mut P, target: &[u8]) -> Result<()> {
        if target.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + self.recv_timeout;
        let mut matched = 0;
        let mut byte = [0u8; 1];
        while matched < target.len() {
            if crate::is_interrupted_requested() {
                return Err(Error::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(script_error(
                    "recv",
                    format!(
                        "timed out after {} ms waiting for {:?}",
                        self.recv_timeout.as_millis(),
                        String::from_utf8_lossy(target)
                    ),
                ));
            }
            if port.receive_timeout(&mut byte, remaining)? == 0 {
                continue;
            }
            trace!("recv {:#04x}", byte[0]);
            matched = if byte[0] == target[matched] {
                matched + 1
            } else if byte[0] == target[0] {
                1
            } else {
                0
            };
        }
        Ok(())
    }
}
