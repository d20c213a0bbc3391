//! Multi-file load specifications.
//!
//! A chain is written as comma-separated entries:
//!
//! ```text
//! prog.bin                    load at the default address
//! @1000=data.bin              load at 0x1000
//! @2000+table.bin             load at 0x2000 with a 4-byte size prefix
//! prog.bin,@8000=data.bin     two blocks, the program starts after the last
//! ```

use std::path::PathBuf;

use crate::error::{Error, Result};

/// What follows an entry on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Another block follows.
    More,
    /// Last block of the chain.
    Stop,
}

/// One file of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    /// Explicit hub address, or `None` for the default.
    pub address: Option<u32>,
    /// File to load.
    pub path: PathBuf,
    /// Prefix the data with its length.
    pub size_prefix: bool,
    /// Marker sent after this entry.
    pub continuation: Continuation,
}

/// Parse a comma-separated chain specification.
pub fn parse(files: &str) -> Result<Vec<ChainEntry>> {
    let parts: Vec<&str> = files.split(',').collect();
    let last = parts.len() - 1;
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let continuation = if i == last {
                Continuation::Stop
            } else {
                Continuation::More
            };
            parse_entry(part.trim(), continuation)
        })
        .collect()
}

fn parse_entry(text: &str, continuation: Continuation) -> Result<ChainEntry> {
    if text.is_empty() {
        return Err(Error::InvalidChain("empty entry".into()));
    }
    let Some(rest) = text.strip_prefix('@') else {
        return Ok(ChainEntry {
            address: None,
            path: PathBuf::from(text),
            size_prefix: false,
            continuation,
        });
    };

    let split = rest
        .find(['=', '+'])
        .ok_or_else(|| Error::InvalidChain(format!("'{text}' needs '=' or '+' after the address")))?;
    let (addr_text, tail) = rest.split_at(split);
    let size_prefix = tail.starts_with('+');
    let file = &tail[1..];
    if file.is_empty() {
        return Err(Error::InvalidChain(format!("'{text}' names no file")));
    }
    let address = parse_address(addr_text)
        .ok_or_else(|| Error::InvalidChain(format!("bad address '{addr_text}' in '{text}'")))?;

    Ok(ChainEntry {
        address: Some(address),
        path: PathBuf::from(file),
        size_prefix,
        continuation,
    })
}

/// Hex address with an optional `0x` prefix.
pub fn parse_address(text: &str) -> Option<u32> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}
