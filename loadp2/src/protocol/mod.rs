//! Wire-level definitions shared by the handshake and download engine.
//!
//! Everything the Propeller 2 boot ROM and the fast loader stubs expect to
//! see on the line is defined here, along with the ASCII-hex encoding the ROM
//! loader consumes.
//!
//! ## Hex encoding
//!
//! The ROM's `Prop_Hex` loader reads whitespace separated hex bytes. A 32-bit
//! parameter word is sent as four such bytes, least significant first:
//!
//! ```text
//! 0x12345678  ->  " 78 56 34 12"
//! ```

pub mod checksum;

use byteorder::{LittleEndian, WriteBytesExt};

/// Probe sent to ask the ROM for its version banner (20 bytes).
pub const CHECK_COMMAND: &[u8] = b"> Prop_Chk 0 0 0 0  ";

/// Enters the ROM hex loader (18 bytes).
pub const ENTRY_COMMAND: &[u8] = b"> Prop_Hex 0 0 0 0";

/// Prefix of the ROM's reply to [`CHECK_COMMAND`]; one version character follows.
pub const VERSION_BANNER: &[u8] = b"\r\nProp_Ver ";

/// Terminates a `Prop_Hex` command and starts the loaded code.
pub const END_MARKER: u8 = b'~';

/// Ends a `Prop_Hex` command that carries a trailing checksum word.
pub const CHECKSUM_TRAILER: u8 = b'?';

/// ROM reply to a good `Prop_Hex` checksum.
pub const CHECKSUM_ACCEPTED: u8 = b'.';

/// Separates hex chunks in the single-stage protocol.
pub const CHUNK_CONTINUATION: &[u8] = b" > ";

/// Autobaud probe byte understood by the chip loader stub.
pub const AUTOBAUD_PROBE: u8 = 0x80;

/// First two bytes of every chip loader checksum reply.
pub const CHECKSUM_REPLY_PREFIX: &[u8] = b"@@";

/// Chain continuation: another block follows.
pub const CHAIN_MORE: u8 = b'+';

/// Chain continuation: last block, start the program.
pub const CHAIN_DONE: u8 = b'-';

/// Sent after the himem helper block to start it.
pub const HIMEM_EXECUTE: u8 = b'!';

/// Hub address the himem helper is staged at.
pub const HIMEM_ADDRESS: u32 = 0xFC400;

/// Tag at the start of the arguments block.
pub const ARGS_MAGIC: &[u8; 4] = b"ARGv";

/// Hub address the arguments block is written to.
pub const ARGS_ADDRESS: u32 = 0xFC000;

/// Size of the arguments block including its tag.
pub const ARGS_BLOCK_SIZE: usize = 1024;

/// Payload bytes available after the tag.
pub const ARGS_MAX_PAYLOAD: usize = ARGS_BLOCK_SIZE - ARGS_MAGIC.len();

/// Maximum number of program arguments.
pub const ARGS_MAX_ITEMS: usize = 32;

/// Largest piece sent before the chip loader must re-signal readiness.
pub const MAX_PIECE: usize = 1024;

/// How the chip loader wants the next block delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Send the whole block, no further acknowledgements.
    Stream,
    /// Send at most [`MAX_PIECE`] bytes, then wait for the next mode byte.
    Chunked,
    /// Busy: back off and resend the header.
    Wait,
    /// An error message follows.
    Error,
    /// The address needs the himem helper.
    Himem,
}

impl BlockMode {
    /// Decode a mode byte; `None` for anything the loader never sends.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b's' => Some(Self::Stream),
            b'k' => Some(Self::Chunked),
            b'w' => Some(Self::Wait),
            b'e' => Some(Self::Error),
            b'h' => Some(Self::Himem),
            _ => None,
        }
    }
}

/// Append one byte as `" xx"`.
pub fn push_hex_byte(out: &mut Vec<u8>, byte: u8) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    out.push(b' ');
    out.push(DIGITS[usize::from(byte >> 4)]);
    out.push(DIGITS[usize::from(byte & 0x0F)]);
}

/// Append a 32-bit word as four hex bytes, least significant first.
pub fn push_hex_word(out: &mut Vec<u8>, value: u32) {
    for byte in value.to_le_bytes() {
        push_hex_byte(out, byte);
    }
}

/// Hex-encode a byte slice.
pub fn hex_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 3);
    for &byte in data {
        push_hex_byte(&mut out, byte);
    }
    out
}

/// Raw little-endian block header: address then size.
pub fn block_header(address: u32, size: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(8);
    // Writes into a Vec cannot fail.
    let _ = header.write_u32::<LittleEndian>(address);
    let _ = header.write_u32::<LittleEndian>(size);
    header
}
