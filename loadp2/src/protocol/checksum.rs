//! Transfer checksums.
//!
//! Three sums are in play:
//!
//! - the chip loader's running byte sum, verified modulo 256 after every
//!   block and echoed back as two `'@'`-offset nibbles;
//! - the ROM hex loader's word sum, sent as `"Prop" - sum` so the ROM's own
//!   total comes out as the ASCII tag;
//! - the flash image word sum, patched so the whole image sums to zero.

use crate::error::{Error, Result};

/// Base character for checksum nibbles.
const NIBBLE_BASE: u8 = b'@';

/// `"Prop"` read as a little-endian word.
pub const ROM_CHECKSUM_BASE: u32 = 0x706F_7250;

/// Running byte sum of a chip loader block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Accumulator {
    sum: u32,
}

impl Accumulator {
    /// Start an empty sum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every byte of `data`.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.sum = self.sum.wrapping_add(u32::from(byte));
        }
    }

    /// Full 32-bit sum.
    pub fn value(&self) -> u32 {
        self.sum
    }

    /// The part the device verifies.
    pub fn low_byte(&self) -> u8 {
        self.sum.to_le_bytes()[0]
    }
}

/// Encode a checksum byte the way the chip loader replies with it.
pub fn encode_reply(value: u8) -> [u8; 3] {
    [NIBBLE_BASE + (value >> 4), NIBBLE_BASE + (value & 0x0F), b' ']
}

/// Reconstruct the checksum byte from a 3-byte reply.
///
/// Each nibble character is taken modulo 16 after removing the `'@'` base, so
/// a garbled character still yields a byte and fails the comparison.
pub fn decode_reply(reply: &[u8]) -> Result<u8> {
    let nibble = |c: u8| c.wrapping_sub(NIBBLE_BASE) & 0x0F;
    match reply {
        [hi, lo, _] => Ok((nibble(*hi) << 4) | nibble(*lo)),
        _ => Err(Error::protocol("3-byte checksum reply", reply)),
    }
}

/// Wrapping sum of `data` read as little-endian words.
///
/// A trailing partial word is zero-extended.
pub fn word_sum(data: &[u8]) -> u32 {
    data.chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .fold(0u32, u32::wrapping_add)
}

/// Checksum word appended to a ROM hex load of `data`.
pub fn rom_checksum(data: &[u8]) -> u32 {
    ROM_CHECKSUM_BASE.wrapping_sub(word_sum(data))
}

/// Zero the word at `slot`, then store the two's complement of the image
/// word sum there so the patched image sums to zero.
pub fn patch_flash_checksum(image: &mut [u8], slot: usize) -> Result<()> {
    if image.len() % 4 != 0 {
        return Err(Error::Unaligned(image.len()));
    }
    if slot % 4 != 0 || slot + 4 > image.len() {
        return Err(Error::Config(format!(
            "checksum slot {slot:#x} outside {} byte image",
            image.len()
        )));
    }
    image[slot..slot + 4].fill(0);
    let sum = word_sum(image);
    image[slot..slot + 4].copy_from_slice(&sum.wrapping_neg().to_le_bytes());
    Ok(())
}
