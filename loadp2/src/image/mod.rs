//! Image construction.
//!
//! A file on disk becomes an [`Image`]: an owned, word-aligned byte buffer
//! and the hub address it belongs at. ELF files are flattened from their
//! `PT_LOAD` segments; anything else is loaded as a raw binary.
//!
//! ## Layout
//!
//! ```text
//! +-----------+-----------+------------------+---------+
//! |  prepend  | size word |     payload      | padding |
//! | (stub...) | (opt, LE) |  (raw or ELF)    | to 4 B  |
//! +-----------+-----------+------------------+---------+
//! ```

pub mod args;
pub mod chain;
pub mod elf;

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::checksum;

pub use elf::{MAX_IMAGE_SIZE, Segment};

/// Offsets of the clock patch words in a Propeller 2 binary.
pub const CLOCK_FREQ_OFFSET: usize = 0x14;
/// Clock mode word.
pub const CLOCK_MODE_OFFSET: usize = 0x18;
/// User baud word.
pub const USER_BAUD_OFFSET: usize = 0x1C;
/// Smallest image the clock patch fits in.
pub const CLOCK_PATCH_END: usize = USER_BAUD_OFFSET + 4;

/// Where the source bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Flat binary.
    Raw,
    /// Flattened ELF executable.
    Elf,
}

/// Options applied while building an image.
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    /// Bytes placed before everything else (e.g. a flash loader stub).
    pub prepend: Vec<u8>,
    /// Insert the payload length as a little-endian word before the payload.
    pub size_prefix: bool,
}

/// A built image, ready to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Image bytes; length is a multiple of 4.
    pub data: Vec<u8>,
    /// Hub address from the ELF headers, if any.
    pub elf_base: Option<u32>,
    /// Source format.
    pub format: ImageFormat,
    /// Whether a size word was inserted.
    pub size_prefixed: bool,
}

impl Image {
    /// Load and build an image from `path`.
    pub fn from_file<P: AsRef<Path>>(path: P, options: &ImageOptions) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading image from: {}", path.display());
        let data = fs::read(path)?;
        Self::from_bytes(&data, options)
    }

    /// Build an image from file contents.
    pub fn from_bytes(data: &[u8], options: &ImageOptions) -> Result<Self> {
        let (format, elf_base, payload) = match elf::parse(data)? {
            Some(file) => {
                let segments = elf::load_segments(&file)?;
                let (base, flat) = elf::flatten(&segments)?;
                debug!("ELF image: {} bytes based at {base:#x}", flat.len());
                (ImageFormat::Elf, Some(base), flat)
            },
            None => (ImageFormat::Raw, None, data.to_vec()),
        };
        let mut image = Self::from_payload(&payload, options)?;
        image.format = format;
        image.elf_base = elf_base;
        Ok(image)
    }

    /// Lay out already-built bytes without format detection.
    pub fn from_payload(payload: &[u8], options: &ImageOptions) -> Result<Self> {
        let prefix_len = if options.size_prefix { 4 } else { 0 };
        let total = options.prepend.len() + prefix_len + payload.len();
        let mut data = Vec::with_capacity(round_up_4(total));
        data.extend_from_slice(&options.prepend);
        if options.size_prefix {
            let size = u32::try_from(payload.len()).map_err(|_| Error::ImageTooLarge {
                size: payload.len(),
                limit: u32::MAX as usize,
            })?;
            data.extend_from_slice(&size.to_le_bytes());
        }
        data.extend_from_slice(payload);
        data.resize(round_up_4(total), 0);

        Ok(Self {
            data,
            elf_base: None,
            format: ImageFormat::Raw,
            size_prefixed: options.size_prefix,
        })
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the image is long enough to carry the clock patch words.
    pub fn can_patch_clock(&self) -> bool {
        self.data.len() >= CLOCK_PATCH_END
    }

    /// Write clock frequency, clock mode and user baud into the image header.
    pub fn patch_clock(&mut self, clock_freq: u32, clock_mode: u32, user_baud: u32) -> Result<()> {
        if !self.can_patch_clock() {
            return Err(Error::Unsupported(format!(
                "image of {} bytes is too small for the clock patch",
                self.data.len()
            )));
        }
        for (offset, value) in [
            (CLOCK_FREQ_OFFSET, clock_freq),
            (CLOCK_MODE_OFFSET, clock_mode),
            (USER_BAUD_OFFSET, user_baud),
        ] {
            self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Patch the word at `slot` so the whole image sums to zero.
    pub fn patch_flash_checksum(&mut self, slot: usize) -> Result<()> {
        checksum::patch_flash_checksum(&mut self.data, slot)
    }
}

/// Loadable segments of an ELF file, or `None` for anything else.
pub fn elf_segments(data: &[u8]) -> Result<Option<Vec<Segment>>> {
    match elf::parse(data)? {
        Some(file) => {
            let mut segments = elf::load_segments(&file)?;
            segments.retain(|s| !s.data.is_empty());
            for segment in &mut segments {
                let padded = round_up_4(segment.data.len());
                segment.data.resize(padded, 0);
            }
            Ok(Some(segments))
        },
        None => Ok(None),
    }
}

/// Round up to a whole number of 32-bit words.
pub const fn round_up_4(len: usize) -> usize {
    (len + 3) & !3
}
