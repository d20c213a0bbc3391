//! Loader stubs.
//!
//! The chip and FPGA fast loaders and the SPI flash programmer are Propeller
//! machine code built separately from this tool. They are read from a stub
//! directory at run time. The himem helper is small and fixed, so it is
//! compiled in.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::target::LoadStrategy;

/// Chip fast loader file name.
pub const CHIP_STUB_FILE: &str = "MainLoader_chip.bin";
/// FPGA fast loader file name.
pub const FPGA_STUB_FILE: &str = "MainLoader_fpga.bin";
/// SPI flash programmer file name.
pub const FLASH_STUB_FILE: &str = "flash_loader.bin";

/// Helper that lets the chip loader reach addresses above hub RAM.
pub static HIMEM_HELPER: &[u8] = include_bytes!("himem_flash.bin");

/// Stub images for one run.
#[derive(Debug, Clone, Default)]
pub struct LoaderStubs {
    dir: Option<PathBuf>,
    chip: Option<Vec<u8>>,
    fpga: Option<Vec<u8>>,
    flash: Option<Vec<u8>>,
}

impl LoaderStubs {
    /// No stub directory; only SINGLE loads are possible.
    pub fn none() -> Self {
        Self::default()
    }

    /// Read whichever stubs exist in `dir`.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "stub directory {} does not exist",
                dir.display()
            )));
        }
        let read = |name: &str| -> Result<Option<Vec<u8>>> {
            let path = dir.join(name);
            if !path.is_file() {
                return Ok(None);
            }
            let data = fs::read(&path)?;
            debug!("Loaded stub {} ({} bytes)", path.display(), data.len());
            Ok(Some(data))
        };
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            chip: read(CHIP_STUB_FILE)?,
            fpga: read(FPGA_STUB_FILE)?,
            flash: read(FLASH_STUB_FILE)?,
        })
    }

    /// Build from in-memory images.
    pub fn from_parts(chip: Option<Vec<u8>>, fpga: Option<Vec<u8>>, flash: Option<Vec<u8>>) -> Self {
        Self {
            dir: None,
            chip,
            fpga,
            flash,
        }
    }

    /// The stage sent after `Prop_Hex` for `strategy`. ROM hex strategies
    /// send none.
    pub fn stage_for(&self, strategy: LoadStrategy) -> Result<Option<&[u8]>> {
        match strategy {
            LoadStrategy::Chip => self.require(self.chip.as_deref(), CHIP_STUB_FILE).map(Some),
            LoadStrategy::Fpga => self.require(self.fpga.as_deref(), FPGA_STUB_FILE).map(Some),
            LoadStrategy::Single | LoadStrategy::SpiFlash => Ok(None),
        }
    }

    /// The flash programmer prepended to SPI-FLASH images.
    pub fn flash_loader(&self) -> Result<&[u8]> {
        self.require(self.flash.as_deref(), FLASH_STUB_FILE)
    }

    fn require<'a>(&self, stub: Option<&'a [u8]>, name: &str) -> Result<&'a [u8]> {
        match stub {
            Some(data) if !data.is_empty() => Ok(data),
            _ => Err(Error::Config(match &self.dir {
                Some(dir) => format!("loader stub {name} not found in {}", dir.display()),
                None => format!("loader stub {name} needed but no stub directory configured"),
            })),
        }
    }
}
