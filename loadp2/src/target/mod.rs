//! Target model: load strategies, session parameters and clock math.
//!
//! The Propeller 2 can be loaded four ways. Which one applies is decided by
//! the ROM's version banner unless the caller forces a strategy.
//!
//! | Strategy  | Stage sent after `Prop_Hex`     | Data encoding     | Verified by          |
//! |-----------|---------------------------------|-------------------|----------------------|
//! | CHIP      | chip loader stub + parameters   | raw, per block    | byte sum, per block  |
//! | FPGA      | FPGA loader stub + parameters   | raw               | nothing              |
//! | SINGLE    | none (ROM hex loader)           | ASCII hex         | `"Prop"` word sum    |
//! | SPI-FLASH | flash stub inside the image     | ASCII hex         | `"Prop"` word sum    |

pub mod handshake;
pub mod loader;
pub mod session;
pub mod stub;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::ResetLine;

pub use session::Session;

/// User (terminal) baud rate.
pub const DEFAULT_USER_BAUD: u32 = 115_200;

/// Loader baud rate.
#[cfg(target_os = "macos")]
pub const DEFAULT_LOADER_BAUD: u32 = 921_600;
/// Loader baud rate.
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_LOADER_BAUD: u32 = 2_000_000;

/// System clock the loader programs by default.
pub const DEFAULT_CLOCK_FREQ: u32 = 80_000_000;

/// Host-side receive FIFO assumed when sizing the probe wait.
pub const DEFAULT_FIFO_SIZE: u32 = 16;

/// Per-bit instruction overhead of the FPGA loader.
pub const DEFAULT_EXTRA_CYCLES: u32 = 7;

/// Crystal on every Propeller 2 board.
const CRYSTAL_FREQ: u64 = 20_000_000;

/// Load protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum LoadStrategy {
    /// Fast multi-block chip loader.
    Chip,
    /// FPGA-simulation loader.
    Fpga,
    /// ROM hex loader only.
    Single,
    /// ROM hex loader running a flash programmer.
    SpiFlash,
}

impl LoadStrategy {
    /// Strategy for a version character from the ROM banner.
    ///
    /// The flag is `false` when the character was not recognised and CHIP
    /// was assumed.
    pub fn from_version(version: char) -> (Self, bool) {
        match version {
            'B' => (Self::Fpga, true),
            'A' | 'G' => (Self::Chip, true),
            _ => (Self::Chip, false),
        }
    }

    /// Whether the strategy goes through the ROM's hex loader.
    pub fn uses_rom_hex(&self) -> bool {
        matches!(self, Self::Single | Self::SpiFlash)
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chip => write!(f, "CHIP"),
            Self::Fpga => write!(f, "FPGA"),
            Self::Single => write!(f, "SINGLE"),
            Self::SpiFlash => write!(f, "SPI-FLASH"),
        }
    }
}

impl FromStr for LoadStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chip" => Ok(Self::Chip),
            "fpga" => Ok(Self::Fpga),
            "single" => Ok(Self::Single),
            "spi-flash" | "flash" | "spi" => Ok(Self::SpiFlash),
            other => Err(Error::Config(format!("unknown load strategy '{other}'"))),
        }
    }
}

/// Everything a run is configured with.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Baud rate after loading.
    pub user_baud: u32,
    /// Baud rate used while loading.
    pub loader_baud: u32,
    /// Target system clock in Hz.
    pub clock_freq: u32,
    /// Explicit clock mode word; derived from `clock_freq` when `None`.
    pub clock_mode: Option<u32>,
    /// Strategy forced by the caller.
    pub strategy: Option<LoadStrategy>,
    /// Control line wired to reset.
    pub reset_line: ResetLine,
    /// Pulse reset before probing.
    pub reset: bool,
    /// Host receive FIFO size, scales the probe wait.
    pub fifo_size: u32,
    /// FPGA timing overhead.
    pub extra_cycles: u32,
    /// Ask the loader to clear hub memory first.
    pub zero_memory: bool,
    /// Patch clock settings into the program header.
    pub patch: bool,
    /// Verify ROM hex loads with the `"Prop"` checksum.
    pub checksum: bool,
    /// Load address for chain entries without one.
    pub default_address: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_baud: DEFAULT_USER_BAUD,
            loader_baud: DEFAULT_LOADER_BAUD,
            clock_freq: DEFAULT_CLOCK_FREQ,
            clock_mode: None,
            strategy: None,
            reset_line: ResetLine::Dtr,
            reset: true,
            fifo_size: DEFAULT_FIFO_SIZE,
            extra_cycles: DEFAULT_EXTRA_CYCLES,
            zero_memory: true,
            patch: false,
            checksum: true,
            default_address: 0,
        }
    }
}

impl SessionConfig {
    /// Set the loader baud rate.
    #[must_use]
    pub fn with_loader_baud(mut self, baud: u32) -> Self {
        self.loader_baud = baud;
        self
    }

    /// Force a strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Flag word sent to the loader stubs.
    pub fn flag_bits(&self) -> u32 {
        u32::from(self.zero_memory) | (u32::from(self.patch) << 1)
    }

    /// How long to let the ROM answer a probe.
    pub fn probe_wait(&self) -> Duration {
        let drain_ms = u64::from(self.fifo_size) * 10 * 1000 / u64::from(self.loader_baud.max(1));
        Duration::from_millis(50 + drain_ms)
    }

    /// Clock mode word for `strategy`.
    pub fn resolved_clock_mode(&self, strategy: LoadStrategy) -> u32 {
        self.clock_mode.unwrap_or_else(|| match strategy {
            LoadStrategy::Fpga => fpga_clock_mode(self.clock_freq),
            _ => chip_clock_mode(self.clock_freq),
        })
    }
}

/// PLL configuration word for `clock_freq` from the 20 MHz crystal.
pub fn chip_clock_mode(clock_freq: u32) -> u32 {
    let xdiv: u64 = 10;
    let xdivp: u64 = 1;
    let xosc: u64 = 2;
    let xmul = u64::from(clock_freq) / 100 * xdiv * xdivp / (CRYSTAL_FREQ / 100);
    let xpppp = ((xdivp >> 1) + 15) & 0xF;
    let mode = (1 << 24)
        + ((xdiv - 1) << 18)
        + (xmul.saturating_sub(1) << 8)
        + (xpppp << 4)
        + (xosc << 2);
    u32::try_from(mode).unwrap_or(u32::MAX)
}

/// Clock divider for the FPGA image.
pub fn fpga_clock_mode(clock_freq: u32) -> u32 {
    (clock_freq / 312_500).saturating_sub(1)
}

/// Chip loader bit timing: `(bit15_period, bit_period)` in 16.16 clocks,
/// low 10 bits cleared.
pub fn chip_timing(clock_freq: u32, baud: u32) -> (u32, u32) {
    let clk = u64::from(clock_freq);
    let baud = u64::from(baud.max(1));
    let bit = (0x10000 * clk / baud) & !0x3FF;
    let bit15 = (0x18000 * clk / baud) & !0x3FF;
    (
        u32::try_from(bit15).unwrap_or(u32::MAX),
        u32::try_from(bit).unwrap_or(u32::MAX),
    )
}

/// FPGA loader bit timing: `(bit15_cycles, bit_cycles)`.
pub fn fpga_timing(clock_freq: u32, baud: u32, extra_cycles: u32) -> (u32, u32) {
    let clk = u64::from(clock_freq);
    let baud = u64::from(baud.max(1));
    let extra = u64::from(extra_cycles);
    let bit15 = ((3 * clk + baud) / (baud * 2)).saturating_sub(extra);
    let bit = ((clk + baud / 2) / baud).saturating_sub(extra);
    (
        u32::try_from(bit15).unwrap_or(u32::MAX),
        u32::try_from(bit).unwrap_or(u32::MAX),
    )
}
