//! # loadp2
//!
//! A library for loading programs into Parallax Propeller 2 microcontrollers
//! over a serial link.
//!
//! This crate provides:
//!
//! - Raw binary and ELF image construction, multi-file chains and program
//!   arguments blocks
//! - Target discovery and the ROM version handshake
//! - The download engine for the CHIP, FPGA, SINGLE and SPI-FLASH load
//!   strategies, with per-block checksum verification
//! - A small script interpreter for talking to the program after it starts
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use loadp2::{LoadPlan, LoadSources, LoaderStubs, Session, SessionConfig, image::chain};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let config = SessionConfig::default();
//!         let stubs = LoaderStubs::from_dir("stubs")?;
//!         let entries = chain::parse("blink.bin")?;
//!         let sources = LoadSources::read(&entries, &config)?;
//!
//!         let found = loadp2::target::handshake::open_native(None, None, &config)?;
//!         let mut session = Session::new(found.port, config, Some(found.version));
//!         let plan = LoadPlan::for_session(&session, &sources, &stubs)?;
//!         session.load(&plan, &mut |name, sent, total| {
//!             println!("Loading {}: {}/{}", name, sent, total);
//!         })?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod port;
pub mod protocol;
pub mod script;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). It is consulted
/// between probe attempts, between load blocks and inside script waits.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    device::{DetectedPort, DeviceKind},
    error::{Error, Result},
    host::{discover_bridge_ports, discover_ports},
    image::{Image, ImageFormat, ImageOptions, chain::ChainEntry},
    port::{Port, ResetLine, SerialConfig},
    script::Interpreter,
    target::{
        LoadStrategy, Session, SessionConfig,
        loader::{Block, LoadPlan, LoadSources, SourceFile},
        stub::LoaderStubs,
    },
};
