//! loadp2 CLI - Command-line loader for Propeller 2 microcontrollers.
//!
//! ## Features
//!
//! - Load raw binaries and ELF executables, alone or as multi-file chains
//! - Automatic target discovery across serial ports
//! - CHIP, FPGA, SINGLE and SPI-FLASH load modes
//! - Post-load scripts and a terminal pass-through
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use loadp2::{LoadStrategy, ResetLine};
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars should be drawn (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the operator pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures that map to a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the operator (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Exit code for a failed run.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => match err.downcast_ref::<loadp2::Error>() {
            Some(loadp2::Error::Cancelled) => 130,
            _ => 1,
        },
    }
}

/// loadp2 - Load programs into Propeller 2 microcontrollers.
///
/// Environment variables:
///   LOADP2_PORT              - Serial port to use
///   LOADP2_BAUD              - User (terminal) baud rate (default: 115200)
///   LOADP2_LOADER_BAUD       - Baud rate while loading
///   LOADP2_CLOCK_FREQ        - Target clock frequency in Hz
///   LOADP2_STUB_DIR          - Directory with the loader stub binaries
///   LOADP2_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "loadp2")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    loadp2 load blink.bin -t\n  \
    loadp2 -p /dev/ttyUSB0 load prog.elf,@8000=data.bin -- arg1 arg2\n  \
    loadp2 load --mode spi-flash app.bin")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (searched for if not specified).
    #[arg(short, long, global = true, env = "LOADP2_PORT")]
    pub port: Option<String>,

    /// Port name prefix for the automatic search.
    #[arg(long, global = true, value_name = "PREFIX")]
    pub prefix: Option<String>,

    /// User baud rate, used after loading.
    #[arg(short, long, global = true, env = "LOADP2_BAUD")]
    pub baud: Option<u32>,

    /// Baud rate used while loading.
    #[arg(short, long, global = true, env = "LOADP2_LOADER_BAUD")]
    pub loader_baud: Option<u32>,

    /// Target clock frequency in Hz.
    #[arg(short = 'f', long, global = true, env = "LOADP2_CLOCK_FREQ")]
    pub clock_freq: Option<u32>,

    /// Clock mode word in hex (derived from the frequency if not given).
    #[arg(short = 'm', long, global = true, value_parser = parse_hex_u32)]
    pub clock_mode: Option<u32>,

    /// Control line wired to the reset pin.
    #[arg(long, global = true, value_enum)]
    pub reset_line: Option<ResetPin>,

    /// Do not pulse reset before probing.
    #[arg(long, global = true)]
    pub no_reset: bool,

    /// Host receive FIFO size, lengthens waits on slow adapters.
    #[arg(long, global = true, value_name = "BYTES")]
    pub fifo_size: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Non-interactive mode (never prompt).
    #[arg(long, global = true, env = "LOADP2_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Reset line choices.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum ResetPin {
    /// Data Terminal Ready (default).
    Dtr,
    /// Request To Send.
    Rts,
}

impl From<ResetPin> for ResetLine {
    fn from(pin: ResetPin) -> Self {
        match pin {
            ResetPin::Dtr => ResetLine::Dtr,
            ResetPin::Rts => ResetLine::Rts,
        }
    }
}

/// Load mode override.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum Mode {
    /// Fast chip loader.
    Chip,
    /// FPGA simulation loader.
    Fpga,
    /// ROM hex loader only.
    Single,
    /// Program the SPI flash.
    SpiFlash,
}

impl From<Mode> for LoadStrategy {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Chip => LoadStrategy::Chip,
            Mode::Fpga => LoadStrategy::Fpga,
            Mode::Single => LoadStrategy::Single,
            Mode::SpiFlash => LoadStrategy::SpiFlash,
        }
    }
}

/// Options of the `load` command.
#[derive(clap::Args, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct LoadArgs {
    /// Files to load: FILE or a chain such as prog.bin,@8000=data.bin,@9000+table.bin
    pub files: String,

    /// Arguments passed to the program (after --).
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Directory with MainLoader_chip.bin, MainLoader_fpga.bin and flash_loader.bin.
    #[arg(long, env = "LOADP2_STUB_DIR", value_name = "DIR")]
    pub stub_dir: Option<PathBuf>,

    /// Force a load mode instead of asking the chip.
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Load address in hex for files without an explicit @address.
    #[arg(short, long, value_parser = parse_hex_u32)]
    pub address: Option<u32>,

    /// Patch clock frequency, clock mode and baud into the program header.
    #[arg(long)]
    pub patch: bool,

    /// Do not clear hub memory before loading.
    #[arg(long)]
    pub no_zero: bool,

    /// Do not verify SINGLE and SPI-FLASH loads.
    #[arg(long)]
    pub no_checksum: bool,

    /// Stage the himem helper before the program.
    #[arg(long)]
    pub himem: bool,

    /// FPGA loader timing overhead in cycles.
    #[arg(short = 'X', long, value_name = "CYCLES")]
    pub extra_cycles: Option<u32>,

    /// Script to run after loading, e.g. "recv(ready)send[go^M]".
    #[arg(short, long, value_name = "SCRIPT")]
    pub script: Option<String>,

    /// Enter the terminal after loading.
    #[arg(short, long)]
    pub terminal: bool,

    /// Wait for Enter before exiting.
    #[arg(short = 'k', long)]
    pub wait: bool,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Load a program into the P2.
    Load(LoadArgs),

    /// Find a P2 and report its version and load mode.
    Probe {
        /// Output the result as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Open a terminal on the port at the user baud rate.
    Terminal,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse hexadecimal value (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            // Second Ctrl-C: give up on a clean shutdown.
            std::process::exit(130);
        }
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    loadp2::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<u8> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Load(args) => commands::load::cmd_load(cli, &config, args),
        Commands::Probe { json } => {
            commands::probe::cmd_probe(cli, &config, *json)?;
            Ok(0)
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(0)
        },
        Commands::Terminal => commands::terminal::cmd_terminal(cli, &config),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)?;
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: loadp2 completions bash \
                         (or use --install to auto-detect)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
            }
            Ok(0)
        },
    }
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "loadp2 v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}
