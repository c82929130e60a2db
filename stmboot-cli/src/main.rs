//! stmboot CLI - Command-line tool for the STM32 UART bootloader.
//!
//! ## Features
//!
//! - Identify the bootloader version and chip
//! - Read memory to a hex dump or a file
//! - Erase, write and verify the application region
//! - Start the application
//! - Configuration files and environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars should be drawn (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors that map to a specific exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad arguments or missing settings (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

const EXAMPLES: &str = "\
Examples:
  stmboot -p /dev/ttyUSB0 info
  stmboot -p /dev/ttyUSB0 read 0x08000000 256
  stmboot -p /dev/ttyUSB0 --parity even flash app.bin
  STMBOOT_PORT=COM3 stmboot flash app.bin --no-go";

/// stmboot - Talk to the STM32 UART bootloader.
///
/// Environment variables:
///   STMBOOT_PORT   - Default serial port
///   STMBOOT_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "stmboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = EXAMPLES)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "STMBOOT_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "STMBOOT_BAUD")]
    baud: Option<u32>,

    /// Parity (the factory ROM bootloader needs even) [default: none].
    #[arg(long, global = true, value_enum)]
    parity: Option<ParityArg>,

    /// Read timeout in milliseconds [default: 1000].
    #[arg(long, global = true, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Serial parity options.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ParityArg {
    /// No parity.
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

impl From<ParityArg> for stmboot::Parity {
    fn from(parity: ParityArg) -> Self {
        match parity {
            ParityArg::None => stmboot::Parity::None,
            ParityArg::Even => stmboot::Parity::Even,
            ParityArg::Odd => stmboot::Parity::Odd,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show bootloader version and chip id.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Read device memory.
    Read {
        /// Start address (decimal or 0x hex).
        #[arg(value_parser = parse_address)]
        address: u32,

        /// Number of bytes to read.
        #[arg(value_parser = parse_length)]
        length: usize,

        /// Write the raw bytes to a file instead of printing a hex dump.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a binary file to (already erased) flash.
    Write {
        /// Binary file to write.
        file: PathBuf,

        /// Target address [default: application start].
        #[arg(short, long, value_parser = parse_address)]
        address: Option<u32>,

        /// Read the data back and compare.
        #[arg(long)]
        verify: bool,
    },

    /// Erase the application sectors.
    Erase,

    /// Start the application.
    Go {
        /// Entry address [default: application start].
        #[arg(short, long, value_parser = parse_address)]
        address: Option<u32>,
    },

    /// Erase, write, verify and start an application image.
    Flash {
        /// Binary file to flash.
        firmware: PathBuf,

        /// Target address [default: application start].
        #[arg(short, long, value_parser = parse_address)]
        address: Option<u32>,

        /// Skip read-back verification.
        #[arg(long)]
        no_verify: bool,

        /// Do not start the application afterwards.
        #[arg(long)]
        no_go: bool,
    },
}

/// Parse a decimal or `0x`-prefixed hex number (underscores allowed).
fn parse_number(s: &str) -> Result<u64, String> {
    let s: String = s.trim().chars().filter(|c| *c != '_').collect();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("Invalid number '{s}': {e}"))
}

/// Parse a 32-bit device address.
fn parse_address(s: &str) -> Result<u32, String> {
    let value = parse_number(s)?;
    u32::try_from(value).map_err(|_| format!("Address 0x{value:X} does not fit in 32 bits"))
}

/// Parse a byte count.
fn parse_length(s: &str) -> Result<usize, String> {
    let value = parse_number(s)?;
    usize::try_from(value).map_err(|_| format!("Length {value} is too large"))
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
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

    debug!(
        "stmboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code(&err)
        },
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Info { json } => commands::info::cmd_info(cli, &config, *json),
        Commands::Read {
            address,
            length,
            output,
        } => commands::read::cmd_read(cli, &config, *address, *length, output.as_deref()),
        Commands::Write {
            file,
            address,
            verify,
        } => commands::flash::cmd_write(cli, &config, file, *address, *verify),
        Commands::Erase => commands::flash::cmd_erase(cli, &config),
        Commands::Go { address } => commands::flash::cmd_go(cli, &config, *address),
        Commands::Flash {
            firmware,
            address,
            no_verify,
            no_go,
        } => commands::flash::cmd_flash(cli, &config, firmware, *address, !*no_verify, !*no_go),
    }
}

/// Route Ctrl-C to the library's interrupt checker.
///
/// A second Ctrl-C exits immediately.
fn install_interrupt_handler() {
    let installed = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!(
            "\n{} stopping after the current step (Ctrl-C again to force)",
            style("Interrupted:").yellow().bold()
        );
    });
    if let Err(e) = installed {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    stmboot::set_interrupt_checker(was_interrupted);
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    match err.downcast_ref::<stmboot::Error>() {
        Some(e) if matches!(e.root(), stmboot::Error::Cancelled) => 130,
        _ => 1,
    }
}
