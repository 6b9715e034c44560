//! caterflash CLI - Command-line tool for flashing Caterina (AVR109) bootloaders.
//!
//! ## Features
//!
//! - Flash Intel HEX images to ATmega32U4 boards (Leonardo, Micro, Pro Micro)
//! - Inspect Intel HEX images
//! - Interactive serial port selection with bootloader auto-detection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use caterflash::DeviceProfile;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use commands::completions::cmd_completions;
use commands::flash::cmd_flash;
use commands::info::{cmd_devices, cmd_info, cmd_list_ports};
use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Device profile used when neither the CLI nor the config names one.
const DEFAULT_DEVICE: &str = "atmega32u4";

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// caterflash - Flash Intel HEX firmware through Caterina bootloaders.
///
/// Environment variables:
///   CATERFLASH_PORT              - Default serial port
///   CATERFLASH_BAUD              - Baud rate (default: 57600)
///   CATERFLASH_DEVICE            - Device profile (default: atmega32u4)
///   CATERFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "caterflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "CATERFLASH_PORT")]
    port: Option<String>,

    /// Baud rate (defaults to the device profile's, 57600 for Caterina).
    #[arg(short, long, global = true, env = "CATERFLASH_BAUD")]
    baud: Option<u32>,

    /// Target device profile (atmega32u4, atmega16u4, leonardo, micro, promicro).
    #[arg(short, long, global = true, env = "CATERFLASH_DEVICE")]
    device: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "CATERFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash an Intel HEX image to a board in bootloader mode.
    Flash {
        /// Path to the Intel HEX file.
        firmware: PathBuf,
    },

    /// Show a summary of an Intel HEX image.
    Info {
        /// Path to the Intel HEX file.
        firmware: PathBuf,

        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// List built-in device profiles.
    Devices {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Invalid usage or setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => match err.downcast_ref::<caterflash::Error>() {
            Some(caterflash::Error::Cancelled { .. }) => 130,
            _ => 1,
        },
    }
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
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

    debug!(
        "caterflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

/// Route Ctrl-C to both the CLI flag and the library's cancellation check.
fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    caterflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash { firmware } => cmd_flash(cli, &mut config, firmware)?,
        Commands::Info { firmware, json } => cmd_info(cli, &config, firmware, *json)?,
        Commands::ListPorts { json } => cmd_list_ports(*json)?,
        Commands::Devices { json } => cmd_devices(*json)?,
        Commands::Completions { shell } => cmd_completions(*shell),
    }

    Ok(())
}

/// Resolve the device profile from CLI, environment and config.
fn resolve_profile(cli: &Cli, config: &Config) -> Result<DeviceProfile> {
    let name = cli
        .device
        .as_deref()
        .or(config.flash.device.as_deref())
        .unwrap_or(DEFAULT_DEVICE);

    let Some(profile) = DeviceProfile::from_name(name) else {
        let known: Vec<String> = DeviceProfile::builtin()
            .into_iter()
            .map(|p| p.name.to_lowercase())
            .collect();
        return Err(CliError::Usage(format!(
            "Unknown device '{name}' (known: {})",
            known.join(", ")
        ))
        .into());
    };

    let profile = config.apply_to_profile(profile);
    let profile = match cli.baud.or(config.port.connection.baud) {
        Some(baud) => profile.with_baud(baud),
        None => profile,
    };

    profile
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;
    Ok(profile)
}

/// Get serial port from CLI args or interactive selection.
fn get_port(cli: &Cli, config: &mut Config, profile: &DeviceProfile) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config, &profile.bootloader_ids)?;

    if !selected.is_known && !cli.non_interactive && options.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
