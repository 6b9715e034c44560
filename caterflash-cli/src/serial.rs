//! Interactive serial port selection.
//!
//! Resolution order:
//! - explicit `--port`
//! - `[port.connection] serial` from the config
//! - auto-detected bootloader ports (built-in USB IDs, the device profile's
//!   IDs and any remembered in the config)
//! - an interactive prompt, never in non-interactive mode

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    caterflash::{BoardKind, DetectedPort, UsbId, UsbMode, detect_ports},
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info, warn},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known bootloader.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured bootloader ID.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Selection failures are setup problems and map to exit code 2.
    CliError::Usage(message.to_string()).into()
}

fn cancelled_err() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Take the only element of `ports`.
fn single(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    ports
        .into_iter()
        .next()
        .ok_or_else(|| usage_err("No serial ports available"))
}

fn select_non_interactive_port(
    selection_ports: Vec<DetectedPort>,
    config: &Config,
    ids: &[UsbId],
) -> Result<SelectedPort> {
    match selection_ports.len().cmp(&1) {
        Ordering::Equal => {
            let port = single(selection_ports)?;
            Ok(SelectedPort {
                is_known: is_known_device(&port, config, ids),
                port,
            })
        },
        Ordering::Greater => Err(usage_err(
            "Found multiple serial ports; pass --port to choose one in non-interactive mode",
        )),
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

/// Select a serial port interactively or automatically.
///
/// `ids` are the bootloader IDs of the selected device profile.
pub fn select_serial_port(
    options: &SerialOptions,
    config: &Config,
    ids: &[UsbId],
) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, config, ids));
    }

    if let Some(port_name) = &config.port.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, config, ids));
    }

    let ports = detect_ports();
    if ports.is_empty() {
        return Err(usage_err(
            "No serial ports found; is the board connected and in bootloader mode?",
        ));
    }

    let selection_ports = candidate_ports(ports, options, config, ids);

    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config, ids);
    }

    match selection_ports.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(selection_ports, config, ids)
        },
        Ordering::Equal => {
            let port = single(selection_ports)?;
            let is_known = is_known_device(&port, config, ids);

            if is_known && !options.confirm_port {
                info!("Auto-selected port: {} [{}]", port.name, port.board.name());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

/// Narrow `ports` to known bootloaders unless asked for all of them.
fn candidate_ports(
    ports: Vec<DetectedPort>,
    options: &SerialOptions,
    config: &Config,
    ids: &[UsbId],
) -> Vec<DetectedPort> {
    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config, ids))
        .cloned()
        .collect();

    if known_ports.is_empty() {
        if let Some(app) = ports
            .iter()
            .find(|p| p.mode == Some(UsbMode::Application))
        {
            warn!(
                "{} on {} is running its sketch; double-tap reset to enter the bootloader",
                app.board.name(),
                app.name
            );
        }
    }

    if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled_err()
            } else {
                usage_err("Port selection prompt failed")
            }
        },
    }
}

/// Find a port by name, falling back to a bare entry for unlisted names.
fn find_port_by_name(name: &str, config: &Config, ids: &[UsbId]) -> SelectedPort {
    let ports = detect_ports();

    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)));

    match found {
        Some(port) => SelectedPort {
            port: port.clone(),
            is_known: is_known_device(port, config, ids),
        },
        None => SelectedPort {
            port: DetectedPort {
                name: name.to_string(),
                board: BoardKind::Unknown,
                mode: None,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            },
            is_known: false,
        },
    }
}

/// Check if a port is a bootloader we know how to talk to.
fn is_known_device(port: &DetectedPort, config: &Config, ids: &[UsbId]) -> bool {
    if port.is_bootloader() {
        return true;
    }

    port.usb_id()
        .is_some_and(|id| ids.contains(&id) || config.is_known_usb(id))
}

/// Display label for a port in the selection list.
fn port_label(port: &DetectedPort, is_known: bool) -> String {
    let name = if is_known {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = match (port.board.is_known(), port.mode, port.usb_id()) {
        (true, Some(UsbMode::Bootloader), _) => {
            format!(" [{}]", style(format!("{}, bootloader", port.board.name())).yellow())
        },
        (true, _, _) => format!(" [{}]", style(port.board.name()).yellow()),
        (false, _, Some(id)) => format!(" ({id})"),
        (false, _, None) => String::new(),
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

/// Interactive port selection.
fn select_port_interactive(
    mut ports: Vec<DetectedPort>,
    config: &Config,
    ids: &[UsbId],
) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!(
        "{}",
        style("Bootloader ports are shown in bold").dim()
    );

    // Known devices first
    ports.sort_by_key(|p| !is_known_device(p, config, ids));

    let term_width = usize::from(console::Term::stderr().size().1);
    let max_item_width = term_width.saturating_sub(4);
    let port_names: Vec<String> = ports
        .iter()
        .map(|port| {
            let label = port_label(port, is_known_device(port, config, ids));
            console::truncate_str(&label, max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the board's serial port")
        .items(&port_names)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config, ids);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(cancelled_err()),
    }
}

/// Confirm use of a single unrecognized port.
fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled_err())
    }
}

/// Ask user if they want to remember this port's USB ID as a bootloader.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let Some(id) = port.usb_id() else {
        return Ok(());
    };
    if config.is_known_usb(id) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {id} as a bootloader for auto-detection?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(id) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}
