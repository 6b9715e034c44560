//! Image info, port listing and device listing.

use anyhow::{Context, Result};
use caterflash::device::format_port_list;
use caterflash::{DeviceProfile, MemoryImage, auto_detect_port, detect_ports};
use console::style;
use std::path::Path;

use crate::config::Config;
use crate::{Cli, resolve_profile};

/// Fraction of the image holding programmed (non-0xFF) bytes, in percent.
fn fill_percent(image: &MemoryImage) -> f64 {
    if image.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = image.programmed_bytes() as f64 / image.len() as f64;
    ratio * 100.0
}

fn format_address(address: Option<u32>) -> String {
    address.map_or_else(|| "-".to_string(), |a| format!("0x{a:08X}"))
}

/// Show a summary of an Intel HEX image.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, firmware: &Path, json: bool) -> Result<()> {
    let profile = resolve_profile(cli, config)?;
    let image = MemoryImage::from_file(firmware, profile.flash_size)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let pages = image.page_count(profile.page_size);

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "file": firmware.display().to_string(),
                "device": profile.name,
                "capacity": profile.flash_size,
                "length": image.len(),
                "page_size": profile.page_size,
                "pages": pages,
                "programmed_bytes": image.programmed_bytes(),
                "fill_percent": fill_percent(&image),
                "start_segment_address": image.start_segment_address(),
                "start_linear_address": image.start_linear_address(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", style(firmware.display()).bold().underlined());
    println!("  Device:          {profile}");
    println!(
        "  Length:          {} bytes (0x{:04X})",
        image.len(),
        image.len()
    );
    println!("  Pages:           {pages} x {} bytes", profile.page_size);
    println!(
        "  Programmed:      {} bytes ({:.1}%)",
        image.programmed_bytes(),
        fill_percent(&image)
    );
    #[allow(clippy::cast_precision_loss)]
    let used = image.len() as f64 / profile.flash_size as f64 * 100.0;
    println!("  Flash used:      {used:.1}% of {} bytes", profile.flash_size);
    println!(
        "  Start segment:   {}",
        format_address(image.start_segment_address())
    );
    println!(
        "  Start linear:    {}",
        format_address(image.start_linear_address())
    );

    Ok(())
}

/// List available serial ports.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "board": p.board.name(),
                    "known": p.board.is_known(),
                    "bootloader": p.is_bootloader(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for (port, line) in detected.iter().zip(format_port_list(&detected)) {
        let bullet = if port.is_bootloader() {
            style("•").green()
        } else {
            style("•").dim()
        };
        eprintln!("  {bullet} {line}");
    }

    if let Ok(port) = auto_detect_port(&caterflash::device::bootloader_usb_ids()) {
        eprintln!();
        eprintln!(
            "{} Bootloader detected: {} [{}]",
            style("✓").green(),
            style(&port.name).cyan(),
            port.board.name()
        );
    }

    Ok(())
}

/// List built-in device profiles.
pub(crate) fn cmd_devices(json: bool) -> Result<()> {
    let profiles = DeviceProfile::builtin();

    if json {
        let devices: Vec<serde_json::Value> = profiles
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "flash_size": p.flash_size,
                    "page_size": p.page_size,
                    "baud_rate": p.baud_rate,
                    "bootloader_ids": p
                        .bootloader_ids
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "devices": devices,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for profile in &profiles {
        println!("{}", style(profile).bold());
        if profile.bootloader_ids.is_empty() {
            println!("    bootloader IDs: {}", style("none (pass --port)").dim());
        } else {
            let ids: Vec<String> = profile
                .bootloader_ids
                .iter()
                .map(ToString::to_string)
                .collect();
            println!("    bootloader IDs: {}", ids.join(", "));
        }
    }

    Ok(())
}
