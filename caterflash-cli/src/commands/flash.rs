//! Flash command implementation.

use anyhow::{Context, Result};
use caterflash::{DeviceSelector, MemoryImage, flash_image};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, get_port, resolve_profile, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Turn a failed session into a CLI error, warning about half-written flash.
fn flash_failure(err: caterflash::Error) -> anyhow::Error {
    let phase = err.phase();

    if matches!(err, caterflash::Error::Cancelled { .. }) || was_interrupted() {
        return CliError::Cancelled(format!("Flashing cancelled during {phase}: {err}")).into();
    }

    if err.may_have_partial_flash() {
        eprintln!(
            "{} The board may hold a partially written image; reset it into the bootloader and flash again",
            style("⚠").yellow()
        );
    }

    anyhow::Error::from(err).context(format!("Flashing failed during {phase}"))
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &mut Config, firmware: &Path) -> Result<()> {
    ensure_not_interrupted()?;
    let profile = resolve_profile(cli, config)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let text = fs::read_to_string(firmware)
        .with_context(|| format!("Failed to read {}", firmware.display()))?;

    // Decoded once here; a bad file never touches the board
    let image = MemoryImage::from_ihex_str(&text, profile.flash_size)
        .with_context(|| format!("Failed to parse {}", firmware.display()))?;
    if image.is_empty() {
        return Err(caterflash::Error::EmptyImage)
            .with_context(|| format!("Nothing to flash in {}", firmware.display()));
    }

    if !cli.quiet {
        eprintln!(
            "{} {} bytes in {} pages of {} bytes for {}",
            style("ℹ").blue(),
            image.len(),
            image.page_count(profile.page_size),
            profile.page_size,
            profile.name
        );
    }

    let port = get_port(cli, config, &profile)?;
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            port,
            profile.baud_rate
        );
    }
    ensure_not_interrupted()?;

    let selector = DeviceSelector::port(port.clone())
        .with_session(config.session_config(&profile))
        .with_profile(profile);

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.set_message("flashing");
        pb
    };

    let result = flash_image(&image, &selector, |percent| {
        pb.set_position(u64::from(percent));
    });
    if let Err(err) = result {
        pb.abandon();
        return Err(flash_failure(err));
    }

    pb.finish_with_message("complete");

    if !cli.quiet {
        eprintln!(
            "\n{} Flashed {} bytes to {}",
            style("🎉").green().bold(),
            image.len(),
            port
        );
    }

    Ok(())
}
