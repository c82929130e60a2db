//! Flash, write, erase and go command implementations.

use anyhow::{Context, Result};
use console::style;
use std::fs;
use std::path::Path;

use super::{checkpoint, done, run_session, status};
use crate::config::Config;
use crate::serial::{Settings, resolve_settings};
use crate::{Cli, CliError};

/// Load an application image, rejecting empty files.
fn load_image(path: &Path) -> Result<Vec<u8>> {
    let data =
        fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!("Image {} is empty", path.display())).into());
    }
    Ok(data)
}

fn announce_port(cli: &Cli, settings: &Settings) {
    status(
        cli,
        "→",
        format!(
            "Using {} @ {} baud",
            settings.serial.port_name, settings.serial.baud_rate
        ),
    );
}

/// Write command implementation.
pub(crate) fn cmd_write(
    cli: &Cli,
    config: &Config,
    file: &Path,
    address: Option<u32>,
    verify: bool,
) -> Result<()> {
    let data = load_image(file)?;
    let settings = resolve_settings(cli, config)?;
    let address = address.unwrap_or(settings.app_address);
    stmboot::protocol::check_region(address, data.len())
        .map_err(|e| CliError::Usage(e.to_string()))?;

    announce_port(cli, &settings);
    status(
        cli,
        "→",
        format!(
            "Writing {} ({} bytes) to 0x{address:08X}",
            file.display(),
            data.len()
        ),
    );

    let len = data.len();
    run_session(&settings, cli.quiet, move |session| {
        session.write_memory(address, &data)?;
        if verify {
            checkpoint()?;
            session.verify_memory(address, &data)?;
        }
        Ok(())
    })?;

    if verify {
        done(cli, format!("Wrote and verified {len} bytes"));
    } else {
        done(cli, format!("Wrote {len} bytes"));
    }
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &Config) -> Result<()> {
    let settings = resolve_settings(cli, config)?;
    announce_port(cli, &settings);
    status(
        cli,
        "→",
        format!(
            "Erasing {} application sectors",
            settings.options.erase.sector_count
        ),
    );

    run_session(&settings, cli.quiet, |session| session.erase())?;

    done(cli, "Erase complete");
    Ok(())
}

/// Go command implementation.
pub(crate) fn cmd_go(cli: &Cli, config: &Config, address: Option<u32>) -> Result<()> {
    let settings = resolve_settings(cli, config)?;
    let address = address.unwrap_or(settings.app_address);
    announce_port(cli, &settings);

    run_session(&settings, cli.quiet, move |session| session.go(address))?;

    done(cli, format!("Application started at 0x{address:08X}"));
    Ok(())
}

/// Flash command implementation: identify, erase, write, verify, go.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    address: Option<u32>,
    verify: bool,
    go: bool,
) -> Result<()> {
    let data = load_image(firmware)?;
    let settings = resolve_settings(cli, config)?;
    let address = address.unwrap_or(settings.app_address);
    let verify = verify && settings.verify;
    stmboot::protocol::check_region(address, data.len())
        .map_err(|e| CliError::Usage(e.to_string()))?;

    announce_port(cli, &settings);
    status(
        cli,
        "→",
        format!(
            "Flashing {} ({} bytes) to 0x{address:08X}",
            firmware.display(),
            data.len()
        ),
    );

    let len = data.len();
    let info = run_session(&settings, cli.quiet, move |session| {
        let info = session.identify()?;
        checkpoint()?;
        session.erase()?;
        session.write_memory(address, &data)?;
        if verify {
            checkpoint()?;
            session.verify_memory(address, &data)?;
        }
        if go {
            checkpoint()?;
            session.go(address)?;
        }
        Ok(info)
    })?;

    if !cli.quiet {
        eprintln!("  {} {info}", style("•").dim());
    }
    if !info.chip.model.is_known() {
        log::warn!("Chip id 0x{:08X} is not in the known device table", info.chip.id);
    }
    done(
        cli,
        format!(
            "Flashed {len} bytes{}{}",
            if verify { ", verified" } else { "" },
            if go { ", application started" } else { "" }
        ),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.bin");
        fs::write(&path, [0xDE_u8, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(load_image(&path).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_load_image_empty_is_usage_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        fs::write(&path, b"").unwrap();

        let err = load_image(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_load_image_missing_file() {
        let dir = tempdir().unwrap();
        let err = load_image(&dir.path().join("missing.bin")).unwrap_err();
        assert!(err.to_string().contains("Failed to read image"));
    }
}
