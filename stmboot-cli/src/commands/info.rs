//! Device info command implementation.

use {
    super::{run_session, status},
    crate::{Cli, config::Config, serial::resolve_settings},
    anyhow::Result,
    console::style,
    stmboot::DeviceInfo,
};

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let settings = resolve_settings(cli, config)?;
    if !json {
        status(
            cli,
            "→",
            format!(
                "Using {} @ {} baud",
                settings.serial.port_name, settings.serial.baud_rate
            ),
        );
    }

    let info = run_session(&settings, cli.quiet || json, |session| session.identify())?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "port": settings.serial.port_name,
                "baud": settings.serial.baud_rate,
                "device": info,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    print!("{}", format_info(&info));
    if !info.chip.model.is_known() {
        eprintln!(
            "{} chip id not in the known device table; continuing anyway",
            style("⚠").yellow()
        );
    }
    Ok(())
}

/// Human-readable device summary, one field per line.
fn format_info(info: &DeviceInfo) -> String {
    format!(
        "Bootloader: {} (0x{:02X})\nChip ID:    0x{:08X}\nChip:       {}\n",
        info.version,
        info.version.raw(),
        info.chip.id,
        info.chip.model
    )
}
