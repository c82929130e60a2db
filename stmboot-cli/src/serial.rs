//! Serial connection settings.
//!
//! Resolves the port, line settings and target layout from the command
//! line, `STMBOOT_*` environment variables (through clap) and the config
//! files, in that order of precedence.

use {
    crate::{Cli, CliError, config::Config},
    anyhow::Result,
    log::debug,
    std::time::Duration,
    stmboot::{Parity, SerialConfig, SessionOptions, protocol::APP_SECTOR_COUNT},
};

/// Default baud rate.
pub const DEFAULT_BAUD: u32 = 115200;

/// Default read timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default application start address (sector 2).
pub const DEFAULT_APP_ADDRESS: u32 = 0x0800_8000;

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Serial port configuration.
    pub serial: SerialConfig,
    /// Session tunables.
    pub options: SessionOptions,
    /// Application start address.
    pub app_address: u32,
    /// Verify after flashing.
    pub verify: bool,
}

fn usage_err(message: impl Into<String>) -> anyhow::Error {
    CliError::Usage(message.into()).into()
}

/// Resolve settings from CLI arguments and configuration.
pub fn resolve_settings(cli: &Cli, config: &Config) -> Result<Settings> {
    let port = cli
        .port
        .clone()
        .or_else(|| config.connection.port.clone())
        .ok_or_else(|| {
            usage_err(
                "No serial port specified (use --port, STMBOOT_PORT, or [connection] port in stmboot.toml)",
            )
        })?;

    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(DEFAULT_BAUD);
    if baud == 0 {
        return Err(usage_err("Baud rate must be greater than zero"));
    }

    let timeout_ms = cli
        .timeout_ms
        .or(config.connection.timeout_ms)
        .unwrap_or(DEFAULT_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(usage_err("Timeout must be greater than zero"));
    }

    let parity = cli
        .parity
        .map(Parity::from)
        .or(config.connection.parity)
        .unwrap_or_default();

    let erase_sectors = config
        .target
        .erase_sectors
        .unwrap_or(APP_SECTOR_COUNT);
    if erase_sectors == 0 {
        return Err(usage_err("erase_sectors must be at least 1"));
    }

    let settings = Settings {
        serial: SerialConfig::new(port, baud)
            .with_timeout(Duration::from_millis(timeout_ms))
            .with_parity(parity),
        options: SessionOptions::default().with_erase_sectors(erase_sectors),
        app_address: config
            .target
            .app_address
            .unwrap_or(DEFAULT_APP_ADDRESS),
        verify: config.target.verify.unwrap_or(true),
    };
    debug!("Resolved settings: {settings:?}");
    Ok(settings)
}
