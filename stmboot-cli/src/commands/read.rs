//! Memory read command implementation.

use {
    super::{done, run_session, status},
    crate::{Cli, CliError, config::Config, serial::resolve_settings},
    anyhow::{Context, Result},
    std::{fs, path::Path},
};

/// Bytes per hex dump line.
const DUMP_WIDTH: usize = 16;

/// Read command implementation.
pub(crate) fn cmd_read(
    cli: &Cli,
    config: &Config,
    address: u32,
    length: usize,
    output: Option<&Path>,
) -> Result<()> {
    if length == 0 {
        return Err(CliError::Usage("Length must be greater than zero".to_string()).into());
    }
    stmboot::protocol::check_region(address, length)
        .map_err(|e| CliError::Usage(e.to_string()))?;

    let settings = resolve_settings(cli, config)?;
    status(
        cli,
        "→",
        format!(
            "Reading {length} bytes at 0x{address:08X} from {}",
            settings.serial.port_name
        ),
    );

    let data = run_session(&settings, cli.quiet, move |session| {
        session.read_memory(address, length)
    })?;

    match output {
        Some(path) => {
            fs::write(path, &data)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            done(cli, format!("Saved {} bytes to {}", data.len(), path.display()));
        },
        None => print!("{}", hex_dump(address, &data)),
    }
    Ok(())
}

/// Classic hex dump: address, 16 hex bytes, printable ASCII.
#[allow(clippy::cast_possible_truncation)] // Offsets stay inside a checked region
fn hex_dump(address: u32, data: &[u8]) -> String {
    let mut out = String::new();
    for (line_no, line) in data.chunks(DUMP_WIDTH).enumerate() {
        let offset = address.wrapping_add((line_no * DUMP_WIDTH) as u32);
        out.push_str(&format!("{offset:08X}  "));
        for col in 0..DUMP_WIDTH {
            match line.get(col) {
                Some(byte) => out.push_str(&format!("{byte:02X} ")),
                None => out.push_str("   "),
            }
            if col == DUMP_WIDTH / 2 - 1 {
                out.push(' ');
            }
        }
        out.push('|');
        out.extend(line.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                char::from(b)
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_full_line() {
        let dump = hex_dump(0x0800_0000, b"Hello, world!\x00\x01\x02");
        assert_eq!(
            dump,
            "08000000  48 65 6C 6C 6F 2C 20 77  6F 72 6C 64 21 00 01 02 |Hello, world!...|\n"
        );
    }

    #[test]
    fn test_hex_dump_partial_last_line() {
        let data: Vec<u8> = (0..20).collect();
        let dump = hex_dump(0x2000_0000, &data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("20000010  10 11 12 13 "));
        assert!(lines[1].ends_with("|....|"));
        assert_eq!(lines[0].find('|'), lines[1].find('|'));
    }

    #[test]
    fn test_hex_dump_empty() {
        assert!(hex_dump(0, &[]).is_empty());
    }
}
