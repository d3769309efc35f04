use histfs::{FileStructureOnDisk, FileStructureOptions, OpenMode, SubFileName};

use crate::error::{CliError, Context};

/// Validate that `args` has exactly `expected` elements.
pub fn expect_args(args: &[String], expected: usize, usage: &str) -> Result<(), CliError> {
    if args.len() != expected {
        Err(CliError::new(format!("Usage: {}", usage)))
    } else {
        Ok(())
    }
}

/// Parse the value following a `--flag` at `args[*i]`, advancing `i`.
pub fn numeric_option<T: std::str::FromStr>(
    args: &[String],
    i: &mut usize,
    flag: &str,
) -> Result<T, CliError> {
    *i += 1;
    args.get(*i)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CliError::new(format!("{} requires a numeric argument", flag)))
}

/// Open an existing file structure.
pub fn open_file(path: &str, mode: OpenMode) -> Result<FileStructureOnDisk, CliError> {
    FileStructureOnDisk::open_file(path, mode, FileStructureOptions::default())
        .context(format!("Error opening file structure '{}'", path))
}

/// Sub-file names on the command line are labels hashed into 16-byte names.
pub fn sub_file_name(label: &str) -> SubFileName {
    SubFileName::from_label(label)
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
