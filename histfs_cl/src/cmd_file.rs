use histfs::{FileStructureOnDisk, FileStructureOptions, OpenMode, SubFileName, DEFAULT_BLOCK_SIZE};

use crate::error::{CliError, CliResult, Context};
use crate::helpers::{expect_args, format_bytes, numeric_option, open_file};

pub fn cmd_create(args: &[String]) -> CliResult {
    const USAGE: &str = "histfs create <file> [--block-size N]";
    if args.is_empty() {
        return Err(CliError::new(format!("Usage: {}", USAGE)));
    }

    let path = &args[0];
    let mut block_size = DEFAULT_BLOCK_SIZE;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--block-size" => block_size = numeric_option(args, &mut i, "--block-size")?,
            other => {
                return Err(CliError::new(format!(
                    "Unknown option: {}. Usage: {}",
                    other, USAGE
                )));
            }
        }
        i += 1;
    }

    FileStructureOnDisk::create_file(path, FileStructureOptions::with_block_size(block_size))
        .context(format!("Error creating file structure '{}'", path))?;
    println!("Created file structure: {} ({}-byte blocks)", path, block_size);
    Ok(())
}

pub fn cmd_info(args: &[String]) -> CliResult {
    expect_args(args, 1, "histfs info <file>")?;

    let fs = open_file(&args[0], OpenMode::Read)?;
    let header = fs.committed_header();
    let file_bytes = header.watermark() as u64 * header.block_size as u64;

    println!("Archive:        {}", SubFileName(header.archive_id));
    println!("Block size:     {} bytes", header.block_size);
    println!("Snapshot:       {}", header.snapshot_sequence);
    println!(
        "Blocks:         {} ({})",
        header.last_allocated_block + 1,
        format_bytes(file_bytes)
    );
    println!("Sub-files:      {}", header.files.len());

    if !header.files.is_empty() {
        println!();
        println!("  {:>5}  {:<36}  {:>10}  {:>10}", "id", "name", "data", "total");
        for file in &header.files {
            println!(
                "  {:>5}  {:<36}  {:>10}  {:>10}",
                file.file_id,
                file.file_name.to_string(),
                file.data_block_count,
                file.total_block_count
            );
        }
    }
    Ok(())
}

pub fn cmd_verify(args: &[String]) -> CliResult {
    expect_args(args, 1, "histfs verify <file>")?;

    let fs = open_file(&args[0], OpenMode::Read)?;
    let issues = fs.verify().context("Error running verify")?;

    if issues.is_empty() {
        println!("OK: no issues found");
        Ok(())
    } else {
        println!("Found {} issue(s):", issues.len());
        for issue in &issues {
            println!("  - {}", issue);
        }
        Err(CliError::new("Verification found issues"))
    }
}
