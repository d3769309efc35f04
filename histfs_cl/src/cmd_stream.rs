use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::time::Instant;

use histfs::{BinarySessionFactory, OpenMode};

use crate::error::{CliResult, Context};
use crate::helpers::{expect_args, format_bytes, open_file, sub_file_name};

/// Bytes copied per step when exporting; the stored length is not trusted
/// for sizing a buffer.
const EXPORT_CHUNK: usize = 64 * 1024;

/// Store a local file as a blob: `u64` length followed by the bytes.
pub fn cmd_put(args: &[String]) -> CliResult {
    expect_args(args, 3, "histfs put <file> <local-file> <name>")?;

    let local_file = &args[1];
    let name = &args[2];

    let data = fs::read(local_file).context(format!("Error reading '{}'", local_file))?;

    let structure = open_file(&args[0], OpenMode::Write)?;
    let edit = structure.begin_edit().context("Error starting edit")?;
    let stream = edit
        .create_file(sub_file_name(name))
        .context(format!("Error creating sub-file '{}'", name))?;

    let t0 = Instant::now();
    {
        let mut bs = stream.create_binary_stream()?;
        bs.write_u64(data.len() as u64)
            .and_then(|()| bs.write_all(&data))
            .context("Error writing sub-file")?;
    }
    drop(stream);
    edit.commit().context("Error committing")?;

    let elapsed = t0.elapsed().as_secs_f64();
    let mb = data.len() as f64 / (1024.0 * 1024.0);
    println!(
        "Imported {} from {} to {} ({:.1} MB/s)",
        format_bytes(data.len() as u64),
        local_file,
        name,
        mb / elapsed.max(f64::EPSILON)
    );
    Ok(())
}

/// Write a blob stored by `put` to a local file.
pub fn cmd_get(args: &[String]) -> CliResult {
    expect_args(args, 3, "histfs get <file> <name> <local-file>")?;

    let name = &args[1];
    let local_file = &args[2];

    let structure = open_file(&args[0], OpenMode::Read)?;
    let snapshot = structure.snapshot()?;
    let stream = snapshot
        .open_file_by_name(&sub_file_name(name))
        .context(format!("Error opening sub-file '{}'", name))?;

    let mut bs = stream.create_binary_stream()?;
    let length = bs.read_u64().context("Error reading blob length")?;

    let file = File::create(local_file).context(format!("Error creating '{}'", local_file))?;
    let mut out = BufWriter::new(file);
    let mut chunk = vec![0u8; EXPORT_CHUNK];
    let mut left = length;
    while left > 0 {
        let n = left.min(EXPORT_CHUNK as u64) as usize;
        let read = bs.read_exact(&mut chunk[..n]).context(format!(
            "Error reading sub-file at byte {} of {}",
            length - left,
            length
        ));
        if let Err(e) = read {
            drop(out);
            let _ = fs::remove_file(local_file);
            return Err(e);
        }
        out.write_all(&chunk[..n])
            .context(format!("Error writing '{}'", local_file))?;
        left -= n as u64;
    }
    out.flush().context(format!("Error writing '{}'", local_file))?;

    println!("Exported {} from {} to {}", format_bytes(length), name, local_file);
    Ok(())
}
