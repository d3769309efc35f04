use std::time::Instant;

use histfs::{
    BinarySessionFactory, DiskMedium, FileStructureOnDisk, FileStructureOptions,
    InMemoryFileStructure, SubFileName, TransactionalFileStructure, DEFAULT_BLOCK_SIZE,
};

use crate::error::{CliError, CliResult, Context};
use crate::helpers::{format_bytes, numeric_option};

const BENCH_FILE: &str = "_bench.hfs";
const DEFAULT_COUNT: u64 = 4_000_000;

// ---------------------------------------------------------------------------
// Cleanup guard: deletes temp file on drop (even on panic)
// ---------------------------------------------------------------------------

struct CleanupGuard<'a> {
    path: &'a str,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.path);
    }
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

struct BenchArgs {
    block_size: usize,
    count: u64,
}

fn parse_bench_args(args: &[String]) -> Result<BenchArgs, CliError> {
    let mut block_size = DEFAULT_BLOCK_SIZE;
    let mut count = DEFAULT_COUNT;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--block-size" => block_size = numeric_option(args, &mut i, "--block-size")?,
            "--count" => count = numeric_option(args, &mut i, "--count")?,
            other => {
                print_bench_usage();
                return Err(CliError::new(format!("Unknown option: {}", other)));
            }
        }
        i += 1;
    }

    Ok(BenchArgs { block_size, count })
}

fn print_bench_usage() {
    eprintln!("Usage: histfs bench [--block-size N] [--count N]");
    eprintln!();
    eprintln!("Writes N u64 values sequentially in one edit, commits, then reads them");
    eprintln!("back from a snapshot. Runs once in memory and once on disk.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --block-size N   Block size in bytes (default: 4096)");
    eprintln!("  --count N        Number of u64 values (default: 4000000)");
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn cmd_bench(args: &[String]) -> CliResult {
    let a = parse_bench_args(args)?;
    let bytes = a.count * 8;
    eprintln!(
        "Sequential u64 write/read: {} values ({}), {}-byte blocks",
        a.count,
        format_bytes(bytes),
        a.block_size
    );

    eprintln!("  [memory]");
    let fs = InMemoryFileStructure::create_in_memory(FileStructureOptions::with_block_size(
        a.block_size,
    ))
    .context("Error creating in-memory structure")?;
    run_sequential(&fs, a.count)?;
    drop(fs);

    eprintln!("  [disk]");
    let _ = std::fs::remove_file(BENCH_FILE);
    let _guard = CleanupGuard { path: BENCH_FILE };
    let fs = FileStructureOnDisk::create_file(
        BENCH_FILE,
        FileStructureOptions::with_block_size(a.block_size),
    )
    .context("Error creating benchmark file")?;
    run_sequential(&fs, a.count)?;
    let issues = fs.verify().context("Error verifying benchmark file")?;
    if !issues.is_empty() {
        return Err(CliError::new(format!(
            "Benchmark file failed verification: {}",
            issues.join("; ")
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn report(label: &str, bytes: u64, seconds: f64) {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    eprintln!(
        "    {:<8} {:>9.1} ms  {:>8.1} MB/s",
        label,
        seconds * 1000.0,
        mb / seconds.max(f64::EPSILON)
    );
}

fn run_sequential<M: DiskMedium>(fs: &TransactionalFileStructure<M>, count: u64) -> CliResult {
    let name = SubFileName::from_label("bench");

    let t0 = Instant::now();
    let edit = fs.begin_edit()?;
    {
        let stream = edit.create_file(name)?;
        let mut bs = stream.create_binary_stream()?;
        for i in 0..count {
            bs.write_u64(i)?;
        }
    }
    edit.commit().context("Error committing benchmark data")?;
    report("write", count * 8, t0.elapsed().as_secs_f64());

    let t0 = Instant::now();
    let snapshot = fs.snapshot()?;
    let stream = snapshot.open_file_by_name(&name)?;
    let mut bs = stream.create_binary_stream()?;
    for i in 0..count {
        let value = bs.read_u64()?;
        if value != i {
            return Err(CliError::new(format!(
                "Benchmark read back {} at index {}, expected {}",
                value, i, i
            )));
        }
    }
    report("read", count * 8, t0.elapsed().as_secs_f64());
    Ok(())
}
