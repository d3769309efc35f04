mod bench;
mod cmd_file;
mod cmd_stream;
mod error;
mod helpers;

use std::env;
use std::process::ExitCode;

use crate::error::CliResult;

/// Metadata for a single command, used for dispatch and help generation.
struct CommandEntry {
    name: &'static str,
    usage: &'static str,
    description: &'static str,
    run: fn(&[String]) -> CliResult,
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// All commands. Order here = order in help output.
const COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        name: "create",
        usage: "histfs create <file> [--block-size N]",
        description: "Create a new, empty file structure",
        run: cmd_file::cmd_create,
    },
    CommandEntry {
        name: "info",
        usage: "histfs info <file>",
        description: "Show the committed header and sub-file table",
        run: cmd_file::cmd_info,
    },
    CommandEntry {
        name: "put",
        usage: "histfs put <file> <local-file> <name>",
        description: "Store a local file in a new sub-file",
        run: cmd_stream::cmd_put,
    },
    CommandEntry {
        name: "get",
        usage: "histfs get <file> <name> <local-file>",
        description: "Export a sub-file stored with put",
        run: cmd_stream::cmd_get,
    },
    CommandEntry {
        name: "verify",
        usage: "histfs verify <file>",
        description: "Verify the committed snapshot",
        run: cmd_file::cmd_verify,
    },
    CommandEntry {
        name: "bench",
        usage: "histfs bench [--block-size N] [--count N]",
        description: "Sequential write/read throughput in memory and on disk",
        run: bench::cmd_bench,
    },
];

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some((cmd_name, cmd_args)) = args.split_first() else {
        print_usage();
        return ExitCode::FAILURE;
    };

    match cmd_name.as_str() {
        "--help" | "-h" => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        "--version" | "-V" => {
            println!("histfs {}", VERSION);
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    let Some(cmd) = COMMANDS.iter().find(|c| c.name == cmd_name.as_str()) else {
        eprintln!("Unknown command: {}", cmd_name);
        print_usage();
        return ExitCode::FAILURE;
    };

    match (cmd.run)(cmd_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("histfs {}: {}", cmd.name, e);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    eprintln!("Usage: histfs <command> [args...]");
    eprintln!();
    eprintln!("Commands:");

    let max_usage_len = COMMANDS.iter().map(|c| c.usage.len()).max().unwrap_or(0);
    for cmd in COMMANDS {
        eprintln!(
            "  {:<width$}  {}",
            cmd.usage,
            cmd.description,
            width = max_usage_len
        );
    }

    eprintln!();
    eprintln!("Options:");
    eprintln!("  --help, -h       Show this help message");
    eprintln!("  --version, -V    Show version");
}
