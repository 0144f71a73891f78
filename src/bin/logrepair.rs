//! Out-of-band CLI wrapper around `changelog::repair` (§4.2, §6 exit codes).
//!
//! Exit codes: 0 success, 1 usage error, 2 fatal I/O or unrecoverable
//! corruption.

use clap::Parser;
use diskmeta::changelog::repair::repair;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "logrepair", about = "Repair a damaged change-log journal")]
struct Cli {
    /// Path to the (possibly corrupt) source change log.
    src: PathBuf,
    /// Path of the repaired output log. Must not already exist.
    dst: PathBuf,
    /// Print a progress line after every record decision.
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    let verbose = cli.verbose;
    let result = repair(&cli.src, &cli.dst, |stats| {
        if verbose {
            eprintln!(
                "scanned={} healthy={} bytes_accepted={} bytes_discarded={}",
                stats.scanned, stats.healthy, stats.bytes_accepted, stats.bytes_discarded
            );
        }
    });

    match result {
        Ok(stats) => {
            println!(
                "repaired {}: {} of {} records kept, {} bytes discarded",
                cli.dst.display(),
                stats.healthy,
                stats.scanned,
                stats.bytes_discarded
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("logrepair: {e}");
            ExitCode::from(2)
        }
    }
}
