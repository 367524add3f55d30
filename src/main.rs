//! kvtx-sweep - finish or clean up stale transactions
//!
//! Opens a file store data directory and sweeps every transaction in its log
//! table once: stale pending transactions are rolled back, unfinished
//! completions are re-driven and old finished records are deleted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use kvtx::storage::FileStore;
use kvtx::transaction::{TransactionConfig, TransactionManager};
use tracing_subscriber::EnvFilter;

struct Options {
    data: PathBuf,
    rollback_after: Duration,
    delete_after: Duration,
    config: TransactionConfig,
    verbose: bool,
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => return ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{}", message);
            eprintln!("Run with --help for usage.");
            return ExitCode::FAILURE;
        }
    };

    let filter = if options.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    let mut options = Options {
        data: PathBuf::from(".kvtx"),
        rollback_after: Duration::from_secs(60),
        delete_after: Duration::from_secs(24 * 60 * 60),
        config: TransactionConfig::default(),
        verbose: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-d" | "--data" => {
                options.data = PathBuf::from(value(args, &mut i)?);
            }
            "--rollback-after-ms" => {
                options.rollback_after = millis(value(args, &mut i)?)?;
            }
            "--delete-after-ms" => {
                options.delete_after = millis(value(args, &mut i)?)?;
            }
            "--log-table" => {
                options.config.log_table = value(args, &mut i)?.to_string();
            }
            "--image-table" => {
                options.config.image_table = value(args, &mut i)?.to_string();
            }
            "-v" | "--verbose" => {
                options.verbose = true;
            }
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "--version" => {
                println!("kvtx-sweep v{}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            arg => return Err(format!("Unknown option: {}", arg)),
        }
        i += 1;
    }
    Ok(Some(options))
}

/// The argument following a flag.
fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} needs a value", flag))
}

fn millis(raw: &str) -> Result<Duration, String> {
    raw.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| format!("not a number of milliseconds: {}", raw))
}

fn run(options: Options) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::open(&options.data)?;
    let manager = TransactionManager::with_config(store, options.config);
    manager.ensure_tables()?;

    let report = manager.sweep_all(options.rollback_after, options.delete_after)?;
    println!("{}: {}", options.data.display(), report);
    Ok(())
}

fn print_help() {
    println!("kvtx-sweep - finish or clean up stale transactions");
    println!();
    println!("Usage: kvtx-sweep [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -d, --data DIR             Data directory (default: .kvtx)");
    println!("  --rollback-after-ms N      Roll back pending transactions idle this long (default: 60000)");
    println!("  --delete-after-ms N        Delete finished transactions this old (default: 86400000)");
    println!("  --log-table NAME           Transaction log table (default: Transactions)");
    println!("  --image-table NAME         Item image table (default: TransactionImages)");
    println!("  -v, --verbose              Log every protocol step");
    println!("  -h, --help                 Show this help message");
    println!("  --version                  Show version");
}
