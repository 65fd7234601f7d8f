//! # shvar Monitor
//!
//! Operator tool for a shared variable segment: list what is registered,
//! read and write values, change persistence, remove idle variables and
//! tear the segment down.
//!
//! # Usage
//!
//! ```bash
//! # Everything in the default segment
//! shvar_monitor list
//!
//! # Machine-readable listing of another segment
//! shvar_monitor --segment plant_vars list -o json
//!
//! # Flip a flag every attached process sees
//! shvar_monitor set stopRunning true
//!
//! # Follow a value until Ctrl+C
//! shvar_monitor watch loggerLevel --interval-ms 200
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use shvar_common::config::{ConfigError, LogLevel, MonitorConfig};
use shvar_registry::{Registry, ShmError, TypeTable, TypeTag, VarEntry, VarInfo};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{Level, debug, error, info};
use tracing_subscriber::EnvFilter;

/// shvar Monitor - inspect and edit shared variables
#[derive(Parser, Debug)]
#[command(name = "shvar_monitor")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Inspect and edit the variables of a shvar segment")]
#[command(long_about = None)]
struct Args {
    /// Path to a monitor configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Segment name, overrides config and environment
    #[arg(short, long)]
    segment: Option<String>,

    /// Directory of the backing file, overrides config and environment
    #[arg(long, value_name = "DIR")]
    shm_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every variable with its current value
    List {
        #[arg(short, long, value_enum, default_value_t = Output::Table)]
        output: Output,
    },
    /// Print the value of one variable
    Get { name: String },
    /// Parse and store a new value
    Set { name: String, value: String },
    /// Remove a variable nobody is attached to
    Remove { name: String },
    /// Mark a variable persistent, or clear the mark with --off
    Persist {
        name: String,
        #[arg(long)]
        off: bool,
    },
    /// Segment and allocator statistics
    Stats {
        #[arg(short, long, value_enum, default_value_t = Output::Table)]
        output: Output,
    },
    /// Registered type tags
    Types,
    /// Print a value whenever it changes, until Ctrl+C
    Watch {
        name: String,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Delete the backing object; attached processes keep their mapping
    Unlink,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Output {
    Table,
    Json,
}

#[derive(Debug, Error)]
enum MonitorError {
    #[error(transparent)]
    Registry(#[from] ShmError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Segment does not exist: {}", .0.display())]
    MissingSegment(PathBuf),

    #[error("Variable not found: {0}")]
    NotFound(String),

    #[error("'{text}' is not a valid {type_name} for '{name}'")]
    BadValue {
        name: String,
        type_name: &'static str,
        text: String,
    },

    #[error("No text parser for type tag {tag} of '{name}'")]
    NoParser { name: String, tag: TypeTag },

    #[error("Variable '{0}' is still attached")]
    Busy(String),

    #[error("JSON output failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signal handler setup failed: {0}")]
    Signal(#[from] ctrlc::Error),
}

/// One listing row
#[derive(Debug, Serialize)]
struct Row {
    #[serde(flatten)]
    info: VarInfo,
    type_name: &'static str,
    value: String,
}

fn main() {
    let args = Args::parse();
    let config = MonitorConfig::resolve(args.config.as_deref());
    let configured = config
        .as_ref()
        .map_or(LogLevel::default(), |config| config.shared.log_level);
    setup_tracing(&args, configured);

    let result = config
        .map_err(MonitorError::from)
        .and_then(|config| run(args, config));
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args, mut config: MonitorConfig) -> Result<(), MonitorError> {
    if let Some(segment) = args.segment {
        config.registry.segment_name = segment;
    }
    if let Some(dir) = args.shm_dir {
        config.registry.shm_dir = dir;
    }
    config.registry.validate()?;
    debug!("Using segment {}", config.registry.segment_path().display());

    if let Command::Unlink = args.command {
        if Registry::unlink(&config.registry)? {
            println!("unlinked {}", config.registry.segment_path().display());
        } else {
            println!("nothing to unlink at {}", config.registry.segment_path().display());
        }
        return Ok(());
    }

    // Never create a segment just to look at it.
    let path = config.registry.segment_path();
    if !path.exists() {
        return Err(MonitorError::MissingSegment(path));
    }
    let registry = Registry::open(&config.registry)?;

    match args.command {
        Command::List { output } => {
            let rows = rows(&registry)?;
            match output {
                Output::Table => print!("{}", render_table(&rows)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Command::Get { name } => println!("{}", read_value(&registry, &name)?),
        Command::Set { name, value } => {
            write_value(&registry, &name, &value)?;
            info!("{} = {}", name, read_value(&registry, &name)?);
        }
        Command::Remove { name } => {
            if registry.exists(&name)?.is_none() {
                return Err(MonitorError::NotFound(name));
            }
            if !registry.remove(&name)? {
                return Err(MonitorError::Busy(name));
            }
            info!("Removed '{}'", name);
        }
        Command::Persist { name, off } => {
            registry.set_persistent(&name, !off)?;
            info!("'{}' persistent: {}", name, !off);
        }
        Command::Stats { output } => {
            let stats = registry.stats()?;
            match output {
                Output::Table => {
                    println!("segment          {}", stats.segment_name);
                    println!("capacity         {} bytes", stats.capacity);
                    println!(
                        "creator pid      {} ({})",
                        stats.creator_pid,
                        if stats.creator_alive { "alive" } else { "gone" }
                    );
                    println!(
                        "records          {} of {} slots ({} persistent, {} referenced)",
                        stats.records,
                        stats.record_capacity,
                        stats.persistent_records,
                        stats.referenced_records
                    );
                    println!(
                        "heap             {} used / {} free of {} bytes, {} allocations",
                        stats.heap.used_bytes,
                        stats.heap.free_bytes,
                        stats.heap.total_bytes,
                        stats.heap.allocations
                    );
                    println!(
                        "fragmentation    {} free blocks, largest {} bytes",
                        stats.heap.free_blocks, stats.heap.largest_free
                    );
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }
        }
        Command::Types => {
            for entry in registry.types().entries() {
                println!("{:>6}  {:<12} {:>3} bytes", entry.tag, entry.name, entry.size);
            }
        }
        Command::Watch { name, interval_ms } => watch(&registry, &name, interval_ms)?,
        Command::Unlink => {}
    }

    Ok(())
}

fn type_name(types: &TypeTable, tag: TypeTag) -> &'static str {
    types.entry(tag).map_or("?", |entry| entry.name)
}

fn rows(registry: &Registry) -> Result<Vec<Row>, MonitorError> {
    rows_of(registry, registry.list_all()?)
}

/// Current values for `entries`. Variables reclaimed since the listing are
/// left out.
fn rows_of(registry: &Registry, entries: Vec<VarEntry>) -> Result<Vec<Row>, MonitorError> {
    let types = registry.types();
    let mut rows = Vec::with_capacity(entries.len());
    for entry in entries {
        let (info, bytes) = match registry.read_var(&entry.info.name) {
            Ok(current) => current,
            Err(ShmError::NotFound { name }) => {
                debug!("'{}' disappeared while listing", name);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        rows.push(Row {
            type_name: type_name(types, info.type_tag),
            value: types.render(info.type_tag, &bytes),
            info,
        });
    }
    Ok(rows)
}

/// `NotFound` from the registry becomes the monitor's own `NotFound`.
fn lookup_error(name: &str, e: ShmError) -> MonitorError {
    match e {
        ShmError::NotFound { .. } => MonitorError::NotFound(name.to_string()),
        other => other.into(),
    }
}

fn render_table(rows: &[Row]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<24} {:<12} {:>5} {:>4} {:<4} {:<24} DESCRIPTION",
        "NAME", "TYPE", "SIZE", "REFS", "P", "VALUE"
    );
    for row in rows {
        let _ = writeln!(
            out,
            "{:<24} {:<12} {:>5} {:>4} {:<4} {:<24} {}",
            row.info.name.as_str(),
            row.type_name,
            row.info.size,
            row.info.ref_count,
            if row.info.persistent { "yes" } else { "-" },
            row.value,
            row.info.description.as_str()
        );
    }
    out
}

fn read_value(registry: &Registry, name: &str) -> Result<String, MonitorError> {
    let (info, bytes) = registry
        .read_var(name)
        .map_err(|e| lookup_error(name, e))?;
    Ok(registry.types().render(info.type_tag, &bytes))
}

fn write_value(registry: &Registry, name: &str, text: &str) -> Result<(), MonitorError> {
    let info = registry
        .exists(name)?
        .ok_or_else(|| MonitorError::NotFound(name.to_string()))?;
    let types = registry.types();

    let entry = types
        .entry(info.type_tag)
        .filter(|entry| entry.parser.is_some())
        .ok_or_else(|| MonitorError::NoParser {
            name: name.to_string(),
            tag: info.type_tag,
        })?;
    let bytes = types
        .parse(info.type_tag, text)
        .ok_or_else(|| MonitorError::BadValue {
            name: name.to_string(),
            type_name: entry.name,
            text: text.to_string(),
        })?;

    registry
        .write_bytes(name, &bytes)
        .map_err(|e| lookup_error(name, e))
}

fn watch(registry: &Registry, name: &str, interval_ms: u64) -> Result<(), MonitorError> {
    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })?;

    let mut last = None;
    while running.load(Ordering::SeqCst) {
        match read_value(registry, name) {
            Ok(value) => {
                if last.as_ref() != Some(&value) {
                    println!("{name} = {value}");
                    last = Some(value);
                }
            }
            Err(MonitorError::NotFound(_)) => {
                println!("{name} removed");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        std::thread::sleep(Duration::from_millis(interval_ms));
    }

    info!("Watch of '{}' stopped", name);
    Ok(())
}

/// Level from the configuration, raised to debug by `--verbose`.
fn log_level(verbose: bool, configured: LogLevel) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    configured.as_str().parse().unwrap_or(Level::INFO)
}

/// Setup tracing subscriber based on CLI arguments and configuration.
fn setup_tracing(args: &Args, configured: LogLevel) {
    let level = log_level(args.verbose, configured);

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
