//! pathfs command line.
//!
//! Usage:
//!   # Local files, relative to the current directory
//!   pathfs ls . --recursive
//!   pathfs write ./notes.txt --data "hello"
//!
//!   # Virtual files seeded from a directory
//!   pathfs --seed assets cat ~/shaders/blur.glsl
//!
//!   # Print changes under a directory for ten seconds
//!   pathfs watch ./src --seconds 10

use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use pathfs_kernel::{APPEND, ChangeKind, FileRecord, FileSystem, FsConfig, FsView};

/// Inspect and modify the `~` and `.` namespaces.
#[derive(Parser, Debug)]
#[command(name = "pathfs")]
#[command(about = "Unified virtual and local file system")]
struct Args {
    /// RON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the `.` namespace maps to
    #[arg(long)]
    root: Option<PathBuf>,

    /// Directory imported into `~` at startup
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Print records as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show one record
    Stat { path: String },

    /// List the children of a folder
    Ls {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },

    /// Print a file's contents
    Cat {
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Bytes to read, 0 for the rest of the file
        #[arg(long, default_value_t = 0)]
        size: u64,
    },

    /// Write to a file, creating it if needed. Reads stdin without --data.
    Write {
        path: String,
        #[arg(long)]
        data: Option<String>,
        /// Byte offset, appends when omitted
        #[arg(long)]
        offset: Option<u64>,
    },

    /// Create a folder and any missing parents
    Mkdir { path: String },

    /// Remove a file or folder recursively
    Rm { path: String },

    /// Rename within the same folder
    Mv { from: String, to: String },

    /// Print changes under a folder
    Watch {
        dir: String,
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries file contents and records
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FsConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FsConfig::default(),
    };
    if let Some(root) = args.root.clone() {
        config.local_root = root;
    }
    if let Some(seed) = args.seed.clone() {
        config.virtual_seed = Some(seed);
    }

    let fs = FileSystem::open_default(config).context("failed to open file system")?;
    run(&fs, &args)
}

fn run(fs: &FileSystem, args: &Args) -> Result<()> {
    match &args.command {
        Command::Stat { path } => {
            let record = fs.get(path)?;
            print_record(&record, args.json)?;
        }
        Command::Ls { path, recursive } => {
            for record in fs.list(path, *recursive)? {
                print_record(&record, args.json)?;
            }
        }
        Command::Cat { path, offset, size } => {
            let mut buf = Vec::new();
            fs.read(path, &mut buf, *size, *offset)?;
            std::io::stdout().write_all(&buf)?;
        }
        Command::Write { path, data, offset } => {
            let bytes = match data {
                Some(text) => text.clone().into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let mut guard = fs.lock();
            guard.add(path, false)?;
            guard.write(path, &bytes, 0, 0, offset.unwrap_or(APPEND))?;
            let record = guard.get(path)?;
            drop(guard);
            print_record(&record, args.json)?;
        }
        Command::Mkdir { path } => {
            fs.add(path, true)?;
            print_record(&fs.get(path)?, args.json)?;
        }
        Command::Rm { path } => fs.remove(path)?,
        Command::Mv { from, to } => {
            fs.move_to(from, to)?;
            print_record(&fs.get(to)?, args.json)?;
        }
        Command::Watch { dir, seconds } => watch(fs, dir, Duration::from_secs(*seconds), args.json)?,
    }
    Ok(())
}

fn watch(fs: &FileSystem, dir: &str, duration: Duration, json: bool) -> Result<()> {
    fs.on_change(dir, move |_: &FsView<'_>, record: &FileRecord, kind: ChangeKind| {
        if json {
            match serde_json::to_string(&serde_json::json!({ "kind": kind, "record": record })) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "failed to encode change"),
            }
        } else {
            println!("{kind} {}", record.path);
        }
    })?;
    tracing::info!(dir = %dir, seconds = duration.as_secs(), "watching");

    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
    }

    fs.remove_file_change_callback(dir)?;
    Ok(())
}

fn print_record(record: &FileRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(record)?);
    } else {
        let kind = if record.is_folder { "dir" } else { "file" };
        let mode = match (record.access.read, record.access.write) {
            (true, true) => "rw",
            (true, false) => "r-",
            (false, true) => "-w",
            (false, false) => "--",
        };
        println!("{kind:<4} {mode} {:>10} {}", record.size, record.path);
    }
    Ok(())
}
