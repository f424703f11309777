//! ingot-melt: Materialize JSON documents into a state tree
//!
//! Walks each input document into an in-memory tree and prints the result
//! as JSON Lines, one node per line.
//!
//! Usage:
//!   # Read from file, output to stdout
//!   ingot-melt vehicle.json --root car
//!
//!   # Read from stdin
//!   echo '{"odometer": 100, "doors": [{"name": "front", "open": false}]}' | ingot-melt
//!
//!   # Replay a recorded NDJSON poll log with caller options
//!   ingot-melt --ndjson polls.jsonl --options options.json --values-only

// Use MiMalloc allocator for better performance (recommended by simd-json)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use ingot::melt::{Melter, MemoryStore, TreeWriter, WalkOptions};
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ingot-melt")]
#[command(about = "Materialize JSON documents into a state tree", long_about = None)]
struct Args {
    /// Input file (use stdin if omitted)
    #[arg(value_name = "FILE")]
    input: Option<String>,

    /// Root path of the tree
    #[arg(long, default_value = "root")]
    root: String,

    /// Process newline-delimited JSON (one document per line)
    #[arg(long)]
    ndjson: bool,

    /// JSON file with walk options (camelCase keys, e.g. {"preferedArrayName": "vin"})
    #[arg(long, value_name = "FILE")]
    options: Option<String>,

    /// Create writable leaves
    #[arg(long)]
    write: bool,

    /// Name array elements by index only
    #[arg(long)]
    force_index: bool,

    /// Parse string values that contain JSON
    #[arg(long)]
    auto_cast: bool,

    /// Decode base64-encoded string values
    #[arg(long)]
    parse_base64: bool,

    /// Drop keys and containers mentioning a password
    #[arg(long)]
    remove_passwords: bool,

    /// Field expression naming array elements (`a`, `a/b`, `a+b`)
    #[arg(long)]
    prefered_array_name: Option<String>,

    /// Display name of the root container
    #[arg(long)]
    channel_name: Option<String>,

    /// Print only `{"path": value}` lines
    #[arg(long)]
    values_only: bool,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let options = build_options(&args)?;
    let store = Arc::new(MemoryStore::new());
    let melter = Melter::new(Arc::clone(&store));

    let reader: Box<dyn Read> = if let Some(file_path) = &args.input {
        Box::new(BufReader::new(
            File::open(file_path).with_context(|| format!("Failed to open {}", file_path))?,
        ))
    } else {
        Box::new(std::io::stdin())
    };

    let count = if args.ndjson {
        ingot::melt_json(BufReader::new(reader), &args.root, &options, &melter).await?
    } else {
        let value = read_document(reader)?;
        melter.walk_and_wait(args.root.as_str(), value, options).await;
        1
    };

    if count == 0 {
        warn!("No JSON documents found in input");
    }
    info!(documents = count, nodes = store.node_count(), "Melted input");

    let snapshot = store.snapshot();
    let mut writer = TreeWriter::new(std::io::stdout().lock());
    if args.values_only {
        writer.write_values(&snapshot)?;
    } else {
        writer.write_entries(&snapshot)?;
    }
    writer.flush()?;

    Ok(())
}

/// Logs go to stderr so stdout stays clean JSON Lines
fn init_tracing(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

/// Options file first, command-line flags on top
fn build_options(args: &Args) -> Result<WalkOptions> {
    let mut options = match &args.options {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("Failed to open options file {}", path))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("Failed to parse options file {}", path))?
        }
        None => WalkOptions::default(),
    };

    options.write |= args.write;
    options.force_index |= args.force_index;
    options.auto_cast |= args.auto_cast;
    options.parse_base64 |= args.parse_base64;
    options.remove_passwords |= args.remove_passwords;
    if let Some(expr) = &args.prefered_array_name {
        options.prefered_array_name = Some(expr.clone());
    }
    if let Some(name) = &args.channel_name {
        options.channel_name = Some(name.clone());
    }

    Ok(options)
}

/// Read a single document using SIMD-accelerated parsing, falling back to serde_json
fn read_document(reader: Box<dyn Read>) -> Result<Value> {
    let mut content = Vec::new();
    let mut buf_reader = BufReader::new(reader);
    buf_reader.read_to_end(&mut content)?;

    let fallback = content.clone();
    match simd_json::serde::from_slice::<Value>(&mut content) {
        Ok(value) => Ok(value),
        Err(_) => serde_json::from_slice(&fallback).context("Failed to parse JSON"),
    }
}
