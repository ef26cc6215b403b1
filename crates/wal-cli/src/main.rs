//! Log inspect/replay CLI for debugging store state.

#![deny(unsafe_code)]

use clap::{Parser, Subcommand};
use hivemap::BucketMap;
use hivemap_core::config::MapConfig;
use hivemap_core::value::ValueKind;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use wal::{OpKind, WalReader, WalRecord};

#[derive(Parser, Debug)]
#[command(name = "hivemap-wal", about = "Inspect and replay store mutation logs")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show high-level stats for a log file
    Inspect {
        #[arg(short, long)]
        wal: PathBuf,
        /// Skip CRC verification (framing is still checked)
        #[arg(long, default_value_t = false)]
        no_verify: bool,
    },
    /// Print records and the state a replay would rebuild
    Replay {
        #[arg(short, long)]
        wal: PathBuf,
        /// First transaction id to print
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Last transaction id to print (inclusive)
        #[arg(long, default_value_t = u64::MAX)]
        to: u64,
        /// Stop after this many records (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max: u64,
        /// Print each record instead of only the summary
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Inspect { wal, no_verify } => cmd_inspect(&wal, !no_verify)?,
        Command::Replay { wal, from, to, max, verbose } => {
            cmd_replay(&wal, from, to, max, verbose)?
        }
    }
    Ok(())
}

fn load_records(
    wal: &Path,
    verify: bool,
) -> Result<(Vec<WalRecord>, Option<String>, usize), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(wal)?;
    let mut reader = WalReader::with_verification(&bytes, verify);
    let records: Vec<WalRecord> = reader.by_ref().collect();
    let torn = reader.corruption().map(|e| e.to_string());
    Ok((records, torn, reader.offset()))
}

fn op_name(op: OpKind) -> &'static str {
    match op {
        OpKind::Put => "put",
        OpKind::Remove => "remove",
        OpKind::Clear => "clear",
        OpKind::Checkpoint => "checkpoint",
    }
}

fn cmd_inspect(wal: &Path, verify: bool) -> Result<(), Box<dyn std::error::Error>> {
    let (records, torn, offset) = load_records(wal, verify)?;
    let mut by_op = std::collections::BTreeMap::<&str, usize>::new();
    for rec in &records {
        *by_op.entry(op_name(rec.op)).or_default() += 1;
    }
    let checkpoint_cursor = records.iter().rposition(|r| r.op == OpKind::Checkpoint);
    let out = json!({
        "records": records.len(),
        "by_op": by_op,
        "first_txn": records.first().map(|r| r.txn_id),
        "last_txn": records.last().map(|r| r.txn_id),
        "records_after_last_checkpoint": checkpoint_cursor
            .map_or(records.len(), |i| records.len() - i - 1),
        "intact_bytes": offset,
        "torn_tail": torn,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn cmd_replay(
    wal: &Path,
    from: u64,
    to: u64,
    max: u64,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (records, torn, _) = load_records(wal, true)?;
    let mut map = BucketMap::new(&MapConfig::default());
    let mut printed = 0u64;
    for rec in &records {
        match rec.op {
            OpKind::Put => {
                let kind = rec.value_kind().unwrap_or(ValueKind::Opaque);
                if let Err(e) = map.put(&rec.key, &rec.value, kind) {
                    eprintln!("txn {}: put rejected: {e}", rec.txn_id);
                }
            }
            OpKind::Remove => {
                let _ = map.remove(&rec.key);
            }
            OpKind::Clear => map.clear(),
            OpKind::Checkpoint => {}
        }
        if verbose && rec.txn_id >= from && rec.txn_id <= to && (max == 0 || printed < max) {
            println!(
                "txn={} ts={} op={} key={:?} value_len={}",
                rec.txn_id,
                rec.timestamp_ns,
                op_name(rec.op),
                String::from_utf8_lossy(&rec.key),
                rec.value.len()
            );
            printed += 1;
        }
    }
    let out = json!({
        "records_applied": records.len(),
        "entries": map.len(),
        "buckets": map.bucket_count(),
        "torn_tail": torn,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
