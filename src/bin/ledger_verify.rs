//! ledger_verify - external verifier for the custody ledger.
//!
//! Proves, without trusting the engine that wrote it, that:
//! - the ledger file is well-formed (header row, column arity, parseable rows)
//! - every content hash is syntactically a SHA-256
//! - a given evidence file's current content matches a recorded ingestion
//!
//! Integrity must be provable from the artifacts alone; this tool shares no
//! state with the pipeline beyond the ledger file itself.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use custody_engine::ui::Ui;
use custody_engine::{hash_file_sha256, CsvEvidenceLedger};

#[derive(Parser, Debug)]
#[command(
    name = "ledger_verify",
    about = "Audit the custody ledger and check evidence file membership"
)]
struct Args {
    /// Path to the custody ledger CSV
    #[arg(long, env = "CUSTODY_LEDGER_PATH", default_value = "custody_ledger.csv")]
    ledger: PathBuf,

    /// Evidence file to re-hash and check against the ledger
    #[arg(long, value_name = "PATH")]
    evidence: Option<PathBuf>,

    /// Verbose output (one line per ledger row)
    #[arg(short, long)]
    verbose: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty);

    let entries = {
        let _stage = ui.stage("Read ledger");
        let ledger = CsvEvidenceLedger::open(&args.ledger)?;
        ledger.read_entries()?
    };

    println!("ledger_verify: checking {}", args.ledger.display());
    println!();

    let mut bad_rows = 0usize;
    for entry in &entries {
        let hash = &entry.record.content_hash;
        let well_formed = hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit());
        if !well_formed {
            bad_rows += 1;
            println!("  row {}: malformed content hash {:?}", entry.index, hash);
        } else if args.verbose {
            println!(
                "  row {}: {} {} camera={} OK",
                entry.index,
                &hash[..16],
                entry.record.filename,
                entry.record.camera_id
            );
        }
    }
    println!("audited {} ledger rows, {} malformed", entries.len(), bad_rows);

    if let Some(evidence) = &args.evidence {
        let current_hash = {
            let _stage = ui.stage("Hash evidence file");
            hash_file_sha256(evidence)?
        };
        let matches: Vec<&custody_engine::LedgerEntry> = entries
            .iter()
            .filter(|entry| entry.record.content_hash == current_hash)
            .collect();
        if matches.is_empty() {
            println!("NOT RECORDED: {} ({})", evidence.display(), &current_hash[..16]);
            return Err(anyhow!(
                "evidence file content does not match any ledger row"
            ));
        }
        println!(
            "RECORDED: {} matches {} ingestion(s):",
            evidence.display(),
            matches.len()
        );
        for entry in matches {
            println!(
                "  row {}: ingested {} camera={}",
                entry.index, entry.record.ingest_time, entry.record.camera_id
            );
        }
    }

    if bad_rows > 0 {
        return Err(anyhow!("{} malformed ledger rows", bad_rows));
    }
    Ok(())
}
