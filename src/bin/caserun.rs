//! caserun - run one evidence file through the full custody pipeline.
//!
//! Inference happens upstream: the detector/tracker and metric extractor
//! write their per-frame output as JSONL, and this tool replays those
//! streams through the engine. The result is a time-ordered incident
//! timeline, summary counts, and a report document bound by a content hash
//! and signature.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use custody_engine::pipeline::StreamInfo;
use custody_engine::ui::Ui;
use custody_engine::{
    CasePipeline, CaseReport, CsvEvidenceLedger, EngineConfig, JsonlMetricSource,
    JsonlObservationSource, ReportIntegrityBinder,
};

#[derive(Parser, Debug)]
#[command(
    name = "caserun",
    about = "Ingest one evidence file, aggregate detections, and emit a signed incident report"
)]
struct Args {
    /// Evidence file (video) to ingest and analyze
    evidence: PathBuf,

    /// Detector observations, JSONL, one observation per line
    #[arg(long, value_name = "PATH")]
    observations: PathBuf,

    /// Tamper metrics, JSONL, one sampled frame per line
    #[arg(long, value_name = "PATH")]
    metrics: PathBuf,

    /// Total frame count of the evidence stream
    #[arg(long)]
    frames: u64,

    /// Frames per second of the evidence stream
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    #[arg(long, env = "CUSTODY_CASE_ID")]
    case_id: String,

    #[arg(long, env = "CUSTODY_INVESTIGATOR")]
    investigator: String,

    #[arg(long, default_value = "unknown")]
    camera_id: String,

    /// Write the report + integrity result JSON here instead of stdout
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty);

    let cfg = {
        let _stage = ui.stage("Load configuration");
        EngineConfig::load()?
    };

    let ledger = {
        let _stage = ui.stage("Open custody ledger");
        custody_engine::ledger::shared(CsvEvidenceLedger::open(&cfg.ledger_path)?)
    };

    let (mut observations, mut metrics) = {
        let _stage = ui.stage("Load detector streams");
        (
            JsonlObservationSource::load(&args.observations)?,
            JsonlMetricSource::load(&args.metrics)?,
        )
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|e| anyhow!("failed to install cancellation handler: {}", e))?;

    let binder = ReportIntegrityBinder::from_config(
        cfg.signing_seed_path.as_deref(),
        &format!("custody-engine case {}", args.case_id),
    );

    let analysis = {
        let _stage = ui.stage("Analyze evidence stream");
        let pipeline = CasePipeline::new(cfg);
        pipeline.run(
            &args.evidence,
            &args.camera_id,
            StreamInfo {
                total_frames: args.frames,
                fps: args.fps,
            },
            &ledger,
            &mut observations,
            &mut metrics,
            &cancel,
        )?
    };

    if analysis.cancelled {
        eprintln!(
            "cancelled after {} frames; ledger row {} is durable, no report emitted",
            analysis.frames_processed, analysis.ledger_entry.index
        );
        std::process::exit(2);
    }

    let (report, integrity) = {
        let _stage = ui.stage("Bind and sign report");
        let report = CaseReport::from_analysis(&args.case_id, &args.investigator, &analysis);
        let content = report.canonical_bytes()?;
        let integrity = binder.bind(&content);
        (report, integrity)
    };

    if !integrity.is_signed() {
        eprintln!(
            "WARNING: report is unsigned: {}",
            integrity
                .signing_error
                .as_deref()
                .unwrap_or("unknown signing failure")
        );
    }

    let output = serde_json::json!({
        "report": report,
        "integrity": integrity,
    });
    let rendered = serde_json::to_string_pretty(&output)?;
    match &args.out {
        Some(path) => std::fs::write(path, rendered)
            .map_err(|e| anyhow!("failed to write report {}: {}", path.display(), e))?,
        None => println!("{rendered}"),
    }

    eprintln!(
        "{} incidents ({} tamper interval(s)), {} degraded frame(s)",
        report.incidents.len(),
        report.summary.tamper_intervals,
        report.diagnostics.degraded_frames
    );
    Ok(())
}
