//! Forensic Evidence Aggregation & Integrity Engine
//!
//! This crate turns raw per-frame detector output and camera health metrics
//! into a forensically defensible incident timeline.
//!
//! # Architecture
//!
//! The engine enforces five guarantees by construction:
//!
//! 1. **Chain of custody**: every evidence file is hashed and appended to an
//!    append-only ledger before any analysis runs on it.
//! 2. **Edge-triggered tamper events**: lens covering and lighting attacks
//!    surface as discrete CoverStart/CoverEnd intervals, never per-frame noise.
//! 3. **Deduplicated incidents**: one continuous appearance of a track yields
//!    exactly one incident record, regardless of how many frames observed it.
//! 4. **Deterministic timelines**: identical inputs produce byte-identical
//!    ordered output, independent of arrival order.
//! 5. **Sign after freeze**: the report hash covers finalized content only;
//!    signing never precedes content finalization.
//!
//! # Module Structure
//!
//! - `ingest`: evidence file hashing and record construction
//! - `ledger`: append-only custody ledger with membership verification
//! - `tamper`: hysteresis state machine over sharpness/brightness samples
//! - `aggregate`: per-track detection windowing and identity matching
//! - `timeline`: merge of tamper + detection streams into incident records
//! - `report`: canonical report content and integrity binding
//! - `crypto`: signing identities and domain-separated signatures
//! - `detect`: seam to external detectors (replay sources, test stubs)
//! - `pipeline`: per-case driver wiring the above together

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod aggregate;
pub mod config;
pub mod crypto;
pub mod detect;
pub mod ingest;
pub mod ledger;
pub mod pipeline;
pub mod report;
pub mod tamper;
pub mod timeline;
pub mod ui;

pub use aggregate::{
    similarity_percent, DetectionAggregator, DetectionWindow, IdentityCandidate, TrackObservation,
};
pub use config::EngineConfig;
pub use crypto::{sign_report_hash, verify_report_signature, SigningIdentity};
pub use detect::{
    FrameMetrics, JsonlMetricSource, JsonlObservationSource, MetricSource, ObservationSource,
    ScriptedMetrics, ScriptedObservations,
};
pub use ingest::{hash_bytes_sha256, hash_file_sha256};
pub use ledger::{
    shared, CsvEvidenceLedger, EvidenceLedger, InMemoryEvidenceLedger, LedgerEntry, SharedLedger,
};
pub use pipeline::{CaseAnalysis, CasePipeline, RunDiagnostics, StreamInfo};
pub use report::{CaseReport, IntegrityResult, ReportIntegrityBinder};
pub use tamper::{MetricSample, TamperEvent, TamperEventKind, TamperStateMachine};
pub use timeline::{IncidentKind, IncidentRecord, IncidentTimelineBuilder, TimelineSummary};

// -------------------- Object classes --------------------

/// Classes of tracked objects the aggregator distinguishes.
///
/// The external tracker reports free-form class strings; anything that is not
/// a person or a recognized vehicle type maps to `Other`.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectClass {
    Person,
    Car,
    Motorcycle,
    Bus,
    Truck,
    Other,
}

impl ObjectClass {
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "person" => ObjectClass::Person,
            "car" => ObjectClass::Car,
            "motorcycle" => ObjectClass::Motorcycle,
            "bus" => ObjectClass::Bus,
            "truck" => ObjectClass::Truck,
            _ => ObjectClass::Other,
        }
    }

    pub fn is_vehicle(self) -> bool {
        matches!(
            self,
            ObjectClass::Car | ObjectClass::Motorcycle | ObjectClass::Bus | ObjectClass::Truck
        )
    }
}

// -------------------- Evidence records --------------------

/// One ingested evidence file. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Basename of the evidence file as received.
    pub filename: String,
    /// Hex-encoded SHA-256 of the file content.
    pub content_hash: String,
    /// UTC ingest timestamp, ISO-8601.
    pub ingest_time: chrono::DateTime<chrono::Utc>,
    pub camera_id: String,
    /// Footage duration in seconds, when the container reports one.
    pub duration_seconds: Option<f64>,
    /// Free-form metadata (file size, frame count, resolution, ...).
    pub metadata: BTreeMap<String, String>,
}

/// Normalized bounding box reported by the external tracker.
///
/// Carried through observations for the report assembler; the engine itself
/// never interprets pixel geometry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}
