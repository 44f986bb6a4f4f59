//! Per-case pipeline driver.
//!
//! One evidence file per run: hash and ledger-append first (fatal on
//! failure, so analysis never runs on unlogged evidence), then a strictly
//! sequential frame loop feeding the tamper state machine and the person and
//! vehicle aggregators in non-decreasing frame order, then timeline
//! assembly. Detector and metric failures on individual frames are
//! non-fatal and accumulate into the run diagnostics.
//!
//! Multiple cases may run concurrently as independent pipelines; the shared
//! ledger handle serializes appends.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::aggregate::DetectionAggregator;
use crate::config::EngineConfig;
use crate::detect::{MetricSource, ObservationSource};
use crate::ledger::{LedgerEntry, SharedLedger};
use crate::tamper::{MetricSample, TamperEvent, TamperStateMachine};
use crate::timeline::{IncidentRecord, IncidentTimelineBuilder, TimelineSummary};
use crate::EvidenceRecord;

/// Non-fatal degradation observed during a run. Nothing here is ever
/// silently dropped: every skipped frame or sample is counted and noted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Frames where the external detector failed; treated as zero
    /// observations.
    pub degraded_frames: u64,
    /// Samples where tamper metrics were unavailable; the state machine
    /// never saw them.
    pub skipped_metric_samples: u64,
    pub notes: Vec<String>,
}

impl RunDiagnostics {
    fn degraded_frame(&mut self, frame: u64, cause: &str) {
        self.degraded_frames += 1;
        self.notes.push(format!("frame {frame}: detector failed: {cause}"));
        warn!("frame {frame}: detector failed: {cause}");
    }

    fn skipped_sample(&mut self, frame: u64, cause: Option<&str>) {
        self.skipped_metric_samples += 1;
        match cause {
            Some(cause) => {
                self.notes.push(format!("frame {frame}: metrics failed: {cause}"));
                warn!("frame {frame}: metrics failed: {cause}");
            }
            None => self.notes.push(format!("frame {frame}: metrics unavailable")),
        }
    }
}

/// Facts about the evidence stream the decoder reported.
#[derive(Clone, Copy, Debug)]
pub struct StreamInfo {
    pub total_frames: u64,
    pub fps: f64,
}

impl StreamInfo {
    pub fn duration_seconds(&self) -> f64 {
        self.total_frames as f64 / self.fps.max(1.0)
    }

    fn timestamp_s(&self, frame: u64) -> f64 {
        frame as f64 / self.fps.max(1.0)
    }
}

/// Everything a report assembler needs about one analyzed case.
#[derive(Clone, Debug)]
pub struct CaseAnalysis {
    pub evidence: EvidenceRecord,
    pub ledger_entry: LedgerEntry,
    pub ledger_verified: bool,
    pub tamper_events: Vec<TamperEvent>,
    pub incidents: Vec<IncidentRecord>,
    pub summary: TimelineSummary,
    pub diagnostics: RunDiagnostics,
    /// True when the run was cancelled between frame iterations. All open
    /// windows were still closed and the ledger row is durable.
    pub cancelled: bool,
    pub frames_processed: u64,
}

pub struct CasePipeline {
    cfg: EngineConfig,
}

impl CasePipeline {
    pub fn new(cfg: EngineConfig) -> Self {
        Self { cfg }
    }

    /// Run one case end to end. Cancellation is honored between frame
    /// iterations only, never mid-update of a window or the tamper state.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        evidence_path: impl AsRef<Path>,
        camera_id: &str,
        stream: StreamInfo,
        ledger: &SharedLedger,
        observations: &mut dyn ObservationSource,
        metrics: &mut dyn MetricSource,
        cancel: &AtomicBool,
    ) -> Result<CaseAnalysis> {
        let mut metadata = BTreeMap::new();
        metadata.insert("frame_count".to_string(), stream.total_frames.to_string());
        metadata.insert("fps".to_string(), format!("{:.3}", stream.fps));
        let evidence = EvidenceRecord::from_file(
            &evidence_path,
            camera_id,
            Some(stream.duration_seconds()),
            metadata,
        )?;

        let (ledger_entry, ledger_verified) = {
            let mut guard = ledger
                .lock()
                .map_err(|_| anyhow!("custody ledger lock poisoned"))?;
            let entry = guard.append(&evidence)?;
            let verified = guard.verify(&evidence.content_hash)?;
            (entry, verified)
        };

        let mut diagnostics = RunDiagnostics::default();
        let mut tamper = TamperStateMachine::new(
            self.cfg.sharpness_threshold,
            self.cfg.brightness_ratio_threshold,
            self.cfg.persistence_samples,
        );
        let mut people = DetectionAggregator::new(self.cfg.gap_frames, self.cfg.match_tolerance);
        let mut vehicles = DetectionAggregator::new(self.cfg.gap_frames, self.cfg.match_tolerance);

        let mut tamper_events: Vec<TamperEvent> = Vec::new();
        let mut cancelled = false;
        let mut frames_processed = 0u64;
        let mut last_timestamp_s = 0.0f64;

        let mut frame = 0u64;
        while frame < stream.total_frames {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }
            let timestamp_s = stream.timestamp_s(frame);

            match metrics.metrics_for_sample(frame) {
                Ok(Some(m)) => {
                    tamper_events.extend(tamper.observe(MetricSample {
                        frame,
                        timestamp_s,
                        sharpness: m.sharpness,
                        brightness: m.brightness,
                    }));
                }
                Ok(None) => diagnostics.skipped_sample(frame, None),
                Err(e) => diagnostics.skipped_sample(frame, Some(&e.to_string())),
            }

            let batch = match observations.observations_for_frame(frame) {
                Ok(batch) => batch,
                Err(e) => {
                    diagnostics.degraded_frame(frame, &e.to_string());
                    Vec::new()
                }
            };
            let mut person_batch = Vec::new();
            let mut vehicle_batch = Vec::new();
            for mut obs in batch {
                obs.timestamp_s = timestamp_s;
                if obs.class == crate::ObjectClass::Person {
                    person_batch.push(obs);
                } else if obs.class.is_vehicle() {
                    vehicle_batch.push(obs);
                }
            }
            people.observe(frame, &person_batch);
            vehicles.observe(frame, &vehicle_batch);

            frames_processed += 1;
            last_timestamp_s = timestamp_s;
            frame += self.cfg.sample_stride;
        }

        let open_cover = tamper.finish();
        let stream_end_s = open_cover
            .map(|sample| sample.timestamp_s)
            .unwrap_or(last_timestamp_s);

        let mut builder = IncidentTimelineBuilder::new();
        builder.add_tamper_events(&tamper_events, Some(stream_end_s));
        builder.add_person_windows(&people.finish());
        builder.add_vehicle_windows(&vehicles.finish());
        let (incidents, summary) = builder.build();

        Ok(CaseAnalysis {
            evidence,
            ledger_entry,
            ledger_verified,
            tamper_events,
            incidents,
            summary,
            diagnostics,
            cancelled,
            frames_processed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{IdentityCandidate, TrackObservation};
    use crate::detect::{ScriptedMetrics, ScriptedObservations};
    use crate::ledger::{shared, InMemoryEvidenceLedger};
    use crate::timeline::IncidentKind;
    use crate::{BoundingBox, ObjectClass};
    use std::io::Write;
    use std::sync::atomic::AtomicBool;

    fn evidence_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("cam01.mp4");
        std::fs::File::create(&path)
            .and_then(|mut f| f.write_all(b"not a real container"))
            .expect("write evidence");
        path
    }

    fn config() -> EngineConfig {
        EngineConfig {
            sample_stride: 1,
            ..EngineConfig::default()
        }
    }

    fn obs(track_id: i64, class: ObjectClass, frame: u64, candidate: Option<(&str, f64)>) -> TrackObservation {
        TrackObservation {
            track_id,
            class,
            frame,
            timestamp_s: 0.0,
            bbox: BoundingBox::default(),
            candidates: candidate
                .map(|(reference_id, distance)| {
                    vec![IdentityCandidate {
                        reference_id: reference_id.to_string(),
                        distance,
                    }]
                })
                .unwrap_or_default(),
        }
    }

    #[test]
    fn end_to_end_produces_ledgered_timeline() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = shared(InMemoryEvidenceLedger::new());

        let mut observations = ScriptedObservations::new();
        for frame in 10..14 {
            observations.push(obs(1, ObjectClass::Person, frame, Some(("ref:alice", 0.2))));
        }
        observations.push(obs(2, ObjectClass::Car, 50, Some(("KA01AB1234", 0.1))));

        let mut metrics = ScriptedMetrics::new();
        for frame in 0..100u64 {
            let sharpness = if (30..=40).contains(&frame) { 1.0 } else { 40.0 };
            metrics.set(frame, sharpness, 120.0);
        }

        let pipeline = CasePipeline::new(config());
        let analysis = pipeline.run(
            evidence_file(&dir),
            "cam01",
            StreamInfo {
                total_frames: 100,
                fps: 10.0,
            },
            &ledger,
            &mut observations,
            &mut metrics,
            &AtomicBool::new(false),
        )?;

        assert!(analysis.ledger_verified);
        assert!(!analysis.cancelled);
        assert_eq!(analysis.frames_processed, 100);
        assert_eq!(analysis.summary.tamper_intervals, 1);
        assert_eq!(analysis.summary.identities_matched, 1);
        assert_eq!(analysis.summary.distinct_vehicles, 1);
        assert_eq!(analysis.summary.vehicles_with_plate, 1);
        assert_eq!(analysis.incidents.len(), 3);
        assert_eq!(analysis.diagnostics.degraded_frames, 0);

        let kinds: Vec<IncidentKind> =
            analysis.incidents.iter().map(|incident| incident.kind).collect();
        assert_eq!(
            kinds,
            vec![IncidentKind::Person, IncidentKind::Tamper, IncidentKind::Vehicle]
        );
        Ok(())
    }

    #[test]
    fn detector_failures_degrade_but_do_not_abort() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = shared(InMemoryEvidenceLedger::new());

        let mut observations = ScriptedObservations::new();
        observations.fail_at(3);
        observations.fail_at(4);
        let mut metrics = ScriptedMetrics::new();
        for frame in 0..10u64 {
            metrics.set(frame, 40.0, 120.0);
        }
        metrics.fail_at(7);

        let pipeline = CasePipeline::new(config());
        let analysis = pipeline.run(
            evidence_file(&dir),
            "cam01",
            StreamInfo {
                total_frames: 10,
                fps: 10.0,
            },
            &ledger,
            &mut observations,
            &mut metrics,
            &AtomicBool::new(false),
        )?;

        assert_eq!(analysis.diagnostics.degraded_frames, 2);
        assert_eq!(analysis.diagnostics.skipped_metric_samples, 1);
        assert_eq!(analysis.diagnostics.notes.len(), 3);
        Ok(())
    }

    #[test]
    fn metric_gaps_leave_hysteresis_counter_untouched() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = shared(InMemoryEvidenceLedger::new());

        // Two bad samples, a gap, then one more bad sample: the gap must not
        // reset the counter, so the third bad sample still triggers.
        let mut metrics = ScriptedMetrics::new();
        metrics.set(0, 40.0, 120.0);
        metrics.set(1, 1.0, 120.0);
        metrics.set(2, 1.0, 120.0);
        metrics.set(4, 1.0, 120.0);

        let pipeline = CasePipeline::new(config());
        let analysis = pipeline.run(
            evidence_file(&dir),
            "cam01",
            StreamInfo {
                total_frames: 5,
                fps: 10.0,
            },
            &ledger,
            &mut ScriptedObservations::new(),
            &mut metrics,
            &AtomicBool::new(false),
        )?;

        assert_eq!(analysis.summary.tamper_intervals, 1);
        assert_eq!(analysis.diagnostics.skipped_metric_samples, 1);
        Ok(())
    }

    #[test]
    fn cancellation_still_closes_windows_and_keeps_ledger_row() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = shared(InMemoryEvidenceLedger::new());

        let mut observations = ScriptedObservations::new();
        observations.push(obs(1, ObjectClass::Person, 0, None));

        let pipeline = CasePipeline::new(config());
        let cancel = AtomicBool::new(true);
        let analysis = pipeline.run(
            evidence_file(&dir),
            "cam01",
            StreamInfo {
                total_frames: 100,
                fps: 10.0,
            },
            &ledger,
            &mut observations,
            &mut ScriptedMetrics::new(),
            &cancel,
        )?;

        assert!(analysis.cancelled);
        assert_eq!(analysis.frames_processed, 0);
        let mut guard = ledger.lock().expect("ledger lock");
        assert!(guard.verify(&analysis.evidence.content_hash)?);
        Ok(())
    }

    #[test]
    fn missing_evidence_file_fails_before_ledger_append() {
        let ledger = shared(InMemoryEvidenceLedger::new());
        let pipeline = CasePipeline::new(config());
        let result = pipeline.run(
            "/nonexistent/evidence.mp4",
            "cam01",
            StreamInfo {
                total_frames: 10,
                fps: 10.0,
            },
            &ledger,
            &mut ScriptedObservations::new(),
            &mut ScriptedMetrics::new(),
            &AtomicBool::new(false),
        );
        assert!(result.is_err());
    }
}
