//! Seam to the external detectors.
//!
//! The engine never runs model inference, OCR, or face embedding. It
//! consumes structured observations those components already produced,
//! through two narrow traits. A source error on one frame is non-fatal: the
//! pipeline treats the frame as degraded and keeps going, counting it in the
//! run diagnostics so consumers know results may be incomplete.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::aggregate::{IdentityCandidate, TrackObservation};
use crate::{BoundingBox, ObjectClass};

/// Camera health metrics for one sampled frame.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct FrameMetrics {
    /// Variance-of-Laplacian sharpness, >= 0.
    pub sharpness: f64,
    /// Mean luma, >= 0.
    pub brightness: f64,
}

/// Per-frame track observations from the external detector/tracker.
///
/// Absence of observations for a frame means "no detections", not an error;
/// an `Err` means the detector failed on that frame.
pub trait ObservationSource {
    fn observations_for_frame(&mut self, frame: u64) -> Result<Vec<TrackObservation>>;
}

/// Per-sample tamper metrics. `Ok(None)` means the metric was unavailable
/// for that sample; the state machine must not see it at all.
pub trait MetricSource {
    fn metrics_for_sample(&mut self, frame: u64) -> Result<Option<FrameMetrics>>;
}

// -------------------- JSONL replay --------------------

#[derive(Debug, Deserialize)]
struct ObservationLine {
    frame: u64,
    track_id: i64,
    class: String,
    #[serde(default)]
    bbox: BoundingBox,
    #[serde(default)]
    candidates: Vec<IdentityCandidate>,
}

/// Replays detector output from a JSONL file, one observation per line.
///
/// Lines are indexed by frame at load time; frames with no line replay as
/// zero observations.
#[derive(Debug)]
pub struct JsonlObservationSource {
    by_frame: BTreeMap<u64, Vec<TrackObservation>>,
}

impl JsonlObservationSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow!("failed to open observations {}: {}", path.display(), e))?;
        let mut by_frame: BTreeMap<u64, Vec<TrackObservation>> = BTreeMap::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.map_err(|e| anyhow!("failed to read observations {}: {}", path.display(), e))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ObservationLine = serde_json::from_str(&line).map_err(|e| {
                anyhow!(
                    "bad observation line {} in {}: {}",
                    line_no + 1,
                    path.display(),
                    e
                )
            })?;
            by_frame.entry(parsed.frame).or_default().push(TrackObservation {
                track_id: parsed.track_id,
                class: ObjectClass::from_label(&parsed.class),
                frame: parsed.frame,
                timestamp_s: 0.0, // pipeline assigns from frame index and fps
                bbox: parsed.bbox,
                candidates: parsed.candidates,
            });
        }
        Ok(Self { by_frame })
    }
}

impl ObservationSource for JsonlObservationSource {
    fn observations_for_frame(&mut self, frame: u64) -> Result<Vec<TrackObservation>> {
        Ok(self.by_frame.get(&frame).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct MetricLine {
    frame: u64,
    #[serde(flatten)]
    metrics: FrameMetrics,
}

/// Replays sharpness/brightness metrics from a JSONL file.
#[derive(Debug)]
pub struct JsonlMetricSource {
    by_frame: BTreeMap<u64, FrameMetrics>,
}

impl JsonlMetricSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow!("failed to open metrics {}: {}", path.display(), e))?;
        let mut by_frame = BTreeMap::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.map_err(|e| anyhow!("failed to read metrics {}: {}", path.display(), e))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: MetricLine = serde_json::from_str(&line).map_err(|e| {
                anyhow!("bad metric line {} in {}: {}", line_no + 1, path.display(), e)
            })?;
            by_frame.insert(parsed.frame, parsed.metrics);
        }
        Ok(Self { by_frame })
    }
}

impl MetricSource for JsonlMetricSource {
    fn metrics_for_sample(&mut self, frame: u64) -> Result<Option<FrameMetrics>> {
        Ok(self.by_frame.get(&frame).copied())
    }
}

// -------------------- Scripted stubs --------------------

/// In-memory observation source for tests: scripted batches per frame plus
/// frames scripted to fail, simulating detector invocation errors.
#[derive(Debug, Default)]
pub struct ScriptedObservations {
    by_frame: BTreeMap<u64, Vec<TrackObservation>>,
    failing_frames: BTreeSet<u64>,
}

impl ScriptedObservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, obs: TrackObservation) {
        self.by_frame.entry(obs.frame).or_default().push(obs);
    }

    pub fn fail_at(&mut self, frame: u64) {
        self.failing_frames.insert(frame);
    }
}

impl ObservationSource for ScriptedObservations {
    fn observations_for_frame(&mut self, frame: u64) -> Result<Vec<TrackObservation>> {
        if self.failing_frames.contains(&frame) {
            return Err(anyhow!("scripted detector failure at frame {}", frame));
        }
        Ok(self.by_frame.get(&frame).cloned().unwrap_or_default())
    }
}

/// In-memory metric source for tests.
#[derive(Debug, Default)]
pub struct ScriptedMetrics {
    by_frame: BTreeMap<u64, FrameMetrics>,
    failing_frames: BTreeSet<u64>,
}

impl ScriptedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, frame: u64, sharpness: f64, brightness: f64) {
        self.by_frame.insert(
            frame,
            FrameMetrics {
                sharpness,
                brightness,
            },
        );
    }

    pub fn fail_at(&mut self, frame: u64) {
        self.failing_frames.insert(frame);
    }
}

impl MetricSource for ScriptedMetrics {
    fn metrics_for_sample(&mut self, frame: u64) -> Result<Option<FrameMetrics>> {
        if self.failing_frames.contains(&frame) {
            return Err(anyhow!("scripted metric failure at frame {}", frame));
        }
        Ok(self.by_frame.get(&frame).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn jsonl_observations_group_by_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("observations.jsonl");
        let mut file = std::fs::File::create(&path)?;
        writeln!(
            file,
            r#"{{"frame":8,"track_id":1,"class":"person","candidates":[{{"reference_id":"ref:alice","distance":0.3}}]}}"#
        )?;
        writeln!(file, r#"{{"frame":8,"track_id":2,"class":"car"}}"#)?;
        writeln!(file, r#"{{"frame":16,"track_id":1,"class":"person"}}"#)?;

        let mut source = JsonlObservationSource::load(&path)?;
        let at_8 = source.observations_for_frame(8)?;
        assert_eq!(at_8.len(), 2);
        assert_eq!(at_8[0].class, ObjectClass::Person);
        assert_eq!(at_8[0].candidates[0].reference_id, "ref:alice");
        assert_eq!(at_8[1].class, ObjectClass::Car);
        assert!(source.observations_for_frame(9)?.is_empty());
        Ok(())
    }

    #[test]
    fn jsonl_metrics_replay_and_report_absence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metrics.jsonl");
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, r#"{{"frame":0,"sharpness":42.0,"brightness":118.5}}"#)?;

        let mut source = JsonlMetricSource::load(&path)?;
        let metrics = source.metrics_for_sample(0)?.expect("present");
        assert_eq!(metrics.sharpness, 42.0);
        assert!(source.metrics_for_sample(8)?.is_none());
        Ok(())
    }

    #[test]
    fn malformed_observation_line_is_rejected_with_location() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("observations.jsonl");
        std::fs::write(&path, "{\"frame\":1}\n")?;
        let err = JsonlObservationSource::load(&path).unwrap_err();
        assert!(err.to_string().contains("line 1"));
        Ok(())
    }

    #[test]
    fn scripted_failure_surfaces_as_error() {
        let mut source = ScriptedObservations::new();
        source.fail_at(5);
        assert!(source.observations_for_frame(5).is_err());
        assert!(source.observations_for_frame(6).unwrap().is_empty());
    }
}
