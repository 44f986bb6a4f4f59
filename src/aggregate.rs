//! Detection aggregation: raw per-frame track observations in, deduplicated
//! detection windows out.
//!
//! The external tracker emits one observation per tracked object per sampled
//! frame, optionally with raw identity-match distances (face reference for
//! people, plate read for vehicles). This module collapses each continuous
//! appearance of a track into a single window, keeps only the best identity
//! match, and dedups frame-derived timestamps, so that a person standing in
//! frame for a minute produces one reportable unit instead of hundreds.
//!
//! Observations must arrive in non-decreasing frame order; window closure is
//! driven by frame gaps.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{BoundingBox, ObjectClass};

/// Timestamp dedup granularity: distinct at centisecond resolution.
const TIMESTAMP_TICKS_PER_S: f64 = 100.0;

/// Raw identity candidate from the comparator: smaller distance = closer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityCandidate {
    /// Opaque identity key supplied by the detector (reference photo id,
    /// normalized plate string). Carried verbatim, never derived from
    /// display names.
    pub reference_id: String,
    pub distance: f64,
}

/// One per-frame observation of a tracked object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackObservation {
    pub track_id: i64,
    pub class: ObjectClass,
    pub frame: u64,
    pub timestamp_s: f64,
    #[serde(default)]
    pub bbox: BoundingBox,
    #[serde(default)]
    pub candidates: Vec<IdentityCandidate>,
}

/// One continuous appearance of a track, accumulated across frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionWindow {
    pub track_id: i64,
    pub class: ObjectClass,
    pub first_frame: u64,
    pub last_frame: u64,
    pub first_timestamp_s: f64,
    pub last_timestamp_s: f64,
    /// Best in-tolerance identity so far, with its similarity percentage.
    pub best_identity: Option<String>,
    pub best_similarity: Option<f64>,
    /// Distinct observation timestamps, centisecond ticks.
    timestamp_ticks: BTreeSet<u64>,
}

impl DetectionWindow {
    fn open(obs: &TrackObservation) -> Self {
        let mut window = Self {
            track_id: obs.track_id,
            class: obs.class,
            first_frame: obs.frame,
            last_frame: obs.frame,
            first_timestamp_s: obs.timestamp_s,
            last_timestamp_s: obs.timestamp_s,
            best_identity: None,
            best_similarity: None,
            timestamp_ticks: BTreeSet::new(),
        };
        window.record_timestamp(obs.timestamp_s);
        window
    }

    fn record_timestamp(&mut self, timestamp_s: f64) {
        let ticks = (timestamp_s * TIMESTAMP_TICKS_PER_S).round();
        if ticks >= 0.0 {
            self.timestamp_ticks.insert(ticks as u64);
        }
    }

    /// Distinct observation timestamps in seconds, ascending.
    pub fn timestamps_s(&self) -> Vec<f64> {
        self.timestamp_ticks
            .iter()
            .map(|&ticks| ticks as f64 / TIMESTAMP_TICKS_PER_S)
            .collect()
    }

    pub fn is_identified(&self) -> bool {
        self.best_identity.is_some()
    }
}

/// Map a raw comparator distance to a similarity percentage.
///
/// Within tolerance the score spans 70..=100; beyond tolerance it decays
/// linearly to 0 at twice the tolerance. Monotone non-increasing in the
/// distance.
pub fn similarity_percent(distance: f64, tolerance: f64) -> f64 {
    if tolerance <= 0.0 {
        return 0.0;
    }
    let distance = distance.max(0.0);
    let score = if distance <= tolerance {
        70.0 + 30.0 * (1.0 - distance / tolerance)
    } else {
        70.0 * (1.0 - (distance - tolerance) / tolerance)
    };
    score.clamp(0.0, 100.0)
}

/// Windows raw track observations into deduplicated detection windows.
///
/// At most one window is open per track id. A track unseen for strictly more
/// than `gap_frames` frames is closed; if it reappears later a new window
/// opens rather than reopening the old one, since track ids are not stable
/// identities across long gaps.
#[derive(Debug)]
pub struct DetectionAggregator {
    gap_frames: u64,
    tolerance: f64,
    open: BTreeMap<i64, DetectionWindow>,
    closed: Vec<DetectionWindow>,
}

impl DetectionAggregator {
    pub fn new(gap_frames: u64, tolerance: f64) -> Self {
        Self {
            gap_frames,
            tolerance,
            open: BTreeMap::new(),
            closed: Vec::new(),
        }
    }

    /// Feed the observation batch for one processed frame. An empty batch is
    /// valid and still advances gap-based closure.
    pub fn observe(&mut self, frame: u64, observations: &[TrackObservation]) {
        self.close_stale(frame);

        for obs in observations {
            let window = self
                .open
                .entry(obs.track_id)
                .or_insert_with(|| DetectionWindow::open(obs));
            window.last_frame = window.last_frame.max(obs.frame);
            window.last_timestamp_s = window.last_timestamp_s.max(obs.timestamp_s);
            window.record_timestamp(obs.timestamp_s);

            for candidate in &obs.candidates {
                if candidate.distance > self.tolerance {
                    continue;
                }
                let similarity = similarity_percent(candidate.distance, self.tolerance);
                let improves = window
                    .best_similarity
                    .map_or(true, |best| similarity > best);
                if improves {
                    window.best_similarity = Some(similarity);
                    window.best_identity = Some(candidate.reference_id.clone());
                }
            }
        }
    }

    fn close_stale(&mut self, frame: u64) {
        let gap = self.gap_frames;
        let stale: Vec<i64> = self
            .open
            .iter()
            .filter(|(_, window)| frame.saturating_sub(window.last_frame) > gap)
            .map(|(&track_id, _)| track_id)
            .collect();
        for track_id in stale {
            if let Some(window) = self.open.remove(&track_id) {
                self.closed.push(window);
            }
        }
    }

    /// Close all remaining windows and return every window, ordered by
    /// (first frame, track id). Each window maps to exactly one incident.
    pub fn finish(mut self) -> Vec<DetectionWindow> {
        let remaining: Vec<DetectionWindow> = std::mem::take(&mut self.open)
            .into_values()
            .collect();
        self.closed.extend(remaining);
        self.closed
            .sort_by_key(|window| (window.first_frame, window.track_id));
        self.closed
    }
}
