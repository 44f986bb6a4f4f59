//! Incident timeline assembly.
//!
//! Pure merge/sort/summarize step: closed detection windows from the person
//! and vehicle streams plus edge-triggered tamper events go in, one
//! time-ordered list of incident records and summary counts come out. No
//! detection logic lives here and the output is fully determined by the
//! inputs, independent of the order the sources are added.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::aggregate::DetectionWindow;
use crate::tamper::{TamperEvent, TamperEventKind};
use crate::ObjectClass;

/// Incident kinds in fixed tie-break order: tamper incidents sort before
/// person incidents, which sort before vehicle incidents, at equal start
/// times.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IncidentKind {
    Tamper,
    Person,
    Vehicle,
}

/// The canonical reportable unit. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub kind: IncidentKind,
    pub start_s: f64,
    pub end_s: f64,
    /// Tracker-assigned id, absent for tamper incidents.
    pub track_id: Option<i64>,
    pub object_class: Option<ObjectClass>,
    /// Matched identity key (person reference id or plate string).
    pub identity: Option<String>,
    /// Similarity percentage of the best identity match.
    pub similarity: Option<f64>,
    /// Distinct supporting observation timestamps.
    pub timestamps_s: Vec<f64>,
}

/// Summary counts over the finished timeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineSummary {
    /// Distinct person identities matched within tolerance.
    pub identities_matched: usize,
    /// Distinct vehicle track ids observed.
    pub distinct_vehicles: usize,
    /// Distinct vehicle track ids with at least one plate read.
    pub vehicles_with_plate: usize,
    /// CoverStart/CoverEnd intervals, including one closed at stream end.
    pub tamper_intervals: usize,
}

/// Merges the three source streams into a sorted incident list.
#[derive(Debug, Default)]
pub struct IncidentTimelineBuilder {
    incidents: Vec<IncidentRecord>,
    person_identities: BTreeSet<String>,
    vehicle_tracks: BTreeSet<i64>,
    plated_vehicle_tracks: BTreeSet<i64>,
    tamper_intervals: usize,
}

impl IncidentTimelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_person_windows(&mut self, windows: &[DetectionWindow]) {
        for window in windows {
            if let Some(identity) = &window.best_identity {
                self.person_identities.insert(identity.clone());
            }
            self.incidents.push(window_record(IncidentKind::Person, window));
        }
    }

    pub fn add_vehicle_windows(&mut self, windows: &[DetectionWindow]) {
        for window in windows {
            self.vehicle_tracks.insert(window.track_id);
            if window.is_identified() {
                self.plated_vehicle_tracks.insert(window.track_id);
            }
            self.incidents.push(window_record(IncidentKind::Vehicle, window));
        }
    }

    /// Add tamper events in emission order. Every CoverStart is paired with
    /// the following CoverEnd; a trailing open interval is closed at
    /// `stream_end_s` when given, otherwise at its own start.
    pub fn add_tamper_events(&mut self, events: &[TamperEvent], stream_end_s: Option<f64>) {
        let mut pending: Option<&TamperEvent> = None;
        for event in events {
            match event.kind {
                TamperEventKind::CoverStart => pending = Some(event),
                TamperEventKind::CoverEnd => {
                    if let Some(start) = pending.take() {
                        self.push_tamper(start, event.timestamp_s);
                    }
                }
            }
        }
        if let Some(start) = pending {
            let end_s = stream_end_s
                .filter(|&end| end >= start.timestamp_s)
                .unwrap_or(start.timestamp_s);
            self.push_tamper(start, end_s);
        }
    }

    fn push_tamper(&mut self, start: &TamperEvent, end_s: f64) {
        self.tamper_intervals += 1;
        self.incidents.push(IncidentRecord {
            kind: IncidentKind::Tamper,
            start_s: start.timestamp_s,
            end_s,
            track_id: None,
            object_class: None,
            identity: None,
            similarity: None,
            timestamps_s: vec![start.timestamp_s, end_s],
        });
    }

    /// Finish: sort by start time ascending, ties broken by kind then track
    /// id, and compute summary counts.
    pub fn build(mut self) -> (Vec<IncidentRecord>, TimelineSummary) {
        self.incidents.sort_by(|a, b| {
            a.start_s
                .partial_cmp(&b.start_s)
                .unwrap_or(Ordering::Equal)
                .then(a.kind.cmp(&b.kind))
                .then(a.track_id.cmp(&b.track_id))
        });
        let summary = TimelineSummary {
            identities_matched: self.person_identities.len(),
            distinct_vehicles: self.vehicle_tracks.len(),
            vehicles_with_plate: self.plated_vehicle_tracks.len(),
            tamper_intervals: self.tamper_intervals,
        };
        (self.incidents, summary)
    }
}

fn window_record(kind: IncidentKind, window: &DetectionWindow) -> IncidentRecord {
    IncidentRecord {
        kind,
        start_s: window.first_timestamp_s,
        end_s: window.last_timestamp_s,
        track_id: Some(window.track_id),
        object_class: Some(window.class),
        identity: window.best_identity.clone(),
        similarity: window.best_similarity,
        timestamps_s: window.timestamps_s(),
    }
}
