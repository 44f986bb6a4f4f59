//! Tamper detection over a sampled metric stream.
//!
//! The camera health metrics (Laplacian-variance sharpness, mean brightness)
//! arrive at a fixed sub-sampling stride. This module folds them through a
//! two-state machine with hysteresis so that a covered or blinded lens shows
//! up as one CoverStart/CoverEnd pair instead of hundreds of per-frame flags.
//!
//! The machine is pure and deterministic: same samples in, same events out.
//! Samples must be fed in non-decreasing frame order.

use serde::{Deserialize, Serialize};

/// Baseline brightness guard against a black first frame.
const BRIGHTNESS_EPSILON: f64 = 1e-6;

/// One sharpness/brightness measurement at a sampled frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub frame: u64,
    pub timestamp_s: f64,
    /// Variance-of-Laplacian sharpness score, >= 0.
    pub sharpness: f64,
    /// Mean luma, >= 0.
    pub brightness: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TamperEventKind {
    CoverStart,
    CoverEnd,
}

/// Edge-triggered tamper event. Emitted only on state transitions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TamperEvent {
    pub frame: u64,
    pub timestamp_s: f64,
    pub kind: TamperEventKind,
    pub sharpness: f64,
    /// Brightness relative to the first sample of the stream.
    pub brightness_ratio: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TamperState {
    Normal,
    Covered,
}

/// Two-state hysteresis machine: `Normal -> Covered` only after
/// `persistence_samples` consecutive bad samples, `Covered -> Normal` on the
/// first good sample. Flicker shorter than the persistence window never
/// produces an event.
#[derive(Debug)]
pub struct TamperStateMachine {
    sharpness_threshold: f64,
    brightness_ratio_threshold: f64,
    persistence_samples: u32,
    state: TamperState,
    consecutive_bad: u32,
    baseline_brightness: Option<f64>,
    last_sample: Option<MetricSample>,
}

impl TamperStateMachine {
    pub fn new(
        sharpness_threshold: f64,
        brightness_ratio_threshold: f64,
        persistence_samples: u32,
    ) -> Self {
        Self {
            sharpness_threshold,
            brightness_ratio_threshold,
            persistence_samples: persistence_samples.max(1),
            state: TamperState::Normal,
            consecutive_bad: 0,
            baseline_brightness: None,
            last_sample: None,
        }
    }

    /// Feed one sample. Returns an event only when the state changes.
    pub fn observe(&mut self, sample: MetricSample) -> Option<TamperEvent> {
        let baseline = *self.baseline_brightness.get_or_insert(sample.brightness);
        let brightness_ratio = sample.brightness / (baseline + BRIGHTNESS_EPSILON);
        self.last_sample = Some(sample);

        let bad = sample.sharpness < self.sharpness_threshold
            || brightness_ratio < self.brightness_ratio_threshold;

        if bad {
            self.consecutive_bad = self.consecutive_bad.saturating_add(1);
        } else {
            self.consecutive_bad = 0;
        }

        match self.state {
            TamperState::Normal if self.consecutive_bad == self.persistence_samples => {
                self.state = TamperState::Covered;
                Some(TamperEvent {
                    frame: sample.frame,
                    timestamp_s: sample.timestamp_s,
                    kind: TamperEventKind::CoverStart,
                    sharpness: sample.sharpness,
                    brightness_ratio,
                })
            }
            TamperState::Covered if !bad => {
                self.state = TamperState::Normal;
                Some(TamperEvent {
                    frame: sample.frame,
                    timestamp_s: sample.timestamp_s,
                    kind: TamperEventKind::CoverEnd,
                    sharpness: sample.sharpness,
                    brightness_ratio,
                })
            }
            _ => None,
        }
    }

    /// True while the lens is considered covered.
    pub fn is_covered(&self) -> bool {
        self.state == TamperState::Covered
    }

    /// Consume the machine at stream end. Returns the last sample seen when
    /// the stream ended still covered, so the caller can close the open
    /// interval at that point.
    pub fn finish(self) -> Option<MetricSample> {
        if self.state == TamperState::Covered {
            self.last_sample
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(frame: u64, sharpness: f64, brightness: f64) -> MetricSample {
        MetricSample {
            frame,
            timestamp_s: frame as f64 / 10.0,
            sharpness,
            brightness,
        }
    }

    fn machine() -> TamperStateMachine {
        TamperStateMachine::new(5.0, 0.05, 3)
    }

    #[test]
    fn steady_normal_stream_emits_nothing() {
        let mut fsm = machine();
        for frame in 0..50 {
            assert_eq!(fsm.observe(sample(frame, 40.0, 120.0)), None);
        }
        assert!(!fsm.is_covered());
        assert!(fsm.finish().is_none());
    }

    #[test]
    fn three_bad_then_good_gives_one_start_one_end() {
        let mut fsm = machine();
        assert!(fsm.observe(sample(0, 40.0, 120.0)).is_none());
        assert!(fsm.observe(sample(1, 1.0, 120.0)).is_none());
        assert!(fsm.observe(sample(2, 1.0, 120.0)).is_none());
        let start = fsm.observe(sample(3, 1.0, 120.0)).expect("cover start");
        assert_eq!(start.kind, TamperEventKind::CoverStart);
        assert_eq!(start.frame, 3);
        let end = fsm.observe(sample(4, 40.0, 120.0)).expect("cover end");
        assert_eq!(end.kind, TamperEventKind::CoverEnd);
        assert_eq!(end.frame, 4);
        assert!(!fsm.is_covered());
    }

    #[test]
    fn flicker_shorter_than_persistence_is_suppressed() {
        let mut fsm = machine();
        assert!(fsm.observe(sample(0, 40.0, 120.0)).is_none());
        assert!(fsm.observe(sample(1, 1.0, 120.0)).is_none());
        assert!(fsm.observe(sample(2, 1.0, 120.0)).is_none());
        assert!(fsm.observe(sample(3, 40.0, 120.0)).is_none());
        assert!(fsm.observe(sample(4, 40.0, 120.0)).is_none());
        assert!(!fsm.is_covered());
    }

    #[test]
    fn long_cover_emits_exactly_one_start() {
        let mut fsm = machine();
        let mut events = Vec::new();
        events.extend(fsm.observe(sample(0, 40.0, 120.0)));
        for frame in 1..30 {
            events.extend(fsm.observe(sample(frame, 0.5, 120.0)));
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TamperEventKind::CoverStart);
        assert!(fsm.is_covered());
        let open = fsm.finish().expect("stream ended covered");
        assert_eq!(open.frame, 29);
    }

    #[test]
    fn brightness_collapse_triggers_via_ratio() {
        let mut fsm = machine();
        assert!(fsm.observe(sample(0, 40.0, 200.0)).is_none());
        assert!(fsm.observe(sample(1, 40.0, 1.0)).is_none());
        assert!(fsm.observe(sample(2, 40.0, 1.0)).is_none());
        let start = fsm.observe(sample(3, 40.0, 1.0)).expect("cover start");
        assert_eq!(start.kind, TamperEventKind::CoverStart);
        assert!(start.brightness_ratio < 0.05);
    }

    #[test]
    fn zero_baseline_brightness_does_not_divide_by_zero() {
        let mut fsm = machine();
        let ev = fsm.observe(sample(0, 40.0, 0.0));
        assert!(ev.is_none());
        assert!(fsm.observe(sample(1, 40.0, 0.0)).is_none());
    }

    #[test]
    fn ten_sample_stream_matches_reference_scenario() {
        // Samples 4..=7 bad, persistence 3: CoverStart at sample 6,
        // CoverEnd at sample 8.
        let mut fsm = machine();
        let mut events = Vec::new();
        for frame in 0..10u64 {
            let sharpness = if (4..=7).contains(&frame) { 1.0 } else { 40.0 };
            events.extend(fsm.observe(sample(frame, sharpness, 120.0)));
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, TamperEventKind::CoverStart);
        assert_eq!(events[0].frame, 6);
        assert_eq!(events[1].kind, TamperEventKind::CoverEnd);
        assert_eq!(events[1].frame, 8);
    }
}
