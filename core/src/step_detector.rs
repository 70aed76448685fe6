//! Step detection over the acceleration stream.
//!
//! A walking stride shows up in the accelerometer as a burst of vertical
//! acceleration at each foot strike. The detector tracks a slow gravity
//! estimate, low-pass filters the linear vertical component, and declares a
//! step when the filtered signal rises through a threshold and falls back out,
//! subject to a refractory interval that rejects double counting at normal
//! cadences (0.3–2 Hz). Long gaps in the input stream reset the filter state:
//! the stream is treated as a new walking segment instead of producing
//! spurious steps across the hole.

use crate::{NANOS_PER_SEC, SensorKind, SensorSample};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Configuration for the step detector.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StepDetectorConfig {
    /// Smoothing factor for the gravity estimate (0-1, lower = slower).
    pub gravity_alpha: f64,
    /// Smoothing factor for the linear acceleration low-pass (0-1).
    pub smoothing_alpha: f64,
    /// Filtered vertical acceleration that opens a step candidate (m/s²).
    pub rise_threshold: f64,
    /// Filtered vertical acceleration that closes the candidate (m/s²).
    pub fall_threshold: f64,
    /// Peaks above this are impacts or drops, not steps (m/s²).
    pub max_peak_accel: f64,
    /// Minimum interval between step peaks (ns). Candidates arriving sooner
    /// are suppressed, first one wins.
    pub refractory_ns: i64,
    /// Input gap that resets the filter state (ns).
    pub gap_reset_ns: i64,
}

impl Default for StepDetectorConfig {
    fn default() -> Self {
        StepDetectorConfig {
            gravity_alpha: 0.01,
            smoothing_alpha: 0.3,
            rise_threshold: 1.2,
            fall_threshold: 0.4,
            max_peak_accel: 25.0,
            refractory_ns: 350_000_000,  // < 500 ms stride at 2 Hz cadence
            gap_reset_ns: 1_000_000_000, // 1 s without samples = new segment
        }
    }
}

/// One detected step.
///
/// Indices are strictly increasing within a session; the detector is the only
/// producer. Each event is consumed exactly once by the feature extractor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepEvent {
    /// Monotonic step counter, starting at 0 per session.
    pub index: u64,
    /// Timestamp of the rising threshold crossing (ns).
    pub start_ns: i64,
    /// Timestamp of the acceleration peak (ns).
    pub peak_ns: i64,
    /// Timestamp of the falling threshold crossing (ns).
    pub end_ns: i64,
    /// Peak filtered vertical acceleration (m/s²).
    pub peak_accel: f64,
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Idle,
    /// Inside a candidate step, tracking the running peak.
    Rising {
        start_ns: i64,
        peak_ns: i64,
        peak_accel: f64,
    },
}

/// Stateful peak detector over the accelerometer stream.
#[derive(Debug)]
pub struct StepDetector {
    config: StepDetectorConfig,
    gravity: Vector3<f64>,
    gravity_initialized: bool,
    filtered: f64,
    prev_filtered: f64,
    phase: Phase,
    last_peak_ns: Option<i64>,
    last_sample_ns: Option<i64>,
    next_index: u64,
    gap_resets: u64,
    suppressed: u64,
}

impl StepDetector {
    pub fn new(config: StepDetectorConfig) -> Self {
        StepDetector {
            config,
            gravity: Vector3::zeros(),
            gravity_initialized: false,
            filtered: 0.0,
            prev_filtered: 0.0,
            phase: Phase::Idle,
            last_peak_ns: None,
            last_sample_ns: None,
            next_index: 0,
            gap_resets: 0,
            suppressed: 0,
        }
    }

    /// Feed one sample. Non-accelerometer samples are ignored. Returns a
    /// [`StepEvent`] when a step completes on this sample.
    pub fn process(&mut self, sample: &SensorSample) -> Option<StepEvent> {
        if sample.kind != SensorKind::Accelerometer {
            return None;
        }
        if let Some(last) = self.last_sample_ns
            && sample.timestamp_ns.saturating_sub(last) > self.config.gap_reset_ns
        {
            log::debug!(
                "acceleration stream gap of {} ms, resetting filter state",
                sample.timestamp_ns.saturating_sub(last) / 1_000_000
            );
            self.reset_filter();
            self.gap_resets += 1;
        }
        self.last_sample_ns = Some(sample.timestamp_ns);

        if !self.gravity_initialized {
            self.gravity = sample.vector;
            self.gravity_initialized = true;
        } else {
            self.gravity = self.config.gravity_alpha * sample.vector
                + (1.0 - self.config.gravity_alpha) * self.gravity;
        }

        let vertical = self.vertical_accel(&sample.vector);
        self.prev_filtered = self.filtered;
        self.filtered = self.config.smoothing_alpha * vertical
            + (1.0 - self.config.smoothing_alpha) * self.filtered;

        self.advance_phase(sample.timestamp_ns, vertical)
    }

    /// Steps detected so far in this session.
    pub fn step_count(&self) -> u64 {
        self.next_index
    }

    /// Filter resets caused by input gaps.
    pub fn gap_resets(&self) -> u64 {
        self.gap_resets
    }

    /// Candidate peaks discarded inside the refractory interval.
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed
    }

    /// Start a fresh session: filter state cleared and the step counter
    /// rewound to zero.
    pub fn reset(&mut self) {
        self.reset_filter();
        self.last_sample_ns = None;
        self.next_index = 0;
    }

    fn reset_filter(&mut self) {
        self.gravity_initialized = false;
        self.filtered = 0.0;
        self.prev_filtered = 0.0;
        self.phase = Phase::Idle;
        self.last_peak_ns = None;
    }

    /// Linear vertical acceleration: the projection of the raw reading onto
    /// the gravity direction, minus gravity itself.
    fn vertical_accel(&self, accel: &Vector3<f64>) -> f64 {
        let gravity_mag = self.gravity.norm();
        if gravity_mag < 0.1 {
            return 0.0;
        }
        accel.dot(&self.gravity) / gravity_mag - gravity_mag
    }

    fn advance_phase(&mut self, timestamp_ns: i64, vertical: f64) -> Option<StepEvent> {
        match self.phase {
            Phase::Idle => {
                // The raw (unsmoothed) vertical reading gates violence: the
                // low-pass blunts a spike well below its true magnitude.
                let rising = self.prev_filtered < self.config.rise_threshold
                    && self.filtered >= self.config.rise_threshold
                    && vertical <= self.config.max_peak_accel;
                if !rising {
                    return None;
                }
                if let Some(last_peak) = self.last_peak_ns
                    && timestamp_ns.saturating_sub(last_peak) < self.config.refractory_ns
                {
                    self.suppressed += 1;
                    return None;
                }
                self.phase = Phase::Rising {
                    start_ns: timestamp_ns,
                    peak_ns: timestamp_ns,
                    peak_accel: self.filtered,
                };
                None
            }
            Phase::Rising {
                start_ns,
                mut peak_ns,
                mut peak_accel,
            } => {
                if self.filtered > peak_accel {
                    peak_accel = self.filtered;
                    peak_ns = timestamp_ns;
                }
                if vertical > self.config.max_peak_accel {
                    // Impact or drop, not a stride.
                    log::debug!("discarding candidate step, {vertical:.1} m/s² is too violent");
                    self.phase = Phase::Idle;
                    return None;
                }
                if self.filtered < self.config.fall_threshold {
                    self.phase = Phase::Idle;
                    self.last_peak_ns = Some(peak_ns);
                    let event = StepEvent {
                        index: self.next_index,
                        start_ns,
                        peak_ns,
                        end_ns: timestamp_ns,
                        peak_accel,
                    };
                    self.next_index += 1;
                    return Some(event);
                }
                self.phase = Phase::Rising {
                    start_ns,
                    peak_ns,
                    peak_accel,
                };
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const SAMPLE_RATE_HZ: f64 = 100.0;

    /// Vertical-bounce walking signal: gravity on Z plus a sinusoid at the
    /// step cadence.
    fn walking_samples(cadence_hz: f64, amplitude: f64, duration_s: f64) -> Vec<SensorSample> {
        let n = (duration_s * SAMPLE_RATE_HZ) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / SAMPLE_RATE_HZ;
                let bounce = amplitude * (2.0 * PI * cadence_hz * t).sin();
                SensorSample::accel(
                    (t * crate::NANOS_PER_SEC) as i64,
                    0.0,
                    0.0,
                    9.81 + bounce,
                )
            })
            .collect()
    }

    fn run(detector: &mut StepDetector, samples: &[SensorSample]) -> Vec<StepEvent> {
        samples.iter().filter_map(|s| detector.process(s)).collect()
    }

    #[test]
    fn test_counts_steps_at_known_cadence() {
        for cadence in [0.5, 1.0, 1.5, 2.0] {
            let mut detector = StepDetector::new(StepDetectorConfig::default());
            let duration = 10.0;
            let samples = walking_samples(cadence, 3.0, duration);
            let events = run(&mut detector, &samples);
            let expected = (cadence * duration) as i64;
            let got = events.len() as i64;
            assert!(
                (got - expected).abs() <= 1,
                "cadence {cadence} Hz: expected {expected}±1 steps, got {got}"
            );
        }
    }

    #[test]
    fn test_refractory_interval_enforced() {
        let mut detector = StepDetector::new(StepDetectorConfig::default());
        let refractory = detector.config.refractory_ns;
        let samples = walking_samples(2.0, 3.0, 10.0);
        let events = run(&mut detector, &samples);
        for pair in events.windows(2) {
            assert!(
                pair[1].peak_ns - pair[0].peak_ns >= refractory,
                "peaks {} and {} closer than refractory interval",
                pair[0].peak_ns,
                pair[1].peak_ns
            );
        }
    }

    #[test]
    fn test_indices_strictly_increasing() {
        let mut detector = StepDetector::new(StepDetectorConfig::default());
        let samples = walking_samples(1.5, 3.0, 8.0);
        let events = run(&mut detector, &samples);
        assert!(!events.is_empty());
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.index, i as u64);
            assert!(event.start_ns <= event.peak_ns && event.peak_ns <= event.end_ns);
        }
    }

    #[test]
    fn test_quiet_signal_produces_no_steps() {
        let mut detector = StepDetector::new(StepDetectorConfig::default());
        let samples: Vec<SensorSample> = (0..1000)
            .map(|i| SensorSample::accel(i * 10_000_000, 0.02, -0.01, 9.81))
            .collect();
        assert!(run(&mut detector, &samples).is_empty());
    }

    #[test]
    fn test_violent_impact_rejected() {
        let mut detector = StepDetector::new(StepDetectorConfig::default());
        // Settle gravity first.
        for i in 0..200 {
            detector.process(&SensorSample::accel(i * 10_000_000, 0.0, 0.0, 9.81));
        }
        // A 40 m/s² spike (phone dropped) must not register as a step, even
        // after the signal settles back to quiet.
        let t0: i64 = 200 * 10_000_000;
        let spike = [9.81, 30.0, 50.0, 45.0, 20.0, 9.81, 9.81];
        let quiet = [9.81; 60];
        for (i, z) in spike.iter().chain(quiet.iter()).enumerate() {
            detector.process(&SensorSample::accel(t0 + (i as i64) * 10_000_000, 0.0, 0.0, *z));
        }
        assert_eq!(detector.step_count(), 0);
    }

    #[test]
    fn test_gap_resets_filter_state() {
        let mut detector = StepDetector::new(StepDetectorConfig::default());
        let first = walking_samples(1.5, 3.0, 4.0);
        run(&mut detector, &first);
        assert_eq!(detector.gap_resets(), 0);

        // Resume 5 seconds later; the detector should treat it as a new
        // segment, not bridge the hole.
        let offset = (9.0 * crate::NANOS_PER_SEC) as i64;
        let resumed: Vec<SensorSample> = walking_samples(1.5, 3.0, 4.0)
            .into_iter()
            .map(|mut s| {
                s.timestamp_ns += offset;
                s
            })
            .collect();
        let events = run(&mut detector, &resumed);
        assert_eq!(detector.gap_resets(), 1);
        // Steps keep flowing after the reset with monotonic indices.
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.timestamp_ok()));
    }

    #[test]
    fn test_session_reset_rewinds_indices() {
        let mut detector = StepDetector::new(StepDetectorConfig::default());
        let samples = walking_samples(1.5, 3.0, 5.0);
        let events = run(&mut detector, &samples);
        assert!(!events.is_empty());
        detector.reset();
        assert_eq!(detector.step_count(), 0);
        let events = run(&mut detector, &walking_samples(1.5, 3.0, 5.0));
        assert_eq!(events[0].index, 0);
    }

    impl StepEvent {
        fn timestamp_ok(&self) -> bool {
            self.start_ns <= self.peak_ns && self.peak_ns <= self.end_ns
        }
    }
}
