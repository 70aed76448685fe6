//! Attitude and heading estimation.
//!
//! Complementary fusion on a unit quaternion: gyroscope angular rate is
//! integrated for the high-frequency attitude change, while the
//! accelerometer-derived gravity direction and the tilt-compensated
//! magnetometer heading supply slow corrections that bound the integration
//! drift. The initial attitude comes from the averaged gravity vector with
//! yaw fixed at zero, so the session frame is "origin, facing +X".
//!
//! Magnetic interference handling follows a simple rule: when the
//! magnetometer heading disagrees with the gyro-integrated heading by more
//! than a configured angle, or its field magnitude leaves the plausible
//! Earth-field band, the correction weight collapses and the sample only
//! lowers the confidence score. Corrections are additionally clamped per
//! update, so a passing interference source can never yank the heading
//! discontinuously.

use crate::{NANOS_PER_SEC, SensorKind, SensorSample, wrap_to_pi};
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Configuration for the orientation estimator.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct OrientationConfig {
    /// Smoothing factor for the gravity estimate (0-1).
    pub gravity_alpha: f64,
    /// Tilt correction gain from the accelerometer (per update, 0-1).
    pub accel_gain: f64,
    /// Heading correction gain from the magnetometer (per update, 0-1).
    pub mag_gain: f64,
    /// Disagreement between magnetic and integrated heading beyond which the
    /// magnetic correction is distrusted (radians).
    pub mag_disagreement_rad: f64,
    /// Hard ceiling on any single heading correction (radians).
    pub max_correction_rad: f64,
    /// Minimum plausible Earth field magnitude (µT).
    pub min_mag_magnitude: f64,
    /// Maximum plausible Earth field magnitude (µT).
    pub max_mag_magnitude: f64,
    /// Number of attitude snapshots retained for heading interpolation.
    pub snapshot_capacity: usize,
}

impl Default for OrientationConfig {
    fn default() -> Self {
        OrientationConfig {
            gravity_alpha: 0.02,
            accel_gain: 0.02,
            mag_gain: 0.01,
            mag_disagreement_rad: 0.5,
            max_correction_rad: 0.05,
            min_mag_magnitude: 25.0,
            max_mag_magnitude: 65.0,
            snapshot_capacity: 512,
        }
    }
}

/// Read-only snapshot of the attitude estimate at one instant.
#[derive(Clone, Copy, Debug)]
pub struct OrientationState {
    /// Timestamp of the newest sample folded into the estimate (ns).
    pub timestamp_ns: i64,
    /// Body-to-world rotation.
    pub attitude: UnitQuaternion<f64>,
    /// Yaw about world +Z, radians in (-π, π].
    pub heading_rad: f64,
    /// Drift-correction confidence in [0, 1]; drops under magnetic
    /// interference and recovers as clean corrections resume.
    pub confidence: f64,
}

/// Complementary attitude filter over gyro, accelerometer, and magnetometer.
#[derive(Debug)]
pub struct OrientationEstimator {
    config: OrientationConfig,
    attitude: UnitQuaternion<f64>,
    initialized: bool,
    gravity: Vector3<f64>,
    gravity_samples: u32,
    last_gyro_ns: Option<i64>,
    last_timestamp_ns: i64,
    confidence: f64,
    mag_rejections: u64,
    snapshots: VecDeque<OrientationState>,
}

/// Accelerometer samples averaged before the initial attitude is fixed.
const INIT_GRAVITY_SAMPLES: u32 = 10;

/// Longest interval a single gyro sample may integrate over (s). A gap in
/// the stream is a hole, not a rotation that lasted the whole hole.
const MAX_GYRO_DT_S: f64 = 0.5;

impl OrientationEstimator {
    pub fn new(config: OrientationConfig) -> Self {
        OrientationEstimator {
            config,
            attitude: UnitQuaternion::identity(),
            initialized: false,
            gravity: Vector3::zeros(),
            gravity_samples: 0,
            last_gyro_ns: None,
            last_timestamp_ns: 0,
            confidence: 0.5,
            mag_rejections: 0,
            snapshots: VecDeque::with_capacity(config.snapshot_capacity.max(2)),
        }
    }

    /// Fold one sample into the estimate. All three sensor kinds contribute;
    /// unknown timestamps must be monotonic per kind (the sampler enforces
    /// this upstream).
    pub fn process(&mut self, sample: &SensorSample) {
        match sample.kind {
            SensorKind::Gyroscope => self.integrate_gyro(sample),
            SensorKind::Accelerometer => self.correct_from_gravity(sample),
            SensorKind::Magnetometer => self.correct_from_mag(sample),
        }
    }

    /// Non-blocking snapshot of the current estimate.
    pub fn current_orientation(&self) -> OrientationState {
        OrientationState {
            timestamp_ns: self.last_timestamp_ns,
            attitude: self.attitude,
            heading_rad: self.heading(),
            confidence: self.confidence,
        }
    }

    /// Current yaw about world +Z in (-π, π].
    pub fn heading(&self) -> f64 {
        self.attitude.euler_angles().2
    }

    /// Heading at an arbitrary timestamp, linearly interpolated between the
    /// two nearest retained snapshots (clamped to the ends). `None` until the
    /// first gyro sample has been integrated.
    pub fn heading_at(&self, timestamp_ns: i64) -> Option<f64> {
        let first = self.snapshots.front()?;
        let last = self.snapshots.back()?;
        if timestamp_ns <= first.timestamp_ns {
            return Some(first.heading_rad);
        }
        if timestamp_ns >= last.timestamp_ns {
            return Some(last.heading_rad);
        }
        // Snapshots are timestamp-ordered; find the straddling pair.
        let idx = self
            .snapshots
            .partition_point(|s| s.timestamp_ns <= timestamp_ns);
        let before = self.snapshots[idx - 1];
        let after = self.snapshots[idx];
        let span = (after.timestamp_ns - before.timestamp_ns) as f64;
        if span <= 0.0 {
            return Some(before.heading_rad);
        }
        let frac = (timestamp_ns - before.timestamp_ns) as f64 / span;
        let delta = wrap_to_pi(after.heading_rad - before.heading_rad);
        Some(wrap_to_pi(before.heading_rad + frac * delta))
    }

    /// Magnetometer samples rejected for interference or implausible field
    /// strength.
    pub fn mag_rejections(&self) -> u64 {
        self.mag_rejections
    }

    /// Discard all state and start a fresh session.
    pub fn reset(&mut self) {
        self.attitude = UnitQuaternion::identity();
        self.initialized = false;
        self.gravity = Vector3::zeros();
        self.gravity_samples = 0;
        self.last_gyro_ns = None;
        self.last_timestamp_ns = 0;
        self.confidence = 0.5;
        self.snapshots.clear();
    }

    fn integrate_gyro(&mut self, sample: &SensorSample) {
        if let Some(last) = self.last_gyro_ns {
            let dt = (sample.timestamp_ns - last) as f64 / NANOS_PER_SEC;
            if dt > 0.0 && dt <= MAX_GYRO_DT_S {
                // Body-frame rates compose on the right.
                let dq = UnitQuaternion::from_scaled_axis(sample.vector * dt);
                self.attitude = self.attitude * dq;
            } else if dt > MAX_GYRO_DT_S {
                log::debug!("gyro stream gap of {dt:.2} s, skipping integration across it");
            }
        }
        self.last_gyro_ns = Some(sample.timestamp_ns);
        self.last_timestamp_ns = self.last_timestamp_ns.max(sample.timestamp_ns);
        self.push_snapshot(sample.timestamp_ns);
    }

    fn correct_from_gravity(&mut self, sample: &SensorSample) {
        self.last_timestamp_ns = self.last_timestamp_ns.max(sample.timestamp_ns);
        if sample.vector.norm() < 0.5 {
            return;
        }
        if self.gravity_samples == 0 {
            self.gravity = sample.vector;
        } else {
            self.gravity = self.config.gravity_alpha * sample.vector
                + (1.0 - self.config.gravity_alpha) * self.gravity;
        }
        self.gravity_samples += 1;

        if !self.initialized {
            if self.gravity_samples >= INIT_GRAVITY_SAMPLES {
                self.initialize_from_gravity();
            }
            return;
        }

        // The accelerometer's long-term average points along world +Z (the
        // reaction to gravity). Nudge the attitude so the measured direction
        // maps there; this corrects roll/pitch drift without touching yaw.
        let measured = self.attitude * sample.vector.normalize();
        let error = measured.cross(&Vector3::z());
        let correction = error * self.config.accel_gain;
        let correction = clamp_rotation(correction, self.config.max_correction_rad);
        self.attitude = UnitQuaternion::from_scaled_axis(correction) * self.attitude;
    }

    fn correct_from_mag(&mut self, sample: &SensorSample) {
        self.last_timestamp_ns = self.last_timestamp_ns.max(sample.timestamp_ns);
        if !self.initialized {
            return;
        }
        let magnitude = sample.vector.norm();
        if magnitude < self.config.min_mag_magnitude || magnitude > self.config.max_mag_magnitude {
            self.mag_rejections += 1;
            self.degrade_confidence();
            log::warn!(
                "magnetometer field {magnitude:.1} µT outside plausible band, correction skipped"
            );
            return;
        }
        // Tilt compensation falls out of the world-frame rotation: the
        // horizontal component of the world-frame field should point along
        // +X (magnetic north in the session frame).
        let world = self.attitude * sample.vector;
        let horizontal = Vector3::new(world[0], world[1], 0.0);
        if horizontal.norm() < 1.0 {
            // Field is nearly vertical; heading unobservable.
            self.mag_rejections += 1;
            self.degrade_confidence();
            return;
        }
        let residual = wrap_to_pi(horizontal[1].atan2(horizontal[0]));
        let gain = if residual.abs() > self.config.mag_disagreement_rad {
            self.degrade_confidence();
            log::warn!(
                "magnetic heading disagrees with gyro by {:.1}°, correction weight reduced",
                residual.abs().to_degrees()
            );
            self.config.mag_gain * 0.1
        } else {
            self.restore_confidence();
            self.config.mag_gain
        };
        // Rotate about world Z toward the magnetic reference, bounded so a
        // single update can never jump the heading.
        let correction = (-residual * gain)
            .clamp(-self.config.max_correction_rad, self.config.max_correction_rad);
        self.attitude =
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), correction) * self.attitude;
    }

    fn initialize_from_gravity(&mut self) {
        let up = self.gravity.normalize();
        // Rotation mapping the measured gravity reaction onto world +Z, with
        // zero yaw: the walker starts facing +X by definition.
        self.attitude = UnitQuaternion::rotation_between(&up, &Vector3::z())
            .unwrap_or_else(UnitQuaternion::identity);
        self.initialized = true;
        self.confidence = 0.8;
    }

    fn push_snapshot(&mut self, timestamp_ns: i64) {
        if let Some(back) = self.snapshots.back()
            && timestamp_ns <= back.timestamp_ns
        {
            return;
        }
        if self.snapshots.len() == self.config.snapshot_capacity.max(2) {
            self.snapshots.pop_front();
        }
        let mut state = self.current_orientation();
        state.timestamp_ns = timestamp_ns;
        self.snapshots.push_back(state);
    }

    fn degrade_confidence(&mut self) {
        self.confidence = (0.95 * self.confidence + 0.05 * 0.2).max(0.1);
    }

    fn restore_confidence(&mut self) {
        self.confidence = 0.98 * self.confidence + 0.02 * 1.0;
    }
}

impl Default for OrientationEstimator {
    fn default() -> Self {
        Self::new(OrientationConfig::default())
    }
}

/// Scale an axis-angle rotation down to at most `max_angle` radians.
fn clamp_rotation(rotation: Vector3<f64>, max_angle: f64) -> Vector3<f64> {
    let angle = rotation.norm();
    if angle > max_angle && angle > 0.0 {
        rotation * (max_angle / angle)
    } else {
        rotation
    }
}
