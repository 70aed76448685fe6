//! Step feature extraction for the inference model.
//!
//! For every detected step the model wants the same thing: a fixed-shape
//! tensor of the accelerometer and gyroscope signal surrounding the step,
//! regardless of the platform's actual delivery rate. This module pulls the
//! window `[start − margin, end + margin]` from the sampler, resamples both
//! channels to [`MODEL_WINDOW_LEN`] frames by linear interpolation, and
//! z-normalizes each channel with the constants the model was trained with.
//!
//! A step too close to session start (or one whose window was partially
//! evicted by buffer overflow) is skipped rather than padded; a fabricated
//! window would feed the model data that never happened.

use crate::sampler::SensorSampler;
use crate::step_detector::StepEvent;
use crate::{SensorKind, SensorSample};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Frames per feature window; the model input is `[MODEL_WINDOW_LEN × MODEL_CHANNELS]`.
pub const MODEL_WINDOW_LEN: usize = 50;
/// Channels per frame: accel x, y, z then gyro x, y, z.
pub const MODEL_CHANNELS: usize = 6;

/// Per-channel normalization constants the model expects, frame layout
/// `[ax, ay, az, gx, gy, gz]`. The accelerometer Z mean carries gravity; the
/// remaining channels are zero-mean in the training data.
pub const CHANNEL_MEANS: [f64; MODEL_CHANNELS] = [0.0, 0.0, 9.81, 0.0, 0.0, 0.0];
/// Per-channel standard deviations matching [`CHANNEL_MEANS`].
pub const CHANNEL_STDS: [f64; MODEL_CHANNELS] = [3.0, 3.0, 3.0, 1.5, 1.5, 1.5];

/// Configuration for step feature extraction.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Context pulled before the step start and after the step end (ns).
    pub margin_ns: i64,
    /// Minimum raw samples per sensor required to resample a window.
    pub min_samples: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            margin_ns: 100_000_000, // 100 ms of context either side
            min_samples: 8,
        }
    }
}

/// Fixed-shape model input for one step.
///
/// `tensor` is frame-major: frame `i`, channel `c` lives at
/// `i * MODEL_CHANNELS + c`. Created per step, consumed once by the
/// inference adapter, then dropped.
#[derive(Clone, Debug)]
pub struct StepFeature {
    /// Index of the step this window describes.
    pub step_index: u64,
    /// Timestamp of the step's acceleration peak (ns).
    pub peak_ns: i64,
    /// Normalized window, `MODEL_WINDOW_LEN * MODEL_CHANNELS` values.
    pub tensor: Vec<f32>,
}

/// Why a step produced no feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureError {
    /// Too few raw samples in the window to resample honestly.
    InsufficientWindow {
        kind: SensorKind,
        have: usize,
        need: usize,
    },
}

impl Display for FeatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureError::InsufficientWindow { kind, have, need } => write!(
                f,
                "insufficient {kind} samples in step window: have {have}, need {need}"
            ),
        }
    }
}

impl std::error::Error for FeatureError {}

/// Windows and resamples raw samples around detected steps.
#[derive(Clone, Copy, Debug)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        FeatureExtractor { config }
    }

    /// Build the model input for one step from the sampler's buffers.
    pub fn extract(
        &self,
        event: &StepEvent,
        sampler: &SensorSampler,
    ) -> Result<StepFeature, FeatureError> {
        let start = event.start_ns - self.config.margin_ns;
        let end = event.end_ns + self.config.margin_ns;

        let accel = sampler.window(SensorKind::Accelerometer, start, end);
        let gyro = sampler.window(SensorKind::Gyroscope, start, end);
        // The resampler needs two points to interpolate between, whatever
        // the configured minimum says.
        let need = self.config.min_samples.max(2);
        for (kind, have) in [
            (SensorKind::Accelerometer, accel.len()),
            (SensorKind::Gyroscope, gyro.len()),
        ] {
            if have < need {
                return Err(FeatureError::InsufficientWindow { kind, have, need });
            }
        }

        // Resample over the common covered span so both sensors describe the
        // same instants.
        let span_start = accel[0].timestamp_ns.max(gyro[0].timestamp_ns);
        let span_end = accel[accel.len() - 1]
            .timestamp_ns
            .min(gyro[gyro.len() - 1].timestamp_ns);
        let accel_frames = resample(&accel, span_start, span_end);
        let gyro_frames = resample(&gyro, span_start, span_end);

        let mut tensor = Vec::with_capacity(MODEL_WINDOW_LEN * MODEL_CHANNELS);
        for i in 0..MODEL_WINDOW_LEN {
            for axis in 0..3 {
                let value = (accel_frames[i][axis] - CHANNEL_MEANS[axis]) / CHANNEL_STDS[axis];
                tensor.push(value as f32);
            }
            for axis in 0..3 {
                let value =
                    (gyro_frames[i][axis] - CHANNEL_MEANS[3 + axis]) / CHANNEL_STDS[3 + axis];
                tensor.push(value as f32);
            }
        }

        Ok(StepFeature {
            step_index: event.index,
            peak_ns: event.peak_ns,
            tensor,
        })
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(FeatureConfig::default())
    }
}

/// Linearly resample a timestamp-ordered sample run onto `MODEL_WINDOW_LEN`
/// evenly spaced instants across `[span_start, span_end]`.
fn resample(samples: &[SensorSample], span_start: i64, span_end: i64) -> Vec<[f64; 3]> {
    debug_assert!(samples.len() >= 2);
    let span = (span_end - span_start).max(1) as f64;
    let mut frames = Vec::with_capacity(MODEL_WINDOW_LEN);
    let mut cursor = 0usize;
    for i in 0..MODEL_WINDOW_LEN {
        let target =
            span_start as f64 + span * (i as f64 / (MODEL_WINDOW_LEN - 1) as f64);
        while cursor + 1 < samples.len() && (samples[cursor + 1].timestamp_ns as f64) < target {
            cursor += 1;
        }
        let left = &samples[cursor];
        let right = &samples[(cursor + 1).min(samples.len() - 1)];
        let dt = (right.timestamp_ns - left.timestamp_ns) as f64;
        let frac = if dt > 0.0 {
            ((target - left.timestamp_ns as f64) / dt).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let value = left.vector + (right.vector - left.vector) * frac;
        frames.push([value[0], value[1], value[2]]);
    }
    frames
}
