//! Step-length estimation: the model seam.
//!
//! The learned model is a capability, not an implementation detail. This
//! module defines the numeric contract an external inference runtime must
//! satisfy ([`InferenceBackend`]) and hides both it and the deterministic
//! classical formula behind one trait ([`StepLengthModel`]), so the rest of
//! the pipeline never knows which one produced an estimate. The locator runs
//! the learned model as primary and falls back to the classical formula when
//! validation fails.
//!
//! ## Model contract
//!
//! Input: `MODEL_WINDOW_LEN × MODEL_CHANNELS` f32 values, frame-major,
//! normalized per [`features::CHANNEL_MEANS`](crate::features::CHANNEL_MEANS).
//! Output: 1 or 2 f32 values: estimated step length in meters, optionally
//! followed by a heading correction in radians. Anything else (wrong shape,
//! non-finite values, lengths outside the physiologically plausible band) is
//! an inference failure, never a number to integrate.

use crate::features::{MODEL_CHANNELS, MODEL_WINDOW_LEN, StepFeature};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Display};

/// Shortest physiologically plausible step (m).
pub const MIN_STEP_LENGTH_M: f64 = 0.2;
/// Longest physiologically plausible step (m).
pub const MAX_STEP_LENGTH_M: f64 = 2.0;

/// One validated step-length estimate, ready for trajectory integration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepEstimate {
    /// Index of the step this estimate belongs to.
    pub step_index: u64,
    /// Estimated step length in meters, inside the plausible band.
    pub length_m: f64,
    /// Optional heading correction from the model (radians).
    pub heading_delta_rad: Option<f64>,
}

/// Ways an estimate can fail validation.
#[derive(Debug)]
pub enum EstimateError {
    /// The model returned the wrong number of outputs.
    ShapeMismatch { expected: &'static str, got: usize },
    /// The model returned a non-finite or implausible step length.
    OutOfRange { value: f64 },
    /// The inference runtime itself failed.
    Backend(Box<dyn Error + Send + Sync>),
}

impl Display for EstimateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimateError::ShapeMismatch { expected, got } => {
                write!(f, "model output shape mismatch: expected {expected}, got {got}")
            }
            EstimateError::OutOfRange { value } => {
                write!(
                    f,
                    "step length {value} m outside plausible range [{MIN_STEP_LENGTH_M}, {MAX_STEP_LENGTH_M}]"
                )
            }
            EstimateError::Backend(e) => write!(f, "inference backend error: {e}"),
        }
    }
}

impl Error for EstimateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EstimateError::Backend(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// The external model's numeric contract.
///
/// Implementations wrap whatever runtime actually executes the artifact;
/// loading the artifact and choosing a hardware backend are the embedder's
/// concern. The call may block for tens of milliseconds, which is why the
/// locator runs it on a dedicated worker rather than the sensor thread.
pub trait InferenceBackend: Send {
    /// Run the model on one feature window.
    fn run(&self, input: &[f32]) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>>;
}

/// Polymorphic step estimator: learned model or classical formula, selected
/// at runtime as primary and fallback.
pub trait StepLengthModel: Send {
    fn estimate(&self, feature: &StepFeature) -> Result<StepEstimate, EstimateError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Adapter wrapping an [`InferenceBackend`] with output validation.
pub struct LearnedModel {
    backend: Box<dyn InferenceBackend>,
}

impl LearnedModel {
    pub fn new(backend: Box<dyn InferenceBackend>) -> Self {
        LearnedModel { backend }
    }
}

impl StepLengthModel for LearnedModel {
    fn estimate(&self, feature: &StepFeature) -> Result<StepEstimate, EstimateError> {
        debug_assert_eq!(feature.tensor.len(), MODEL_WINDOW_LEN * MODEL_CHANNELS);
        let output = self
            .backend
            .run(&feature.tensor)
            .map_err(EstimateError::Backend)?;
        if output.is_empty() || output.len() > 2 {
            return Err(EstimateError::ShapeMismatch {
                expected: "1 or 2 values",
                got: output.len(),
            });
        }
        let length = output[0] as f64;
        if !length.is_finite() || !(MIN_STEP_LENGTH_M..=MAX_STEP_LENGTH_M).contains(&length) {
            return Err(EstimateError::OutOfRange { value: length });
        }
        let heading_delta = match output.get(1) {
            Some(delta) if !f64::from(*delta).is_finite() => {
                return Err(EstimateError::OutOfRange {
                    value: f64::from(*delta),
                });
            }
            Some(delta) => Some(f64::from(*delta)),
            None => None,
        };
        Ok(StepEstimate {
            step_index: feature.step_index,
            length_m: length,
            heading_delta_rad: heading_delta,
        })
    }

    fn name(&self) -> &'static str {
        "learned"
    }
}

/// Configuration for the classical fallback formula.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ClassicalConfig {
    /// Weinberg gain K; 0.41 suits an average adult.
    pub gain: f64,
}

impl Default for ClassicalConfig {
    fn default() -> Self {
        ClassicalConfig { gain: 0.41 }
    }
}

/// Weinberg step-length heuristic: `K · (a_max − a_min)^¼` over the window's
/// vertical acceleration swing, clamped to the plausible band. Deterministic
/// degraded-mode estimator when the learned model is unavailable or its
/// output fails validation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassicalFormula {
    config: ClassicalConfig,
}

impl ClassicalFormula {
    pub fn new(config: ClassicalConfig) -> Self {
        ClassicalFormula { config }
    }
}

impl StepLengthModel for ClassicalFormula {
    fn estimate(&self, feature: &StepFeature) -> Result<StepEstimate, EstimateError> {
        // De-normalize the accel channels back to m/s² and work on the
        // magnitude, which is orientation-independent.
        use crate::features::{CHANNEL_MEANS, CHANNEL_STDS};
        let mut min_accel = f64::INFINITY;
        let mut max_accel = f64::NEG_INFINITY;
        for frame in feature.tensor.chunks_exact(MODEL_CHANNELS) {
            let mut sum_sq = 0.0;
            for axis in 0..3 {
                let raw = frame[axis] as f64 * CHANNEL_STDS[axis] + CHANNEL_MEANS[axis];
                sum_sq += raw * raw;
            }
            let magnitude = sum_sq.sqrt();
            min_accel = min_accel.min(magnitude);
            max_accel = max_accel.max(magnitude);
        }
        let swing = (max_accel - min_accel).max(0.0);
        let length = (self.config.gain * swing.powf(0.25))
            .clamp(MIN_STEP_LENGTH_M, MAX_STEP_LENGTH_M);
        Ok(StepEstimate {
            step_index: feature.step_index,
            length_m: length,
            heading_delta_rad: None,
        })
    }

    fn name(&self) -> &'static str {
        "classical"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// Backend returning a fixed output, standing in for the real runtime.
    pub(crate) struct FixedBackend(pub Vec<f32>);

    impl InferenceBackend for FixedBackend {
        fn run(&self, _input: &[f32]) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
            Ok(self.0.clone())
        }
    }

    struct FailingBackend;

    impl InferenceBackend for FailingBackend {
        fn run(&self, _input: &[f32]) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
            Err("runtime unavailable".into())
        }
    }

    fn feature_with_swing(low: f64, high: f64) -> StepFeature {
        use crate::features::{CHANNEL_MEANS, CHANNEL_STDS};
        // Alternate frames between two vertical magnitudes.
        let mut tensor = Vec::new();
        for i in 0..MODEL_WINDOW_LEN {
            let accel_z = if i % 2 == 0 { high } else { low };
            tensor.push(0.0);
            tensor.push(0.0);
            tensor.push(((accel_z - CHANNEL_MEANS[2]) / CHANNEL_STDS[2]) as f32);
            tensor.extend_from_slice(&[0.0, 0.0, 0.0]);
        }
        StepFeature {
            step_index: 7,
            peak_ns: 1_000,
            tensor,
        }
    }

    #[test]
    fn test_learned_model_passes_valid_output() {
        let model = LearnedModel::new(Box::new(FixedBackend(vec![0.75])));
        let estimate = model.estimate(&feature_with_swing(8.0, 12.0)).unwrap();
        assert_eq!(estimate.step_index, 7);
        assert_approx_eq!(estimate.length_m, 0.75, 1e-9);
        assert!(estimate.heading_delta_rad.is_none());
    }

    #[test]
    fn test_learned_model_passes_heading_delta() {
        let model = LearnedModel::new(Box::new(FixedBackend(vec![0.6, -0.05])));
        let estimate = model.estimate(&feature_with_swing(8.0, 12.0)).unwrap();
        assert_approx_eq!(estimate.heading_delta_rad.unwrap(), -0.05, 1e-6);
    }

    #[test]
    fn test_learned_model_rejects_out_of_range() {
        for bad in [5.0_f32, 0.05, -0.5, f32::NAN, f32::INFINITY] {
            let model = LearnedModel::new(Box::new(FixedBackend(vec![bad])));
            let err = model.estimate(&feature_with_swing(8.0, 12.0)).unwrap_err();
            assert!(matches!(err, EstimateError::OutOfRange { .. }), "{bad} accepted");
        }
    }

    #[test]
    fn test_learned_model_rejects_bad_shape() {
        for output in [vec![], vec![0.7, 0.0, 0.0]] {
            let model = LearnedModel::new(Box::new(FixedBackend(output)));
            let err = model.estimate(&feature_with_swing(8.0, 12.0)).unwrap_err();
            assert!(matches!(err, EstimateError::ShapeMismatch { .. }));
        }
    }

    #[test]
    fn test_learned_model_rejects_nan_heading() {
        let model = LearnedModel::new(Box::new(FixedBackend(vec![0.7, f32::NAN])));
        assert!(model.estimate(&feature_with_swing(8.0, 12.0)).is_err());
    }

    #[test]
    fn test_backend_failure_propagates() {
        let model = LearnedModel::new(Box::new(FailingBackend));
        let err = model.estimate(&feature_with_swing(8.0, 12.0)).unwrap_err();
        assert!(matches!(err, EstimateError::Backend(_)));
    }

    #[test]
    fn test_classical_formula_weinberg() {
        let formula = ClassicalFormula::default();
        // Swing of 6 m/s²: K · 6^0.25 = 0.41 · 1.565 ≈ 0.642.
        let estimate = formula.estimate(&feature_with_swing(7.0, 13.0)).unwrap();
        assert_approx_eq!(estimate.length_m, 0.41 * 6.0_f64.powf(0.25), 1e-3);
        assert_eq!(estimate.step_index, 7);
    }

    #[test]
    fn test_classical_formula_always_plausible() {
        let formula = ClassicalFormula::default();
        // Flat window clamps to the minimum, a violent one to the maximum.
        let flat = formula.estimate(&feature_with_swing(9.81, 9.81)).unwrap();
        assert_approx_eq!(flat.length_m, MIN_STEP_LENGTH_M, 1e-9);
        let violent = formula.estimate(&feature_with_swing(0.0, 600.0)).unwrap();
        assert_approx_eq!(violent.length_m, MAX_STEP_LENGTH_M, 1e-9);
    }
}
