//! Pedestrian dead reckoning (PDR) toolbox
//!
//! This crate provides the estimation pipeline for a pedestrian dead reckoning
//! system: it turns raw accelerometer, gyroscope, and magnetometer streams into
//! a low-drift position track by detecting discrete step events, maintaining a
//! continuous attitude estimate, estimating the length of every step with a
//! learned model (with a deterministic classical fallback), and integrating the
//! resulting (step length, heading) pairs into a trajectory. The crate does not
//! talk to sensor hardware and does not load model artifacts; the host
//! application delivers samples through [`locator::Locator::feed_sample`] and
//! supplies the model through the [`estimator::InferenceBackend`] trait.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the vector and
//!   quaternion types used by the attitude and trajectory math.
//! - [`serde`](https://crates.io/crates/serde) and [`csv`](https://crates.io/crates/csv):
//!   Provide configuration and recorded-session I/O.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   Provide noise generation for the synthetic walking signals used in
//!   simulation and testing.
//!
//! ## Crate overview
//!
//! The crate is organized into several modules, leaf-first:
//! - [sampler]: Bounded per-sensor ring buffers that bridge the platform's
//!   sensor callbacks into the processing pipeline.
//! - [step_detector]: Peak detection over the filtered acceleration stream,
//!   emitting one [`StepEvent`](step_detector::StepEvent) per stride.
//! - [orientation]: Complementary quaternion fusion of gyroscope, gravity, and
//!   magnetometer into a continuous heading estimate.
//! - [features]: Windowing and resampling of raw samples around a step into
//!   the fixed-shape tensor the inference model expects.
//! - [estimator]: The step-length model seam; wraps the external learned model
//!   and the classical fallback formula behind one trait.
//! - [trajectory]: Step-and-heading integration into a pose history with
//!   outlier rejection and re-anchoring support.
//! - [locator]: The session facade the host application drives; owns every
//!   stage above plus the inference worker.
//! - [replay]: CSV session records, offline replay, and synthetic walk
//!   generation for simulation.
//!
//! ## Coordinate and unit conventions
//!
//! Positions are meters in a fixed local East-North-Up frame anchored at the
//! session origin; the walker starts at the origin facing the +X axis. Heading
//! is the yaw angle about the world +Z axis, in radians, wrapped to (-π, π].
//! Sensor vectors are body-frame: accelerometer in m/s² (including gravity,
//! as delivered by the platform), gyroscope in rad/s, magnetometer in µT.
//! Timestamps are monotonic nanoseconds from the platform clock; wall-clock
//! time never enters the pipeline.
//!
//! ## Degraded modes, not failures
//!
//! Every recoverable condition in the pipeline (buffer overflow, sensor gaps,
//! short step windows, magnetic interference, implausible model output)
//! degrades the estimate quality and increments a counter in
//! [`locator::LocatorMetrics`]; none of them abort tracking or surface as an
//! error to the caller. Total signal loss simply stops producing new poses.

pub mod estimator;
pub mod features;
pub mod locator;
pub mod orientation;
pub mod replay;
pub mod sampler;
pub mod step_detector;
pub mod trajectory;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

pub use estimator::{
    ClassicalFormula, InferenceBackend, LearnedModel, StepEstimate, StepLengthModel,
};
pub use locator::{Locator, LocatorConfig, LocatorMetrics};
pub use orientation::OrientationState;
pub use step_detector::StepEvent;
pub use trajectory::Pose;

/// The three body-frame sensor streams the pipeline consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    /// Specific force in m/s², gravity included.
    Accelerometer,
    /// Angular rate in rad/s.
    Gyroscope,
    /// Magnetic field in µT.
    Magnetometer,
}

impl SensorKind {
    /// All sensor kinds, in buffer-index order.
    pub const ALL: [SensorKind; 3] = [
        SensorKind::Accelerometer,
        SensorKind::Gyroscope,
        SensorKind::Magnetometer,
    ];

    pub(crate) fn buffer_index(self) -> usize {
        match self {
            SensorKind::Accelerometer => 0,
            SensorKind::Gyroscope => 1,
            SensorKind::Magnetometer => 2,
        }
    }
}

impl Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Accelerometer => write!(f, "accelerometer"),
            SensorKind::Gyroscope => write!(f, "gyroscope"),
            SensorKind::Magnetometer => write!(f, "magnetometer"),
        }
    }
}

/// One timestamped reading from a single sensor.
///
/// Samples are immutable once produced: the platform callback hands them to
/// [`locator::Locator::feed_sample`], which moves them into the sampler's ring
/// buffer; downstream stages only ever copy them out.
#[derive(Clone, Copy, Debug)]
pub struct SensorSample {
    /// Monotonic timestamp in nanoseconds.
    pub timestamp_ns: i64,
    /// Which sensor produced the reading.
    pub kind: SensorKind,
    /// Body-frame 3-axis value; units depend on `kind`.
    pub vector: Vector3<f64>,
}

impl SensorSample {
    pub fn new(timestamp_ns: i64, kind: SensorKind, vector: Vector3<f64>) -> Self {
        SensorSample {
            timestamp_ns,
            kind,
            vector,
        }
    }

    /// Convenience constructor for an accelerometer reading.
    pub fn accel(timestamp_ns: i64, x: f64, y: f64, z: f64) -> Self {
        Self::new(
            timestamp_ns,
            SensorKind::Accelerometer,
            Vector3::new(x, y, z),
        )
    }

    /// Convenience constructor for a gyroscope reading.
    pub fn gyro(timestamp_ns: i64, x: f64, y: f64, z: f64) -> Self {
        Self::new(timestamp_ns, SensorKind::Gyroscope, Vector3::new(x, y, z))
    }

    /// Convenience constructor for a magnetometer reading.
    pub fn mag(timestamp_ns: i64, x: f64, y: f64, z: f64) -> Self {
        Self::new(timestamp_ns, SensorKind::Magnetometer, Vector3::new(x, y, z))
    }
}

impl Display for SensorSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SensorSample {{ t: {} ns, {}: [{:.4}, {:.4}, {:.4}] }}",
            self.timestamp_ns, self.kind, self.vector[0], self.vector[1], self.vector[2]
        )
    }
}

/// Nanoseconds per second, as a float, for dt conversions.
pub(crate) const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Wrap an angle to the range (-π, π] radians.
///
/// # Example
/// ```rust
/// use std::f64::consts::PI;
/// let wrapped = pdr::wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped > std::f64::consts::PI {
        wrapped -= 2.0 * std::f64::consts::PI;
    }
    while wrapped <= -std::f64::consts::PI {
        wrapped += 2.0 * std::f64::consts::PI;
    }
    wrapped
}

/// Shortest signed angular distance from `from` to `to`, in (-π, π].
pub fn angle_difference(from: f64, to: f64) -> f64 {
    wrap_to_pi(to - from)
}
