//! Recorded-session I/O, offline replay, and synthetic walks.
//!
//! This module provides:
//! - A struct ([`ImuRecord`]) for reading and writing recorded IMU sessions
//!   to/from CSV files, one row per sample instant
//! - A replay runner that drives recorded data through a [`Locator`] exactly
//!   as the live pipeline would see it
//! - [`TrajectoryResult`] for storing and exporting the resulting track
//! - A seeded synthetic walking-signal generator for simulations and tests
//!
//! Recorded rows mirror what a phone-side collector writes: a wall-clock
//! time string followed by the accelerometer, gyroscope, and magnetometer
//! axes. Rows with an unparseable time fall back to a nominal 100 Hz
//! spacing so a damaged log still replays.

use crate::locator::{Locator, LocatorMetrics};
use crate::trajectory::Pose;
use crate::SensorSample;
use chrono::{DateTime, Duration, FixedOffset};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Wall-clock format of the `time` column, millisecond precision.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f%z";

/// Nominal sample spacing assumed when a row's time cannot be parsed.
const FALLBACK_DT_NS: i64 = 10_000_000;

/// One recorded sample instant: all three sensors at one timestamp.
///
/// Fields correspond to the CSV columns written by the on-device collector.
/// Magnetometer columns are zero when no magnetometer was enabled for the
/// session; replay skips those values rather than feeding a fake field.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ImuRecord {
    /// Date-time string: YYYY-MM-DD hh:mm:ss.sss+offset
    pub time: String,
    /// X-acceleration in m/s², gravity included
    pub acc_x: f64,
    /// Y-acceleration in m/s²
    pub acc_y: f64,
    /// Z-acceleration in m/s²
    pub acc_z: f64,
    /// Rotation rate around the x-axis in rad/s
    pub gyro_x: f64,
    /// Rotation rate around the y-axis in rad/s
    pub gyro_y: f64,
    /// Rotation rate around the z-axis in rad/s
    pub gyro_z: f64,
    /// Magnetic field strength in the x-direction in µT
    pub mag_x: f64,
    /// Magnetic field strength in the y-direction in µT
    pub mag_y: f64,
    /// Magnetic field strength in the z-direction in µT
    pub mag_z: f64,
}

impl ImuRecord {
    /// Reads a CSV file and returns a vector of `ImuRecord` structs.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    /// Writes a vector of `ImuRecord` structs to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Monotonic timestamp recovered from the time column, if parseable.
    pub fn timestamp_ns(&self) -> Option<i64> {
        DateTime::parse_from_str(&self.time, TIME_FORMAT)
            .ok()?
            .timestamp_nanos_opt()
    }

    /// True when the magnetometer columns carry no reading.
    pub fn mag_is_empty(&self) -> bool {
        self.mag_x == 0.0 && self.mag_y == 0.0 && self.mag_z == 0.0
    }
}

/// The track produced by one replay run.
#[derive(Debug)]
pub struct TrajectoryResult {
    /// Name or identifier for this run.
    pub name: String,
    /// Pose after every applied step, oldest first.
    pub poses: Vec<Pose>,
    /// Pipeline counters at the end of the run.
    pub metrics: LocatorMetrics,
}

impl TrajectoryResult {
    pub fn new(name: &str) -> Self {
        TrajectoryResult {
            name: name.to_string(),
            poses: Vec::new(),
            metrics: LocatorMetrics::default(),
        }
    }

    /// Final pose of the run; origin if no step was ever applied.
    pub fn final_pose(&self) -> Pose {
        self.poses.last().copied().unwrap_or_else(Pose::origin)
    }

    /// Total walked distance along the track (m).
    pub fn total_distance(&self) -> f64 {
        let mut previous = Pose::origin().position;
        let mut total = 0.0;
        for pose in &self.poses {
            total += (pose.position - previous).norm();
            previous = pose.position;
        }
        total
    }

    /// Writes the track to a CSV file for analysis or visualization.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        writeln!(file, "time_ns,x_m,y_m,z_m,heading_deg")?;
        for pose in &self.poses {
            writeln!(
                file,
                "{},{:.4},{:.4},{:.4},{:.4}",
                pose.timestamp_ns,
                pose.position[0],
                pose.position[1],
                pose.position[2],
                pose.heading_rad.to_degrees()
            )?;
        }
        Ok(())
    }

    /// Reads a track previously written with [`to_csv`](Self::to_csv).
    pub fn from_csv<P: AsRef<Path>>(path: P, name: &str) -> Result<Self, Box<dyn Error>> {
        let file = File::open(path)?;
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
        let mut result = TrajectoryResult::new(name);
        for record in rdr.records() {
            let record = record?;
            if record.len() < 5 {
                return Err("trajectory CSV record doesn't have enough fields".into());
            }
            result.poses.push(Pose {
                timestamp_ns: record[0].parse::<i64>()?,
                position: Vector3::new(
                    record[1].parse::<f64>()?,
                    record[2].parse::<f64>()?,
                    record[3].parse::<f64>()?,
                ),
                heading_rad: record[4].parse::<f64>()?.to_radians(),
            });
        }
        Ok(result)
    }
}

/// Drive a recorded session through a locator sample-by-sample.
///
/// Each record becomes up to three [`SensorSample`]s (magnetometer only when
/// the record carries one), delivered in timestamp order exactly as the live
/// pipeline would receive them.
pub fn replay(records: &[ImuRecord], locator: &Locator, name: &str) -> TrajectoryResult {
    let mut unparsed_times = 0u64;
    let mut last_ns = 0i64;
    for (i, record) in records.iter().enumerate() {
        let ts = match record.timestamp_ns() {
            Some(ts) => ts,
            None => {
                unparsed_times += 1;
                last_ns + FALLBACK_DT_NS
            }
        };
        let ts = if i == 0 { ts } else { ts.max(last_ns + 1) };
        last_ns = ts;
        locator.feed_sample(SensorSample::accel(ts, record.acc_x, record.acc_y, record.acc_z));
        locator.feed_sample(SensorSample::gyro(
            ts,
            record.gyro_x,
            record.gyro_y,
            record.gyro_z,
        ));
        if !record.mag_is_empty() {
            locator.feed_sample(SensorSample::mag(ts, record.mag_x, record.mag_y, record.mag_z));
        }
    }
    if unparsed_times > 0 {
        log::warn!("{unparsed_times} records had unparseable times, used nominal spacing");
    }
    TrajectoryResult {
        name: name.to_string(),
        poses: locator.history(),
        metrics: locator.metrics(),
    }
}

/// Shape of a synthetic walking session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WalkProfile {
    /// Sample delivery rate (Hz).
    pub sample_rate_hz: f64,
    /// Step cadence (Hz); one vertical bounce per step.
    pub cadence_hz: f64,
    /// Peak vertical acceleration of the bounce (m/s²).
    pub bounce_amplitude: f64,
    /// Session length (s).
    pub duration_s: f64,
    /// Constant yaw rate of the walker (rad/s); zero walks straight.
    pub turn_rate_rps: f64,
    /// Accelerometer noise standard deviation (m/s²).
    pub accel_noise_std: f64,
    /// Gyroscope noise standard deviation (rad/s).
    pub gyro_noise_std: f64,
    /// Whether magnetometer rows are generated.
    pub with_magnetometer: bool,
    /// RNG seed; the same seed reproduces the same session.
    pub seed: u64,
}

impl Default for WalkProfile {
    fn default() -> Self {
        WalkProfile {
            sample_rate_hz: 100.0,
            cadence_hz: 1.5,
            bounce_amplitude: 3.0,
            duration_s: 20.0,
            turn_rate_rps: 0.0,
            accel_noise_std: 0.05,
            gyro_noise_std: 0.005,
            with_magnetometer: true,
            seed: 42,
        }
    }
}

/// Session-frame Earth field used by the generator (µT), pointing at
/// session north with a realistic downward component.
const WORLD_FIELD: [f64; 3] = [40.0, 0.0, -30.0];

/// Generate a synthetic walking session: gravity plus a vertical bounce at
/// the step cadence, a constant turn rate on the gyro Z axis, and the Earth
/// field counter-rotated into the body frame. Deterministic per seed.
pub fn synthetic_walk(profile: &WalkProfile) -> Vec<ImuRecord> {
    let mut rng = StdRng::seed_from_u64(profile.seed);
    let accel_noise = Normal::new(0.0, profile.accel_noise_std.max(0.0)).ok();
    let gyro_noise = Normal::new(0.0, profile.gyro_noise_std.max(0.0)).ok();
    let draw = |noise: &Option<Normal<f64>>, rng: &mut StdRng| -> f64 {
        noise.as_ref().map_or(0.0, |n| n.sample(rng))
    };

    let base = DateTime::<FixedOffset>::parse_from_str("2025-04-13 17:00:00.000+0000", TIME_FORMAT)
        .unwrap_or_default();
    let n = (profile.duration_s * profile.sample_rate_hz) as usize;
    let dt_ms = 1000.0 / profile.sample_rate_hz;
    let mut records = Vec::with_capacity(n);
    for i in 0..n {
        let t = i as f64 / profile.sample_rate_hz;
        let bounce = profile.bounce_amplitude
            * (2.0 * std::f64::consts::PI * profile.cadence_hz * t).sin();
        let heading = profile.turn_rate_rps * t;
        let (mag_x, mag_y, mag_z) = if profile.with_magnetometer {
            // Body frame sees the world field rotated by -heading about Z.
            (
                WORLD_FIELD[0] * heading.cos() + WORLD_FIELD[1] * heading.sin(),
                -WORLD_FIELD[0] * heading.sin() + WORLD_FIELD[1] * heading.cos(),
                WORLD_FIELD[2],
            )
        } else {
            (0.0, 0.0, 0.0)
        };
        let time = base + Duration::milliseconds((i as f64 * dt_ms).round() as i64);
        records.push(ImuRecord {
            time: time.format(TIME_FORMAT).to_string(),
            acc_x: draw(&accel_noise, &mut rng),
            acc_y: draw(&accel_noise, &mut rng),
            acc_z: 9.81 + bounce + draw(&accel_noise, &mut rng),
            gyro_x: draw(&gyro_noise, &mut rng),
            gyro_y: draw(&gyro_noise, &mut rng),
            gyro_z: profile.turn_rate_rps + draw(&gyro_noise, &mut rng),
            mag_x,
            mag_y,
            mag_z,
        });
    }
    records
}

/// Expected step count of a [`synthetic_walk`] session.
pub fn expected_steps(profile: &WalkProfile) -> u64 {
    (profile.cadence_hz * profile.duration_s) as u64
}
