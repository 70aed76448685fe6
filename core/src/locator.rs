//! The locator session facade.
//!
//! [`Locator`] is the one surface the host application touches: it owns every
//! pipeline stage, bridges the platform's sensor callback thread into the
//! processing path, and runs model inference on a dedicated worker so a slow
//! model call never blocks sample delivery.
//!
//! ## Threading model
//!
//! `feed_sample` may be called from any thread; all pipeline state lives
//! behind a single mutex, and the per-sample work under that lock is cheap
//! (ring-buffer append, filter updates). When a step completes, its feature
//! window is handed to the inference worker over a bounded queue; if the
//! queue is full the step is dropped and counted rather than stalling the
//! sensor thread. Estimates are applied in step-index order regardless of
//! completion order (the integrator reorders), and a generation counter makes
//! `reset` safe against in-flight inference: estimates born before the reset
//! are discarded on arrival.
//!
//! A synchronous construction ([`Locator::new_synchronous`]) runs inference
//! inline on the feeding thread instead; offline replay wants determinism
//! more than latency.

use crate::estimator::{ClassicalConfig, ClassicalFormula, EstimateError, StepEstimate, StepLengthModel};
use crate::features::{FeatureConfig, FeatureExtractor, StepFeature};
use crate::orientation::{OrientationConfig, OrientationEstimator, OrientationState};
use crate::sampler::{SamplerConfig, SensorSampler};
use crate::step_detector::{StepDetector, StepDetectorConfig};
use crate::trajectory::{Pose, TrajectoryIntegrator};
use crate::{SensorKind, SensorSample};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// Top-level configuration bundling every pipeline stage.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Depth of the pending-inference queue; clamped to at least 4.
    /// Kept ahead of the per-stage tables so the TOML form serializes.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub step_detector: StepDetectorConfig,
    #[serde(default)]
    pub orientation: OrientationConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub classical: ClassicalConfig,
}

fn default_queue_depth() -> usize {
    8
}

impl Default for LocatorConfig {
    fn default() -> Self {
        LocatorConfig {
            queue_depth: default_queue_depth(),
            sampler: SamplerConfig::default(),
            step_detector: StepDetectorConfig::default(),
            orientation: OrientationConfig::default(),
            features: FeatureConfig::default(),
            classical: ClassicalConfig::default(),
        }
    }
}

impl LocatorConfig {
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }

    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }

    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

/// Counters for every recoverable condition in the pipeline. All values are
/// cumulative since the locator was built; `reset` does not clear them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocatorMetrics {
    /// Samples accepted into the pipeline.
    pub samples_accepted: u64,
    /// Ring-buffer overflows (oldest sample dropped).
    pub buffer_overflows: u64,
    /// Samples rejected for non-monotonic timestamps.
    pub samples_rejected: u64,
    /// Step detector filter resets caused by input gaps.
    pub gap_resets: u64,
    /// Steps detected.
    pub steps_detected: u64,
    /// Steps skipped because their window could not be extracted.
    pub steps_skipped: u64,
    /// Step candidates suppressed inside the refractory interval.
    pub steps_suppressed: u64,
    /// Features dropped because the inference queue was full.
    pub queue_drops: u64,
    /// Estimates produced by the classical fallback instead of the model.
    pub inference_fallbacks: u64,
    /// Estimates rejected outright (both model and fallback invalid).
    pub estimates_rejected: u64,
    /// Magnetometer samples rejected for interference.
    pub mag_rejections: u64,
}

/// Pipeline state shared between the feeding thread and the worker.
struct Shared {
    sampler: SensorSampler,
    detector: StepDetector,
    orientation: OrientationEstimator,
    integrator: TrajectoryIntegrator,
    samples_accepted: u64,
    steps_skipped: u64,
    queue_drops: u64,
    inference_fallbacks: u64,
    estimates_rejected: u64,
    degraded: bool,
    generation: u64,
}

struct Job {
    generation: u64,
    feature: StepFeature,
}

struct Models {
    primary: Box<dyn StepLengthModel>,
    fallback: ClassicalFormula,
}

/// The pedestrian dead reckoning session.
///
/// One instance per tracking session, with an explicit lifecycle: build,
/// feed samples, read poses, `reset` to start over, drop to tear down the
/// worker. Shareable across threads by reference.
pub struct Locator {
    inner: Arc<Mutex<Shared>>,
    extractor: FeatureExtractor,
    tx: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
    sync_models: Option<Mutex<Models>>,
}

impl Locator {
    /// Build a locator whose inference runs on a dedicated worker thread.
    ///
    /// `primary` is normally a [`LearnedModel`](crate::estimator::LearnedModel)
    /// wrapping the embedder's inference runtime; the classical formula is
    /// always installed as fallback.
    pub fn new(config: LocatorConfig, primary: Box<dyn StepLengthModel>) -> Self {
        let inner = Arc::new(Mutex::new(Shared::new(&config)));
        let (tx, rx) = sync_channel(config.queue_depth.max(4));
        let models = Models {
            primary,
            fallback: ClassicalFormula::new(config.classical),
        };
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("pdr-inference".into())
            .spawn(move || inference_loop(rx, models, worker_inner))
            .ok();
        if worker.is_none() {
            log::warn!("failed to spawn inference worker; locator will drop steps");
        }
        Locator {
            inner,
            extractor: FeatureExtractor::new(config.features),
            tx: Some(tx),
            worker,
            sync_models: None,
        }
    }

    /// Build a locator that runs inference inline on the feeding thread.
    /// Intended for offline replay and tests, where determinism matters more
    /// than sensor-callback latency.
    pub fn new_synchronous(config: LocatorConfig, primary: Box<dyn StepLengthModel>) -> Self {
        let models = Models {
            primary,
            fallback: ClassicalFormula::new(config.classical),
        };
        Locator {
            inner: Arc::new(Mutex::new(Shared::new(&config))),
            extractor: FeatureExtractor::new(config.features),
            tx: None,
            worker: None,
            sync_models: Some(Mutex::new(models)),
        }
    }

    /// Synchronous locator with the classical formula as primary estimator;
    /// the configuration for hosts with no model artifact at hand.
    pub fn classical(config: LocatorConfig) -> Self {
        let formula = ClassicalFormula::new(config.classical);
        Self::new_synchronous(config, Box::new(formula))
    }

    /// Feed one sensor sample into the pipeline. Never blocks on inference.
    pub fn feed_sample(&self, sample: SensorSample) {
        let mut shared = lock(&self.inner);
        shared.samples_accepted += 1;
        shared.sampler.submit(sample);
        shared.orientation.process(&sample);
        if sample.kind != SensorKind::Accelerometer {
            return;
        }
        let Some(event) = shared.detector.process(&sample) else {
            return;
        };
        match self.extractor.extract(&event, &shared.sampler) {
            Ok(feature) => self.dispatch(&mut shared, feature),
            Err(e) => {
                shared.steps_skipped += 1;
                shared.integrator.skip(event.index);
                log::debug!("step {} skipped: {e}", event.index);
            }
        }
    }

    /// Current pose (copy). Origin until the first step is applied.
    pub fn current_pose(&self) -> Pose {
        lock(&self.inner).integrator.current_pose()
    }

    /// Snapshot copy of the pose history, oldest first.
    pub fn history(&self) -> Vec<Pose> {
        lock(&self.inner).integrator.history()
    }

    /// Snapshot of the attitude estimate.
    pub fn current_orientation(&self) -> OrientationState {
        lock(&self.inner).orientation.current_orientation()
    }

    /// True once any estimate has come from the fallback formula instead of
    /// the learned model. Cleared by `reset`.
    pub fn degraded(&self) -> bool {
        lock(&self.inner).degraded
    }

    /// Aggregated pipeline counters.
    pub fn metrics(&self) -> LocatorMetrics {
        let shared = lock(&self.inner);
        LocatorMetrics::default().aggregate(&shared)
    }

    /// Start the session over: origin pose, empty history, fresh filter
    /// state. Safe to call while inference is in flight; estimates for steps
    /// detected before the reset are discarded when they arrive.
    pub fn reset(&self) {
        let mut shared = lock(&self.inner);
        shared.generation += 1;
        shared.sampler.reset();
        shared.detector.reset();
        shared.orientation.reset();
        shared.integrator.reset();
        shared.degraded = false;
        log::debug!("session reset (generation {})", shared.generation);
    }

    /// Stop accepting new inference work and wait for the worker to drain.
    /// Steps detected afterwards are skipped. Called implicitly on drop;
    /// exposed so replay can flush before reading final state.
    pub fn finish(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::warn!("inference worker panicked");
        }
    }

    fn dispatch(&self, shared: &mut MutexGuard<'_, Shared>, feature: StepFeature) {
        if let Some(tx) = &self.tx {
            let job = Job {
                generation: shared.generation,
                feature,
            };
            match tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    shared.queue_drops += 1;
                    shared.integrator.skip(job.feature.step_index);
                    log::warn!(
                        "inference queue full, dropping step {}",
                        job.feature.step_index
                    );
                }
                Err(TrySendError::Disconnected(job)) => {
                    shared.queue_drops += 1;
                    shared.integrator.skip(job.feature.step_index);
                }
            }
        } else if let Some(models) = &self.sync_models {
            let models = lock(models);
            let outcome = estimate_with_fallback(&models, &feature);
            apply_outcome(shared, outcome, &feature);
        }
    }
}

impl Drop for Locator {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Shared {
    fn new(config: &LocatorConfig) -> Self {
        Shared {
            sampler: SensorSampler::new(config.sampler),
            detector: StepDetector::new(config.step_detector),
            orientation: OrientationEstimator::new(config.orientation),
            integrator: TrajectoryIntegrator::new(),
            samples_accepted: 0,
            steps_skipped: 0,
            queue_drops: 0,
            inference_fallbacks: 0,
            estimates_rejected: 0,
            degraded: false,
            generation: 0,
        }
    }
}

impl LocatorMetrics {
    fn aggregate(mut self, shared: &Shared) -> Self {
        self.samples_accepted = shared.samples_accepted;
        self.buffer_overflows = shared.sampler.overflow_count();
        self.samples_rejected = shared.sampler.rejected_count();
        self.gap_resets = shared.detector.gap_resets();
        self.steps_detected = shared.detector.step_count();
        self.steps_suppressed = shared.detector.suppressed_count();
        self.mag_rejections = shared.orientation.mag_rejections();
        self.steps_skipped = shared.steps_skipped;
        self.queue_drops = shared.queue_drops;
        self.inference_fallbacks = shared.inference_fallbacks;
        self.estimates_rejected = shared.estimates_rejected + shared.integrator.rejected_count();
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn inference_loop(rx: Receiver<Job>, models: Models, inner: Arc<Mutex<Shared>>) {
    while let Ok(job) = rx.recv() {
        // The model call is the slow part; keep it outside the lock.
        let outcome = estimate_with_fallback(&models, &job.feature);
        let mut shared = lock(&inner);
        if job.generation != shared.generation {
            log::debug!(
                "discarding estimate for step {} from a previous session",
                job.feature.step_index
            );
            continue;
        }
        apply_outcome(&mut shared, outcome, &job.feature);
    }
}

/// Run the primary model, falling back to the classical formula on any
/// validation or runtime failure. The boolean reports whether the fallback
/// produced the value.
fn estimate_with_fallback(
    models: &Models,
    feature: &StepFeature,
) -> (Result<StepEstimate, EstimateError>, bool) {
    match models.primary.estimate(feature) {
        Ok(estimate) => (Ok(estimate), false),
        Err(e) => {
            log::warn!(
                "{} model failed for step {}: {e}; using {} formula",
                models.primary.name(),
                feature.step_index,
                models.fallback.name()
            );
            (models.fallback.estimate(feature), true)
        }
    }
}

fn apply_outcome(
    shared: &mut Shared,
    (result, used_fallback): (Result<StepEstimate, EstimateError>, bool),
    feature: &StepFeature,
) {
    if used_fallback {
        shared.inference_fallbacks += 1;
        shared.degraded = true;
    }
    match result {
        Ok(estimate) => {
            let heading = shared
                .orientation
                .heading_at(feature.peak_ns)
                .unwrap_or_else(|| shared.orientation.heading());
            if let Err(e) = shared.integrator.apply(estimate, heading, feature.peak_ns) {
                // The step stays un-applied; release the in-order watermark
                // so later steps do not wait on it.
                shared.integrator.skip(estimate.step_index);
                log::warn!("{e}");
            }
        }
        Err(e) => {
            shared.estimates_rejected += 1;
            shared.integrator.skip(feature.step_index);
            log::warn!("step {} dropped entirely: {e}", feature.step_index);
        }
    }
}
