//! Trajectory integration.
//!
//! Accumulates validated (step length, heading) pairs into a position track.
//! Estimates are applied strictly in step-index order even when inference
//! completes out of order: early arrivals wait in a small reorder buffer.
//! Implausible lengths are rejected here as a second line of defense; the
//! estimator seam should have caught them, but a 5 m "step" must never move
//! the pose no matter where it came from.

use crate::estimator::{MAX_STEP_LENGTH_M, MIN_STEP_LENGTH_M, StepEstimate};
use crate::wrap_to_pi;
use nalgebra::Vector3;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

/// Position and heading at one instant, meters in the session frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    /// Timestamp of the step that produced this pose (ns).
    pub timestamp_ns: i64,
    /// Position in the local East-North-Up session frame (m).
    pub position: Vector3<f64>,
    /// Heading at this pose, radians in (-π, π].
    pub heading_rad: f64,
}

impl Pose {
    /// The session origin: zero position, identity heading.
    pub fn origin() -> Self {
        Pose {
            timestamp_ns: 0,
            position: Vector3::zeros(),
            heading_rad: 0.0,
        }
    }
}

impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose {{ t: {} ns, position: [{:.3}, {:.3}, {:.3}] m, heading: {:.1}° }}",
            self.timestamp_ns,
            self.position[0],
            self.position[1],
            self.position[2],
            self.heading_rad.to_degrees()
        )
    }
}

/// Lifecycle of the integrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingState {
    /// Fresh session, nothing integrated yet.
    Initialized,
    /// At least one step applied.
    Tracking,
    /// Transient state inside [`TrajectoryIntegrator::reset`].
    Reset,
}

/// Why an estimate was not applied.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IntegrateError {
    /// Length outside the plausible band; the pose did not move.
    ImplausibleLength { step_index: u64, length_m: f64 },
}

impl Display for IntegrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrateError::ImplausibleLength {
                step_index,
                length_m,
            } => write!(
                f,
                "step {step_index}: implausible length {length_m} m rejected"
            ),
        }
    }
}

impl std::error::Error for IntegrateError {}

/// Step-and-heading dead reckoning integrator.
///
/// Owns the single live [`Pose`] and its append-only history. All mutation
/// funnels through [`apply`](Self::apply) and [`reset`](Self::reset); readers
/// get copies.
#[derive(Debug)]
pub struct TrajectoryIntegrator {
    state: TrackingState,
    pose: Pose,
    history: Vec<Pose>,
    /// Next step index eligible for application.
    next_index: u64,
    /// Early arrivals waiting for their predecessors.
    pending: BTreeMap<u64, (StepEstimate, f64, i64)>,
    /// Indices that will never produce an estimate; the watermark steps over
    /// them instead of waiting forever.
    voided: BTreeSet<u64>,
    rejected: u64,
}

impl TrajectoryIntegrator {
    pub fn new() -> Self {
        TrajectoryIntegrator {
            state: TrackingState::Initialized,
            pose: Pose::origin(),
            history: Vec::new(),
            next_index: 0,
            pending: BTreeMap::new(),
            voided: BTreeSet::new(),
            rejected: 0,
        }
    }

    /// Apply one estimate at the heading observed at its step peak.
    ///
    /// Estimates older than the current session watermark are silently
    /// dropped (they belong to a step already applied, or to a session that
    /// ended at the last reset). Estimates arriving ahead of order are held
    /// and applied once the gap fills.
    pub fn apply(
        &mut self,
        estimate: StepEstimate,
        heading_rad: f64,
        timestamp_ns: i64,
    ) -> Result<(), IntegrateError> {
        if !estimate.length_m.is_finite()
            || !(MIN_STEP_LENGTH_M..=MAX_STEP_LENGTH_M).contains(&estimate.length_m)
        {
            self.rejected += 1;
            return Err(IntegrateError::ImplausibleLength {
                step_index: estimate.step_index,
                length_m: estimate.length_m,
            });
        }
        if estimate.step_index < self.next_index {
            log::debug!(
                "discarding stale estimate for step {} (watermark {})",
                estimate.step_index,
                self.next_index
            );
            return Ok(());
        }
        self.pending
            .insert(estimate.step_index, (estimate, heading_rad, timestamp_ns));
        self.drain_ready();
        Ok(())
    }

    /// Current pose (copy).
    pub fn current_pose(&self) -> Pose {
        self.pose
    }

    /// Snapshot of the pose history, oldest first. A copy, not a live view:
    /// the caller can iterate at leisure while integration continues.
    pub fn history(&self) -> Vec<Pose> {
        self.history.clone()
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    /// Steps actually applied this session (skipped indices not counted).
    pub fn steps_applied(&self) -> u64 {
        self.history.len() as u64
    }

    /// Estimates rejected for implausible length.
    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    /// Total walked distance this session (m).
    pub fn total_distance(&self) -> f64 {
        self.history
            .windows(2)
            .map(|w| (w[1].position - w[0].position).norm())
            .sum::<f64>()
            + self
                .history
                .first()
                .map(|p| p.position.norm())
                .unwrap_or(0.0)
    }

    /// Clear the session: origin pose, empty history, watermark rewound.
    /// Idempotent; calling twice leaves the same origin as calling once.
    pub fn reset(&mut self) {
        self.state = TrackingState::Reset;
        self.pose = Pose::origin();
        self.history.clear();
        self.pending.clear();
        self.voided.clear();
        self.next_index = 0;
        self.state = TrackingState::Initialized;
    }

    /// Declare that a step index will never receive an estimate (its window
    /// could not be extracted, its feature was dropped, or its estimate was
    /// rejected). Without this, in-order application would wait on the
    /// missing index forever and freeze the track.
    pub fn skip(&mut self, step_index: u64) {
        if step_index < self.next_index {
            return;
        }
        self.voided.insert(step_index);
        self.drain_ready();
    }

    /// Re-anchor the track to an externally supplied absolute position.
    ///
    /// Future steps integrate from the new anchor; the step-relative history
    /// is preserved untouched. This is the hook for absolute-position
    /// corrections; nothing in this crate calls it.
    pub fn apply_anchor(&mut self, position: Vector3<f64>) {
        self.pose.position = position;
    }

    fn drain_ready(&mut self) {
        loop {
            if let Some((estimate, heading, timestamp)) = self.pending.remove(&self.next_index) {
                self.advance(estimate, heading, timestamp);
                self.next_index += 1;
            } else if self.voided.remove(&self.next_index) {
                self.next_index += 1;
            } else {
                break;
            }
        }
    }

    fn advance(&mut self, estimate: StepEstimate, heading_rad: f64, timestamp_ns: i64) {
        let heading = wrap_to_pi(heading_rad + estimate.heading_delta_rad.unwrap_or(0.0));
        let displacement =
            Vector3::new(heading.cos(), heading.sin(), 0.0) * estimate.length_m;
        // History timestamps are strictly increasing; a duplicate step-peak
        // timestamp is nudged forward one tick rather than violating that.
        let timestamp = match self.history.last() {
            Some(last) if timestamp_ns <= last.timestamp_ns => last.timestamp_ns + 1,
            _ => timestamp_ns,
        };
        self.pose = Pose {
            timestamp_ns: timestamp,
            position: self.pose.position + displacement,
            heading_rad: heading,
        };
        self.history.push(self.pose);
        self.state = TrackingState::Tracking;
        log::debug!(
            "step {} applied: {:.2} m at {:.1}°, position [{:.2}, {:.2}]",
            estimate.step_index,
            estimate.length_m,
            heading.to_degrees(),
            self.pose.position[0],
            self.pose.position[1]
        );
    }
}

impl Default for TrajectoryIntegrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn estimate(index: u64, length: f64) -> StepEstimate {
        StepEstimate {
            step_index: index,
            length_m: length,
            heading_delta_rad: None,
        }
    }

    #[test]
    fn test_ten_steps_straight_line() {
        let mut integrator = TrajectoryIntegrator::new();
        for i in 0..10 {
            integrator
                .apply(estimate(i, 0.75), 0.0, (i as i64 + 1) * 500_000_000)
                .unwrap();
        }
        let pose = integrator.current_pose();
        assert_approx_eq!(pose.position[0], 7.5, 1e-9);
        assert_approx_eq!(pose.position[1], 0.0, 1e-9);
        assert_eq!(integrator.history().len(), 10);
        assert_eq!(integrator.state(), TrackingState::Tracking);
    }

    #[test]
    fn test_known_heading_round_trip() {
        // N steps of length L at heading θ land at (N·L·cosθ, N·L·sinθ).
        let theta = PI / 6.0;
        let mut integrator = TrajectoryIntegrator::new();
        for i in 0..8 {
            integrator
                .apply(estimate(i, 0.6), theta, (i as i64 + 1) * 500_000_000)
                .unwrap();
        }
        let pose = integrator.current_pose();
        assert_approx_eq!(pose.position[0], 8.0 * 0.6 * theta.cos(), 1e-9);
        assert_approx_eq!(pose.position[1], 8.0 * 0.6 * theta.sin(), 1e-9);
        assert_approx_eq!(integrator.total_distance(), 4.8, 1e-9);
    }

    #[test]
    fn test_heading_delta_applied() {
        let mut integrator = TrajectoryIntegrator::new();
        let est = StepEstimate {
            step_index: 0,
            length_m: 1.0,
            heading_delta_rad: Some(PI / 2.0),
        };
        integrator.apply(est, 0.0, 1).unwrap();
        let pose = integrator.current_pose();
        assert_approx_eq!(pose.position[0], 0.0, 1e-9);
        assert_approx_eq!(pose.position[1], 1.0, 1e-9);
        assert_approx_eq!(pose.heading_rad, PI / 2.0, 1e-9);
    }

    #[test]
    fn test_implausible_length_rejected() {
        let mut integrator = TrajectoryIntegrator::new();
        integrator.apply(estimate(0, 0.75), 0.0, 1).unwrap();
        let before = integrator.current_pose();
        let err = integrator.apply(estimate(1, 5.0), 0.0, 2).unwrap_err();
        assert!(matches!(err, IntegrateError::ImplausibleLength { .. }));
        assert_eq!(integrator.current_pose(), before);
        assert_eq!(integrator.rejected_count(), 1);
        // The watermark did not advance; a corrected estimate for the same
        // step still applies.
        integrator.apply(estimate(1, 0.8), 0.0, 3).unwrap();
        assert_eq!(integrator.steps_applied(), 2);
    }

    #[test]
    fn test_out_of_order_estimates_apply_in_index_order() {
        let mut integrator = TrajectoryIntegrator::new();
        // Steps 1 and 2 finish inference before step 0.
        integrator.apply(estimate(1, 0.5), PI / 2.0, 200).unwrap();
        integrator.apply(estimate(2, 0.5), PI, 300).unwrap();
        assert_eq!(integrator.history().len(), 0);
        integrator.apply(estimate(0, 0.5), 0.0, 100).unwrap();
        let history = integrator.history();
        assert_eq!(history.len(), 3);
        // Applied in index order: east, north, west.
        assert_approx_eq!(history[0].position[0], 0.5, 1e-9);
        assert_approx_eq!(history[1].position[1], 0.5, 1e-9);
        assert_approx_eq!(history[2].position[0], 0.0, 1e-9);
        for pair in history.windows(2) {
            assert!(pair[0].timestamp_ns < pair[1].timestamp_ns);
        }
    }

    #[test]
    fn test_stale_estimate_dropped() {
        let mut integrator = TrajectoryIntegrator::new();
        integrator.apply(estimate(0, 0.7), 0.0, 100).unwrap();
        let before = integrator.current_pose();
        // A duplicate (or post-reset leftover) for step 0 is a no-op.
        integrator.apply(estimate(0, 1.5), 0.0, 150).unwrap();
        assert_eq!(integrator.current_pose(), before);
        assert_eq!(integrator.history().len(), 1);
    }

    #[test]
    fn test_reset_idempotent() {
        let mut integrator = TrajectoryIntegrator::new();
        for i in 0..5 {
            integrator
                .apply(estimate(i, 0.7), 0.3, (i as i64 + 1) * 100)
                .unwrap();
        }
        integrator.reset();
        let once = integrator.current_pose();
        integrator.reset();
        let twice = integrator.current_pose();
        assert_eq!(once, twice);
        assert_eq!(once, Pose::origin());
        assert!(integrator.history().is_empty());
        assert_eq!(integrator.state(), TrackingState::Initialized);
    }

    #[test]
    fn test_indices_restart_after_reset() {
        let mut integrator = TrajectoryIntegrator::new();
        integrator.apply(estimate(0, 0.7), 0.0, 100).unwrap();
        integrator.reset();
        integrator.apply(estimate(0, 0.7), 0.0, 100).unwrap();
        assert_eq!(integrator.history().len(), 1);
    }

    #[test]
    fn test_anchor_preserves_history() {
        let mut integrator = TrajectoryIntegrator::new();
        for i in 0..3 {
            integrator
                .apply(estimate(i, 1.0), 0.0, (i as i64 + 1) * 100)
                .unwrap();
        }
        let history_before = integrator.history();
        integrator.apply_anchor(Vector3::new(100.0, 50.0, 0.0));
        assert_eq!(integrator.history(), history_before);
        integrator.apply(estimate(3, 1.0), 0.0, 400).unwrap();
        let pose = integrator.current_pose();
        assert_approx_eq!(pose.position[0], 101.0, 1e-9);
        assert_approx_eq!(pose.position[1], 50.0, 1e-9);
    }

    #[test]
    fn test_skipped_index_unblocks_successors() {
        let mut integrator = TrajectoryIntegrator::new();
        // Step 0's window could not be extracted; steps 1 and 2 arrive.
        integrator.apply(estimate(1, 0.5), 0.0, 200).unwrap();
        assert!(integrator.history().is_empty());
        integrator.skip(0);
        assert_eq!(integrator.history().len(), 1);
        integrator.apply(estimate(2, 0.5), 0.0, 300).unwrap();
        assert_eq!(integrator.history().len(), 2);
        assert_eq!(integrator.steps_applied(), 2);
    }

    #[test]
    fn test_skip_in_the_middle_of_flight() {
        let mut integrator = TrajectoryIntegrator::new();
        integrator.apply(estimate(0, 0.5), 0.0, 100).unwrap();
        // Step 1 dropped at the queue; 2 and 3 complete out of order.
        integrator.apply(estimate(3, 0.5), 0.0, 400).unwrap();
        integrator.apply(estimate(2, 0.5), 0.0, 300).unwrap();
        assert_eq!(integrator.history().len(), 1);
        integrator.skip(1);
        assert_eq!(integrator.history().len(), 3);
    }

    #[test]
    fn test_skip_below_watermark_is_noop() {
        let mut integrator = TrajectoryIntegrator::new();
        integrator.apply(estimate(0, 0.5), 0.0, 100).unwrap();
        integrator.skip(0);
        integrator.apply(estimate(1, 0.5), 0.0, 200).unwrap();
        assert_eq!(integrator.history().len(), 2);
    }

    #[test]
    fn test_duplicate_timestamp_nudged_forward() {
        let mut integrator = TrajectoryIntegrator::new();
        integrator.apply(estimate(0, 0.5), 0.0, 100).unwrap();
        integrator.apply(estimate(1, 0.5), 0.0, 100).unwrap();
        let history = integrator.history();
        assert!(history[1].timestamp_ns > history[0].timestamp_ns);
    }
}
