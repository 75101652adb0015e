//! # Per-region motion tracking
//!
//! A [`RoiTracker`] turns a sequence of region crops into calibrated
//! displacement and time-windowed velocity. Per-frame millimetre
//! displacements are summed per wall-clock second; every second boundary
//! finalizes one velocity sample, and every 30 samples refresh the block
//! average.

use crate::prelude::v1::*;
use log::debug;
use nalgebra as na;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of velocity samples averaged per block.
pub const AVERAGE_WINDOW: usize = 30;

/// Current wall-clock time at second resolution.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One processed frame of a tracked region.
#[derive(Clone, Copy, Debug)]
pub struct HistoryEntry {
    /// Second-resolution timestamp of the frame.
    pub secs: u64,
    /// Raw pixel displacement.
    pub delta_px: na::Vector2<f32>,
    /// Calibrated displacement in millimetres.
    pub delta_mm: f32,
    /// Velocity sample back-filled when a later frame closes the second.
    pub velocity: Option<f32>,
}

/// What a single `process` call produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackUpdate {
    /// A velocity sample was finalized by this call.
    pub new_velocity: bool,
    /// The rolling average was recomputed by this call.
    pub new_average: bool,
}

/// Motion tracker for one user-defined region.
///
/// Owns its flow estimator and a calibration snapshot taken at creation time;
/// later global calibration changes do not affect an existing tracker.
pub struct RoiTracker {
    rect: RoiRect,
    estimator: Box<dyn FlowEstimator>,
    calibration: Calibration,
    color: Bgr,
    cross: na::Point2<f32>,
    delta_history: Vec<HistoryEntry>,
    velocity_history: Vec<f32>,
    accumulator: f32,
    last_secs: u64,
    average: Option<f32>,
}

impl RoiTracker {
    /// Create a tracker with the wall clock as the second baseline.
    pub fn new(rect: RoiRect, estimator: Box<dyn FlowEstimator>, calibration: Calibration) -> Self {
        Self::new_at(rect, estimator, calibration, now_secs())
    }

    /// Create a tracker with an explicit second baseline.
    ///
    /// The baseline stands in for the "previous processed frame" when the
    /// first real frame arrives.
    pub fn new_at(
        rect: RoiRect,
        estimator: Box<dyn FlowEstimator>,
        calibration: Calibration,
        secs: u64,
    ) -> Self {
        let mut rng = rand::thread_rng();

        Self {
            rect,
            estimator,
            calibration,
            color: Bgr {
                b: rng.gen(),
                g: rng.gen(),
                r: rng.gen(),
            },
            cross: rect.center(),
            delta_history: vec![],
            velocity_history: vec![],
            accumulator: 0.0,
            last_secs: secs,
            average: None,
        }
    }

    /// Process a crop of this region stamped with the current wall clock.
    pub fn process(&mut self, frame: &Frame) -> Result<TrackUpdate> {
        self.process_at(frame, now_secs())
    }

    /// Process a crop of this region.
    ///
    /// The first crop only primes the estimator and records nothing. Every
    /// later crop appends a history entry; crossing into a new second
    /// additionally finalizes the previous second's accumulated displacement
    /// as a velocity sample.
    ///
    /// # Arguments
    ///
    /// * `frame` - crop of this region, in the same coordinate space as the
    ///   rectangle. The tracker performs no rescaling.
    /// * `secs` - second-resolution timestamp of the frame.
    pub fn process_at(&mut self, frame: &Frame, secs: u64) -> Result<TrackUpdate> {
        let delta_px = match self.estimator.analyze(frame)? {
            Some(delta) => delta,
            None => return Ok(TrackUpdate::default()),
        };

        let delta_mm = self.calibration.project(delta_px);

        self.advance_cross(delta_px);

        let new_velocity = self.update_velocity(delta_mm, secs);
        let new_average = self.update_average();

        self.delta_history.push(HistoryEntry {
            secs,
            delta_px,
            delta_mm,
            velocity: None,
        });

        Ok(TrackUpdate {
            new_velocity,
            new_average,
        })
    }

    fn update_velocity(&mut self, delta_mm: f32, secs: u64) -> bool {
        if secs == self.last_secs {
            self.accumulator += delta_mm;
            return false;
        }

        self.last_secs = secs;

        let sample = self.accumulator;

        // Observed behaviour kept as-is: the sample lands on the entry that
        // will sit second-to-last once this frame's entry is appended, and
        // a lone entry is left unannotated.
        if self.delta_history.len() > 1 {
            if let Some(entry) = self.delta_history.last_mut() {
                entry.velocity = Some(sample);
            }
        }

        self.velocity_history.push(sample);
        self.accumulator = delta_mm;

        debug!("finalized velocity sample {:.4} mm/s", sample);

        true
    }

    fn update_average(&mut self) -> bool {
        let n = self.velocity_history.len();

        if n == 0 || n % AVERAGE_WINDOW != 0 {
            return false;
        }

        let sum: f32 = self.velocity_history[n - AVERAGE_WINDOW..].iter().sum();
        self.average = Some(sum / AVERAGE_WINDOW as f32);

        true
    }

    // Advance the display cross by the frame's displacement, wrapping back
    // into the rectangle.
    fn advance_cross(&mut self, delta: na::Vector2<f32>) {
        let mut cross = self.cross + delta;

        let x0 = self.rect.x as f32;
        let y0 = self.rect.y as f32;
        let w = self.rect.width as f32;
        let h = self.rect.height as f32;

        if cross.x < x0 {
            cross.x += w;
        }
        if cross.x >= x0 + w {
            cross.x -= w;
        }
        if cross.y < y0 {
            cross.y += h;
        }
        if cross.y >= y0 + h {
            cross.y -= h;
        }

        self.cross = cross;
    }

    /// Replace the flow estimator, discarding its accumulated motion state.
    ///
    /// Used on algorithm switches; tracked feature points never carry over
    /// between variants.
    pub fn set_estimator(&mut self, estimator: Box<dyn FlowEstimator>) {
        self.estimator = estimator;
    }

    pub fn rect(&self) -> RoiRect {
        self.rect
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Display colour assigned at creation.
    pub fn color(&self) -> Bgr {
        self.color
    }

    /// Current cross-hair display position.
    pub fn cross(&self) -> na::Point2<f32> {
        self.cross
    }

    /// Per-frame displacement history.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.delta_history
    }

    /// Finalized velocity samples, one per observed second boundary.
    pub fn velocity_history(&self) -> &[f32] {
        &self.velocity_history
    }

    /// Displacement accumulated within the current second so far.
    pub fn pending_velocity(&self) -> f32 {
        self.accumulator
    }

    /// Mean of the most recent full 30-sample block, if one completed.
    pub fn average_velocity(&self) -> Option<f32> {
        self.average
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::collections::VecDeque;

    /// Estimator fed from a fixed script of displacement results.
    struct ScriptedFlow {
        steps: VecDeque<Option<na::Vector2<f32>>>,
    }

    impl ScriptedFlow {
        fn new(steps: impl IntoIterator<Item = Option<na::Vector2<f32>>>) -> Box<Self> {
            Box::new(Self {
                steps: steps.into_iter().collect(),
            })
        }

        /// Sentinel first, then the same displacement forever.
        fn constant(delta: na::Vector2<f32>, frames: usize) -> Box<Self> {
            Self::new(
                std::iter::once(None).chain(std::iter::repeat(Some(delta)).take(frames)),
            )
        }
    }

    impl FlowEstimator for ScriptedFlow {
        fn analyze(&mut self, _: &Frame) -> Result<Option<na::Vector2<f32>>> {
            self.steps
                .pop_front()
                .ok_or_else(|| anyhow!("script exhausted"))
        }
    }

    fn tracker(estimator: Box<dyn FlowEstimator>) -> RoiTracker {
        RoiTracker::new_at(
            RoiRect::new(0, 0, 10, 10),
            estimator,
            Calibration::new(1.0, 0.0).unwrap(),
            0,
        )
    }

    fn crop() -> Frame {
        Frame::filled(10, 10, Bgr { b: 0, g: 0, r: 0 })
    }

    #[test]
    fn first_frame_is_sentinel() {
        let mut t = tracker(ScriptedFlow::constant(na::Vector2::new(1.0, 0.0), 1));

        assert_eq!(t.process_at(&crop(), 0).unwrap(), TrackUpdate::default());
        assert!(t.history().is_empty());

        // The second call yields a real entry.
        assert_eq!(t.process_at(&crop(), 0).unwrap(), TrackUpdate::default());
        assert_eq!(t.history().len(), 1);
    }

    #[test]
    fn history_grows_per_non_sentinel_frame() {
        let mut t = tracker(ScriptedFlow::constant(na::Vector2::new(0.5, 0.5), 7));

        for _ in 0..8 {
            t.process_at(&crop(), 0).unwrap();
        }

        assert_eq!(t.history().len(), 7);
    }

    #[test]
    fn second_boundary_finalizes_accumulated_displacement() {
        let mut t = tracker(ScriptedFlow::constant(na::Vector2::new(0.1, 0.0), 6));

        // Sentinel plus five frames within the same second.
        for _ in 0..6 {
            let up = t.process_at(&crop(), 0).unwrap();
            assert!(!up.new_velocity);
        }
        assert!(t.velocity_history().is_empty());
        assert_approx_eq!(t.pending_velocity(), 0.5);

        // The first frame of the next second closes the sample.
        let up = t.process_at(&crop(), 1).unwrap();
        assert!(up.new_velocity);
        assert_eq!(t.velocity_history().len(), 1);
        assert_approx_eq!(t.velocity_history()[0], 0.5);

        // The accumulator restarts from this frame's displacement.
        assert_approx_eq!(t.pending_velocity(), 0.1);
    }

    #[test]
    fn sample_lands_on_second_to_last_entry() {
        let mut t = tracker(ScriptedFlow::constant(na::Vector2::new(1.0, 0.0), 4));

        t.process_at(&crop(), 0).unwrap();
        t.process_at(&crop(), 0).unwrap();
        t.process_at(&crop(), 0).unwrap();
        t.process_at(&crop(), 1).unwrap();

        let history = t.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].velocity, None);
        assert_approx_eq!(history[1].velocity.unwrap(), 2.0);
        assert_eq!(history[2].velocity, None);
    }

    #[test]
    fn lone_entry_is_not_annotated() {
        let mut t = tracker(ScriptedFlow::constant(na::Vector2::new(1.0, 0.0), 2));

        t.process_at(&crop(), 0).unwrap();
        t.process_at(&crop(), 0).unwrap();
        let up = t.process_at(&crop(), 1).unwrap();

        assert!(up.new_velocity);
        assert_eq!(t.history()[0].velocity, None);
    }

    #[test]
    fn average_refreshes_on_full_blocks_only() {
        // One frame per second, 1.0 mm each: every frame past the first two
        // finalizes a 1.0 mm/s sample.
        let mut t = tracker(ScriptedFlow::constant(na::Vector2::new(1.0, 0.0), 40));

        t.process_at(&crop(), 0).unwrap();
        t.process_at(&crop(), 0).unwrap();

        let mut averages = 0;

        for secs in 1..=31 {
            let up = t.process_at(&crop(), secs).unwrap();

            if up.new_average {
                averages += 1;
                assert_eq!(t.velocity_history().len(), AVERAGE_WINDOW);
                assert_approx_eq!(t.average_velocity().unwrap(), 1.0);
            } else {
                assert!(t.velocity_history().len() % AVERAGE_WINDOW != 0);
            }
        }

        assert_eq!(averages, 1);
    }

    #[test]
    fn cross_advances_and_wraps() {
        let mut t = tracker(ScriptedFlow::constant(na::Vector2::new(4.0, 0.0), 2));

        assert_approx_eq!(t.cross().x, 5.0);

        t.process_at(&crop(), 0).unwrap();
        t.process_at(&crop(), 0).unwrap();
        assert_approx_eq!(t.cross().x, 9.0);

        // Next step leaves the rectangle and wraps around.
        let mut t = tracker(ScriptedFlow::constant(na::Vector2::new(6.0, 0.0), 2));
        t.process_at(&crop(), 0).unwrap();
        t.process_at(&crop(), 0).unwrap();
        assert_approx_eq!(t.cross().x, 1.0);
        assert_approx_eq!(t.cross().y, 5.0);
    }

    #[test]
    fn estimator_swap_keeps_aggregates() {
        let mut t = tracker(ScriptedFlow::constant(na::Vector2::new(1.0, 0.0), 2));

        t.process_at(&crop(), 0).unwrap();
        t.process_at(&crop(), 0).unwrap();
        t.process_at(&crop(), 1).unwrap();
        assert_eq!(t.velocity_history().len(), 1);

        t.set_estimator(ScriptedFlow::constant(na::Vector2::new(2.0, 0.0), 1));

        // Fresh estimator starts with a sentinel again, history remains.
        assert_eq!(t.process_at(&crop(), 1).unwrap(), TrackUpdate::default());
        assert_eq!(t.velocity_history().len(), 1);
        assert_eq!(t.history().len(), 2);
    }
}
