//! # Frame orchestration
//!
//! The [`Pipeline`] sequences delivered frames, fans each one out to every
//! tracked region and summarizes whether velocity or average consumers need a
//! refresh.
//!
//! Region rectangles and the frames fed here must share one coordinate
//! space; the pipeline crops but never rescales. Any display-side resizing
//! has to happen before both ROI creation and frame delivery.

use crate::prelude::v1::*;
use crate::tracker::now_secs;
use log::debug;

/// Default pixels-per-millimetre ratio before calibration.
pub const DEFAULT_PX_PER_MM: f32 = 1.0;
/// Default overflow direction, straight down the image.
pub const DEFAULT_DEGREE: f32 = -90.0;

/// Creates flow estimators for newly added regions.
///
/// Backend crates provide the real implementation; tests script their own.
pub trait EstimatorFactory: Send {
    /// Instantiate a fresh estimator for the given algorithm selection.
    fn create(&self, params: &FlowParams) -> Result<Box<dyn FlowEstimator>>;
}

/// Summary of one orchestrated frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Frames delivered so far, including this one.
    pub frame_count: u64,
    /// At least one tracker finalized a velocity sample.
    pub new_velocity: bool,
    /// At least one tracker recomputed its rolling average.
    pub new_average: bool,
}

/// Frame orchestrator over an ordered set of tracked regions.
pub struct Pipeline {
    factory: Box<dyn EstimatorFactory>,
    params: FlowParams,
    px_per_mm: f32,
    degree: f32,
    frame_count: u64,
    frame_log: Vec<(u64, u64)>,
    trackers: Vec<RoiTracker>,
}

impl Pipeline {
    /// Create an empty pipeline backed by the given estimator factory.
    pub fn new(factory: Box<dyn EstimatorFactory>) -> Self {
        Self {
            factory,
            params: Default::default(),
            px_per_mm: DEFAULT_PX_PER_MM,
            degree: DEFAULT_DEGREE,
            frame_count: 0,
            frame_log: vec![],
            trackers: vec![],
        }
    }

    /// Set the global pixels-per-millimetre ratio for future regions.
    ///
    /// Existing trackers keep the snapshot taken when they were added.
    pub fn set_calibration(&mut self, px_per_mm: f32) -> Result<()> {
        // Validate eagerly so a bad ratio fails here, not at add_roi time.
        Calibration::new(px_per_mm, self.degree)?;
        self.px_per_mm = px_per_mm;
        Ok(())
    }

    /// Set the global overflow direction for future regions.
    pub fn set_direction(&mut self, degree: f32) {
        self.degree = degree;
    }

    /// Switch the flow algorithm.
    ///
    /// Every existing tracker gets a fresh estimator, discarding accumulated
    /// motion state; future regions use the new selection too.
    pub fn set_params(&mut self, params: FlowParams) -> Result<()> {
        for tracker in &mut self.trackers {
            tracker.set_estimator(self.factory.create(&params)?);
        }

        self.params = params;
        Ok(())
    }

    pub fn params(&self) -> FlowParams {
        self.params
    }

    /// Append a tracked region.
    ///
    /// The tracker snapshots the current global calibration and direction.
    pub fn add_roi(&mut self, rect: RoiRect) -> Result<()> {
        let estimator = self.factory.create(&self.params)?;
        let calibration = Calibration::new(self.px_per_mm, self.degree)?;

        debug!("adding region {:?}", rect);

        self.trackers
            .push(RoiTracker::new(rect, estimator, calibration));

        Ok(())
    }

    /// Remove the most recently added region.
    ///
    /// Returns `false` without touching anything when no region exists.
    pub fn delete_last_roi(&mut self) -> bool {
        self.trackers.pop().is_some()
    }

    /// Clear the frame counter, the frame log and all regions.
    pub fn reset(&mut self) {
        self.frame_count = 0;
        self.frame_log.clear();
        self.trackers.clear();
    }

    /// Process a delivered frame stamped with the current wall clock.
    pub fn process(&mut self, frame: &Frame) -> Result<ProcessOutcome> {
        self.process_at(frame, now_secs())
    }

    /// Process a delivered frame.
    ///
    /// Crops the frame for every region whose rectangle is valid and runs its
    /// tracker; invalid rectangles are skipped for this frame without error.
    ///
    /// # Arguments
    ///
    /// * `frame` - the raw frame, consumed once per delivery.
    /// * `secs` - second-resolution delivery timestamp.
    pub fn process_at(&mut self, frame: &Frame, secs: u64) -> Result<ProcessOutcome> {
        self.frame_count += 1;
        self.frame_log.push((self.frame_count, secs));

        let mut new_velocity = false;
        let mut new_average = false;

        for tracker in &mut self.trackers {
            let crop = match frame.crop(tracker.rect()) {
                Some(crop) => crop,
                None => continue,
            };

            let update = tracker.process_at(&crop, secs)?;
            new_velocity |= update.new_velocity;
            new_average |= update.new_average;
        }

        Ok(ProcessOutcome {
            frame_count: self.frame_count,
            new_velocity,
            new_average,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Delivery log of (frame number, timestamp) pairs.
    pub fn frame_log(&self) -> &[(u64, u64)] {
        &self.frame_log
    }

    /// Tracked regions in insertion order.
    pub fn trackers(&self) -> &[RoiTracker] {
        &self.trackers
    }
}
