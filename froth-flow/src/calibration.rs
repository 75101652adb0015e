//! # Pixel-to-millimetre calibration

use crate::prelude::v1::*;
use nalgebra as na;
use serde::{Deserialize, Serialize};

/// Scalar spatial calibration of a tracked region.
///
/// Holds the pixels-per-millimetre ratio and the overflow direction angle.
/// The angle is measured in degrees, counterclockwise from the positive
/// horizontal axis, with the y axis inverted since image rows grow downwards.
/// No lens distortion or perspective correction is modelled.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Calibration {
    px_per_mm: f32,
    degree: f32,
}

impl Calibration {
    /// Create a calibration from a ratio and direction.
    ///
    /// # Arguments
    ///
    /// * `px_per_mm` - pixels per millimetre, must be positive.
    /// * `degree` - overflow direction angle in degrees.
    pub fn new(px_per_mm: f32, degree: f32) -> Result<Self> {
        if px_per_mm <= 0.0 {
            return Err(anyhow!("calibration ratio must be positive"));
        }

        Ok(Self { px_per_mm, degree })
    }

    /// Derive the ratio from a measured pixel length of a known physical length.
    ///
    /// # Arguments
    ///
    /// * `measured_px` - length of the reference ruler in pixels.
    /// * `known_mm` - physical length of the reference ruler in millimetres.
    /// * `degree` - overflow direction angle in degrees.
    pub fn from_measurement(measured_px: f32, known_mm: f32, degree: f32) -> Result<Self> {
        if known_mm <= 0.0 {
            return Err(anyhow!("reference length must be positive"));
        }

        Self::new(measured_px / known_mm, degree)
    }

    pub fn px_per_mm(&self) -> f32 {
        self.px_per_mm
    }

    pub fn degree(&self) -> f32 {
        self.degree
    }

    /// Unit vector of the overflow direction in image coordinates.
    pub fn direction(&self) -> na::Vector2<f32> {
        let rad = self.degree.to_radians();
        // Positive y points down the image, hence the negated sine.
        na::Vector2::new(rad.cos(), -rad.sin())
    }

    /// Project a pixel displacement onto the direction, in millimetres.
    ///
    /// # Arguments
    ///
    /// * `delta_px` - raw displacement in pixels.
    pub fn project(&self, delta_px: na::Vector2<f32>) -> f32 {
        delta_px.dot(&self.direction()) / self.px_per_mm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn ratio_must_be_positive() {
        assert!(Calibration::new(0.0, 0.0).is_err());
        assert!(Calibration::new(-1.0, 0.0).is_err());
        assert!(Calibration::new(1.0, 0.0).is_ok());
    }

    #[test]
    fn ratio_from_measurement() {
        let cal = Calibration::from_measurement(40.0, 2.0, 0.0).unwrap();
        assert_approx_eq!(cal.px_per_mm(), 20.0);
        assert!(Calibration::from_measurement(40.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn axis_aligned_projections() {
        let dx = na::Vector2::new(3.0, 0.0);
        let dy = na::Vector2::new(0.0, 3.0);

        let right = Calibration::new(2.0, 0.0).unwrap();
        assert_approx_eq!(right.project(dx), 1.5);
        assert_approx_eq!(right.project(dy), 0.0, 1e-6);

        // At 90 degrees upward motion is positive, and rows grow downwards.
        let up = Calibration::new(2.0, 90.0).unwrap();
        assert_approx_eq!(up.project(dy), -1.5);
        assert_approx_eq!(up.project(dx), 0.0, 1e-6);
    }

    #[test]
    fn ruler_scenario() {
        // 40 px spanning 2 mm gives 20 px/mm; a 5 px shift along the
        // direction is a quarter of a millimetre.
        let cal = Calibration::from_measurement(40.0, 2.0, 0.0).unwrap();
        assert_approx_eq!(cal.project(na::Vector2::new(5.0, 0.0)), 0.25);
    }
}
