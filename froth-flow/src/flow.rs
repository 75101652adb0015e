//! # Optical flow estimation
//!
//! The estimator trait plus the validated parameter sets for the two
//! supported algorithms. Concrete implementations live in backend crates.

use crate::prelude::v1::*;
use nalgebra as na;
use serde::{Deserialize, Serialize};

/// Selector name of the dense Farneback algorithm.
pub const FARNEBACK: &str = "farneback";
/// Selector name of the sparse Lucas-Kanade algorithm.
pub const LUCAS_KANADE: &str = "lucas-kanade";

/// Per-region optical flow displacement estimator.
///
/// Estimators are stateful and expect sequential crops of the same region.
pub trait FlowEstimator: Send {
    /// Estimate the mean pixel displacement against the previous crop.
    ///
    /// The very first call on a fresh estimator stores the crop and returns
    /// `Ok(None)`: there is no prior frame yet, which is distinct from zero
    /// motion. Subsequent calls return the mean 2D displacement in pixels.
    ///
    /// # Arguments
    ///
    /// * `frame` - the current crop of the tracked region.
    fn analyze(&mut self, frame: &Frame) -> Result<Option<na::Vector2<f32>>>;
}

/// Parameters of the dense pyramidal Farneback algorithm.
///
/// Constructed through [`FarnebackParams::new`], which restricts every field
/// to its legal values.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FarnebackParams {
    pyr_scale: f32,
    levels: u32,
    winsize: u32,
    iterations: u32,
    poly_n: u32,
    poly_sigma: f64,
}

impl FarnebackParams {
    /// Legal pyramid scale factors.
    pub const PYR_SCALES: [f32; 4] = [0.3, 0.5, 0.7, 0.9];

    /// Create a validated parameter set.
    ///
    /// # Arguments
    ///
    /// * `pyr_scale` - pyramid scale, one of [`Self::PYR_SCALES`].
    /// * `levels` - pyramid levels, `1..=5`.
    /// * `winsize` - averaging window size, odd, `5..=21`.
    /// * `iterations` - iterations per pyramid level, `1..=10`.
    /// * `poly_n` - polynomial expansion neighbourhood, `5` or `7`.
    /// * `poly_sigma` - Gaussian smoothing sigma, positive.
    pub fn new(
        pyr_scale: f32,
        levels: u32,
        winsize: u32,
        iterations: u32,
        poly_n: u32,
        poly_sigma: f64,
    ) -> Result<Self> {
        if !Self::PYR_SCALES.contains(&pyr_scale) {
            return Err(anyhow!("illegal pyramid scale {}", pyr_scale));
        }

        if !(1..=5).contains(&levels) {
            return Err(anyhow!("illegal pyramid level count {}", levels));
        }

        if winsize % 2 == 0 || !(5..=21).contains(&winsize) {
            return Err(anyhow!("illegal window size {}", winsize));
        }

        if !(1..=10).contains(&iterations) {
            return Err(anyhow!("illegal iteration count {}", iterations));
        }

        if poly_n != 5 && poly_n != 7 {
            return Err(anyhow!("illegal polynomial neighbourhood {}", poly_n));
        }

        if poly_sigma <= 0.0 {
            return Err(anyhow!("polynomial sigma must be positive"));
        }

        Ok(Self {
            pyr_scale,
            levels,
            winsize,
            iterations,
            poly_n,
            poly_sigma,
        })
    }

    pub fn pyr_scale(&self) -> f32 {
        self.pyr_scale
    }

    pub fn levels(&self) -> u32 {
        self.levels
    }

    pub fn winsize(&self) -> u32 {
        self.winsize
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn poly_n(&self) -> u32 {
        self.poly_n
    }

    pub fn poly_sigma(&self) -> f64 {
        self.poly_sigma
    }
}

impl Default for FarnebackParams {
    fn default() -> Self {
        Self {
            pyr_scale: 0.5,
            levels: 3,
            winsize: 15,
            iterations: 3,
            poly_n: 7,
            poly_sigma: 1.5,
        }
    }
}

/// Iteration stop condition of the Lucas-Kanade search.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum TermCriterion {
    /// Stop once the search window moves by less than epsilon.
    Eps(f64),
    /// Stop after a fixed number of iterations.
    Count(u32),
    /// Stop on whichever of the two comes first.
    Both(u32, f64),
}

/// Parameters of the sparse pyramidal Lucas-Kanade algorithm.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LucasKanadeParams {
    winsize: u32,
    max_level: u32,
    term: TermCriterion,
}

impl LucasKanadeParams {
    /// Legal square search window sizes.
    pub const WINDOW_SIZES: [u32; 4] = [5, 9, 15, 21];

    /// Create a validated parameter set.
    ///
    /// # Arguments
    ///
    /// * `winsize` - search window size, one of [`Self::WINDOW_SIZES`].
    /// * `max_level` - maximal pyramid level, `0..=5`.
    /// * `term` - iteration stop condition.
    pub fn new(winsize: u32, max_level: u32, term: TermCriterion) -> Result<Self> {
        if !Self::WINDOW_SIZES.contains(&winsize) {
            return Err(anyhow!("illegal window size {}", winsize));
        }

        if max_level > 5 {
            return Err(anyhow!("illegal pyramid level {}", max_level));
        }

        match term {
            TermCriterion::Eps(eps) | TermCriterion::Both(_, eps) if eps <= 0.0 => {
                return Err(anyhow!("epsilon must be positive"))
            }
            TermCriterion::Count(n) | TermCriterion::Both(n, _) if n == 0 => {
                return Err(anyhow!("iteration count must be positive"))
            }
            _ => {}
        }

        Ok(Self {
            winsize,
            max_level,
            term,
        })
    }

    pub fn winsize(&self) -> u32 {
        self.winsize
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn term(&self) -> TermCriterion {
        self.term
    }
}

impl Default for LucasKanadeParams {
    fn default() -> Self {
        Self {
            winsize: 15,
            max_level: 2,
            term: TermCriterion::Both(10, 0.03),
        }
    }
}

/// Algorithm selection with its parameter set.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum FlowParams {
    Farneback(FarnebackParams),
    LucasKanade(LucasKanadeParams),
}

impl FlowParams {
    /// Resolve an algorithm selector to its default parameter set.
    ///
    /// An unknown selector is a configuration error and fails
    /// deterministically rather than defaulting.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            FARNEBACK => Ok(Self::Farneback(Default::default())),
            LUCAS_KANADE => Ok(Self::LucasKanade(Default::default())),
            _ => Err(anyhow!("unknown flow algorithm {:?}", name)),
        }
    }

    /// Selector name of the chosen algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Farneback(_) => FARNEBACK,
            Self::LucasKanade(_) => LUCAS_KANADE,
        }
    }
}

impl Default for FlowParams {
    fn default() -> Self {
        Self::Farneback(Default::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn farneback_legal_values() {
        assert!(FarnebackParams::new(0.5, 3, 15, 3, 7, 1.5).is_ok());
        assert!(FarnebackParams::new(0.4, 3, 15, 3, 7, 1.5).is_err());
        assert!(FarnebackParams::new(0.5, 0, 15, 3, 7, 1.5).is_err());
        assert!(FarnebackParams::new(0.5, 3, 16, 3, 7, 1.5).is_err());
        assert!(FarnebackParams::new(0.5, 3, 23, 3, 7, 1.5).is_err());
        assert!(FarnebackParams::new(0.5, 3, 15, 11, 7, 1.5).is_err());
        assert!(FarnebackParams::new(0.5, 3, 15, 3, 6, 1.5).is_err());
        assert!(FarnebackParams::new(0.5, 3, 15, 3, 7, 0.0).is_err());
    }

    #[test]
    fn lucas_kanade_legal_values() {
        assert!(LucasKanadeParams::new(15, 2, TermCriterion::Both(10, 0.03)).is_ok());
        assert!(LucasKanadeParams::new(7, 2, TermCriterion::Both(10, 0.03)).is_err());
        assert!(LucasKanadeParams::new(15, 6, TermCriterion::Both(10, 0.03)).is_err());
        assert!(LucasKanadeParams::new(15, 2, TermCriterion::Eps(0.0)).is_err());
        assert!(LucasKanadeParams::new(15, 2, TermCriterion::Count(0)).is_err());
    }

    #[test]
    fn selector_resolution() {
        assert_eq!(FlowParams::from_name("farneback").unwrap().name(), FARNEBACK);
        assert_eq!(
            FlowParams::from_name("lucas-kanade").unwrap().name(),
            LUCAS_KANADE
        );
        assert!(FlowParams::from_name("horn-schunck").is_err());
    }
}
