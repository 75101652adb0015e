//! OpenCV frame capture and optical flow implementations
//!
//! Provides the `VideoCapture`-backed frame source plus the dense Farneback
//! and sparse Lucas-Kanade estimators behind the `froth-flow` traits.

use froth_flow::prelude::v1::*;
use log::*;
use nalgebra as na;
use opencv::core::{no_array, Point2f, Size, TermCriteria, TermCriteria_COUNT, TermCriteria_EPS};
use opencv::imgproc;
use opencv::prelude::*;
use opencv::types::{VectorOfPoint2f, VectorOff32, VectorOfu8};
use opencv::videoio::{
    VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH,
};

/// Upper bound on tracked feature points per region.
pub const MAX_FEATURES: i32 = 100;
/// Minimal corner quality accepted during feature detection.
const FEATURE_QUALITY: f64 = 0.01;
/// Minimal spacing between detected features, in pixels.
const FEATURE_MIN_DISTANCE: f64 = 10.0;

/// Video source selector: a capture device or a file on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoSource {
    Device(i32),
    File(String),
}

impl VideoSource {
    /// Parse a source string; a bare integer selects a device index.
    pub fn parse(source: &str) -> Self {
        match source.parse() {
            Ok(index) => Self::Device(index),
            Err(_) => Self::File(source.into()),
        }
    }

    /// Pacing behaviour matching this source.
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Device(_) => SourceKind::Live,
            Self::File(_) => SourceKind::File,
        }
    }
}

/// `VideoCapture`-backed frame producer.
pub struct CvCapture {
    capture: VideoCapture,
    frame: Mat,
}

impl CvCapture {
    /// Open a device or file.
    ///
    /// Fails when the source cannot be opened; no capture state is created
    /// in that case.
    pub fn open(source: &VideoSource) -> Result<Self> {
        let capture = match source {
            VideoSource::Device(index) => VideoCapture::new(*index, CAP_ANY)?,
            VideoSource::File(path) => VideoCapture::from_file(path, CAP_ANY)?,
        };

        if !capture.is_opened()? {
            return Err(anyhow!("failed to open video source {:?}", source));
        }

        Ok(Self {
            capture,
            frame: Default::default(),
        })
    }
}

impl Capture for CvCapture {
    fn grab(&mut self) -> Result<Option<Frame>> {
        if !self.capture.read(&mut self.frame)? {
            // End of file, or the device went away.
            return Ok(None);
        }

        mat_to_frame(&self.frame).map(Some)
    }

    fn frame_rate(&self) -> Option<f64> {
        self.capture.get(CAP_PROP_FPS).ok().filter(|&fps| fps > 0.0)
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        let width = self.capture.get(CAP_PROP_FRAME_WIDTH).ok()?;
        let height = self.capture.get(CAP_PROP_FRAME_HEIGHT).ok()?;

        if width > 0.0 && height > 0.0 {
            Some((width as u32, height as u32))
        } else {
            None
        }
    }
}

fn mat_to_frame(mat: &Mat) -> Result<Frame> {
    let width = mat.cols() as usize;
    let height = mat.rows() as usize;
    let data = mat.data_bytes()?;

    if data.len() != width * height * 3 {
        return Err(anyhow!(
            "expected an 8-bit BGR frame, got {} bytes for {}x{}",
            data.len(),
            width,
            height
        ));
    }

    Frame::new(data.to_vec(), width, height)
}

fn frame_to_gray(frame: &Frame) -> Result<Mat> {
    let flat = Mat::from_slice(frame.data())?;
    let bgr = flat.reshape(3, frame.height() as i32)?;

    let mut gray = Mat::default();
    imgproc::cvt_color(&bgr, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;

    Ok(gray)
}

/// Dense pyramidal Farneback flow.
///
/// The region displacement is the arithmetic mean of the per-pixel flow
/// field over the whole crop.
pub struct FarnebackFlow {
    params: FarnebackParams,
    prev: Option<Mat>,
    flow: Mat,
}

impl FarnebackFlow {
    pub fn new(params: FarnebackParams) -> Self {
        Self {
            params,
            prev: None,
            flow: Default::default(),
        }
    }
}

impl FlowEstimator for FarnebackFlow {
    fn analyze(&mut self, frame: &Frame) -> Result<Option<na::Vector2<f32>>> {
        let gray = frame_to_gray(frame)?;

        let prev = match self.prev.take() {
            Some(prev) => prev,
            None => {
                self.prev = Some(gray);
                return Ok(None);
            }
        };

        opencv::video::calc_optical_flow_farneback(
            &prev,
            &gray,
            &mut self.flow,
            self.params.pyr_scale() as f64,
            self.params.levels() as i32,
            self.params.winsize() as i32,
            self.params.iterations() as i32,
            self.params.poly_n() as i32,
            self.params.poly_sigma(),
            0,
        )?;

        let mut sum = na::Vector2::zeros();
        let mut cnt = 0usize;

        for y in 0..self.flow.rows() {
            for x in 0..self.flow.cols() {
                let dir: &Point2f = self.flow.at_2d(y, x)?;
                sum += na::Vector2::new(dir.x, dir.y);
                cnt += 1;
            }
        }

        self.prev = Some(gray);

        if cnt > 0 {
            Ok(Some(sum / cnt as f32))
        } else {
            Ok(Some(na::Vector2::zeros()))
        }
    }
}

/// Sparse pyramidal Lucas-Kanade flow over tracked feature points.
///
/// An empty point set triggers redetection of up to [`MAX_FEATURES`] good
/// features in the previous crop; the displacement is the mean motion of the
/// points that tracked successfully.
pub struct LucasKanadeFlow {
    params: LucasKanadeParams,
    prev: Option<Mat>,
    points: VectorOfPoint2f,
}

impl LucasKanadeFlow {
    pub fn new(params: LucasKanadeParams) -> Self {
        Self {
            params,
            prev: None,
            points: VectorOfPoint2f::new(),
        }
    }

    /// Number of feature points currently tracked.
    pub fn tracked_points(&self) -> usize {
        self.points.len()
    }
}

impl FlowEstimator for LucasKanadeFlow {
    fn analyze(&mut self, frame: &Frame) -> Result<Option<na::Vector2<f32>>> {
        let gray = frame_to_gray(frame)?;

        let prev = match self.prev.take() {
            Some(prev) => prev,
            None => {
                self.prev = Some(gray);
                return Ok(None);
            }
        };

        if self.points.is_empty() {
            imgproc::good_features_to_track(
                &prev,
                &mut self.points,
                MAX_FEATURES,
                FEATURE_QUALITY,
                FEATURE_MIN_DISTANCE,
                &no_array()?,
                3,
                false,
                0.04,
            )?;

            trace!("detected {} features", self.points.len());
        }

        if self.points.is_empty() {
            // Featureless region; nothing to track this frame.
            self.prev = Some(gray);
            return Ok(Some(na::Vector2::zeros()));
        }

        let mut next_points = VectorOfPoint2f::new();
        let mut status = VectorOfu8::new();
        let mut err = VectorOff32::new();

        let winsize = self.params.winsize() as i32;

        opencv::video::calc_optical_flow_pyr_lk(
            &prev,
            &gray,
            &self.points,
            &mut next_points,
            &mut status,
            &mut err,
            Size::new(winsize, winsize),
            self.params.max_level() as i32,
            criteria(self.params.term())?,
            0,
            1e-4,
        )?;

        let mut survivors = VectorOfPoint2f::new();
        let mut sum = na::Vector2::zeros();

        for ((old, new), ok) in self
            .points
            .iter()
            .zip(next_points.iter())
            .zip(status.iter())
        {
            if ok != 0 {
                sum += na::Vector2::new(new.x - old.x, new.y - old.y);
                survivors.push(new);
            }
        }

        self.prev = Some(gray);

        if survivors.is_empty() {
            // Every point was lost; redetect on the next call.
            self.points = VectorOfPoint2f::new();
            return Ok(Some(na::Vector2::zeros()));
        }

        let mean = sum / survivors.len() as f32;
        self.points = survivors;

        Ok(Some(mean))
    }
}

fn criteria(term: TermCriterion) -> Result<TermCriteria> {
    let (typ, max_count, epsilon) = match term {
        TermCriterion::Eps(eps) => (TermCriteria_EPS, 0, eps),
        TermCriterion::Count(n) => (TermCriteria_COUNT, n as i32, 0.0),
        TermCriterion::Both(n, eps) => (TermCriteria_COUNT + TermCriteria_EPS, n as i32, eps),
    };

    TermCriteria::new(typ, max_count, epsilon).map_err(Into::into)
}

/// Estimator factory for the OpenCV backends.
pub struct CvEstimatorFactory;

impl EstimatorFactory for CvEstimatorFactory {
    fn create(&self, params: &FlowParams) -> Result<Box<dyn FlowEstimator>> {
        Ok(match *params {
            FlowParams::Farneback(params) => Box::new(FarnebackFlow::new(params)),
            FlowParams::LucasKanade(params) => Box::new(LucasKanadeFlow::new(params)),
        })
    }
}
